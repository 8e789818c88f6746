//! Test support: a minimal scripted ingestion server.
//!
//! Speaks just enough HTTP/1.1 for the relay's three operations. Tests
//! flip the liveness/registration switches, script PUT statuses, and read
//! back the PUT bodies the "server" received.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub(crate) struct StubServer {
    addr: SocketAddr,
    state: Arc<StubState>,
    accept_task: JoinHandle<()>,
}

struct StubState {
    /// GET / answers 200 when true, 503 when false.
    ping_ok: AtomicBool,

    /// GET /users/<user> answers 200 when true, 401 when false.
    registered: AtomicBool,

    /// Delay applied before answering /users/ requests.
    users_delay_ms: AtomicU64,

    /// Scripted statuses for upcoming PUTs; empty means 201.
    put_statuses: Mutex<VecDeque<u16>>,

    /// Bodies of every PUT /sensordata received, in arrival order.
    put_bodies: Mutex<Vec<String>>,
}

impl StubServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(StubState {
            ping_ok: AtomicBool::new(true),
            registered: AtomicBool::new(true),
            users_delay_ms: AtomicU64::new(0),
            put_statuses: Mutex::new(VecDeque::new()),
            put_bodies: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, conn_state).await;
                });
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Base URL of the stub, with trailing slash.
    pub(crate) fn host(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub(crate) fn set_ping_ok(&self, ok: bool) {
        self.state.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.state.registered.store(registered, Ordering::SeqCst);
    }

    pub(crate) fn set_users_delay(&self, delay: Duration) {
        self.state
            .users_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Queue a status for the next unscripted PUT.
    pub(crate) fn script_put_status(&self, status: u16) {
        self.state
            .put_statuses
            .lock()
            .unwrap()
            .push_back(status);
    }

    pub(crate) fn put_bodies(&self) -> Vec<String> {
        self.state.put_bodies.lock().unwrap().clone()
    }

    /// Total records acknowledged across all successful PUTs.
    pub(crate) fn acknowledged_records(&self) -> usize {
        self.put_bodies()
            .iter()
            .filter_map(|body| crate::wire::from_xml(body).ok())
            .map(|batch| batch.len())
            .sum()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// A URL no server listens on: bind an ephemeral port, then release it.
pub(crate) async fn unreachable_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/", addr)
}

async fn handle_connection(mut stream: TcpStream, state: Arc<StubState>) -> std::io::Result<()> {
    let Some((method, path, body)) = read_request(&mut stream).await? else {
        return Ok(());
    };

    let (status, ack_body) = match (method.as_str(), path.as_str()) {
        ("GET", "/") | ("HEAD", "/") => {
            if state.ping_ok.load(Ordering::SeqCst) {
                (200, false)
            } else {
                (503, false)
            }
        }
        ("GET", p) if p.starts_with("/users/") => {
            let delay = state.users_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if state.registered.load(Ordering::SeqCst) {
                (200, false)
            } else {
                (401, false)
            }
        }
        ("PUT", "/sensordata") => {
            let status = state
                .put_statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(201);
            (status, (200..300).contains(&status))
        }
        _ => (404, false),
    };

    if ack_body {
        state.put_bodies.lock().unwrap().push(body);
    }

    let reason = match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Read one request: (method, path, body). Returns `None` on an empty
/// connection (client connected and closed).
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<(String, String, String)>> {
    let mut raw: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        raw.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = header_text.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .next()
        .unwrap_or(0);

    let body_start = header_end + 4;
    while raw.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
    }
    let body_end = (body_start + content_length).min(raw.len());
    let body = String::from_utf8_lossy(&raw[body_start..body_end]).to_string();

    Ok(Some((method, path, body)))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}
