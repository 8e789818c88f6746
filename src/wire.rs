//! XML serialization of record batches.
//!
//! The ingestion server and the on-disk spool share one document format:
//! a `<SensorDatas>` root holding zero or more `<SensorData>` children with
//! a fixed child-element order. The writer produces a formatted document;
//! the parser accepts any whitespace and normalizes timestamp offsets to
//! UTC.

use roxmltree::Document;

use crate::record::{format_timestamp, parse_timestamp, RecordBatch, SensorRecord};

/// Errors produced while reading a batch document.
#[derive(Debug)]
pub enum WireError {
    /// The document is not well-formed XML.
    Malformed(String),

    /// The root element is not `<SensorDatas>`.
    UnexpectedRoot(String),

    /// A required child element is absent.
    MissingElement(&'static str),

    /// A timestamp element holds an unparseable value.
    BadTimestamp { element: &'static str, value: String },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Malformed(e) => write!(f, "Malformed batch document: {}", e),
            WireError::UnexpectedRoot(name) => {
                write!(f, "Expected <SensorDatas> root, found <{}>", name)
            }
            WireError::MissingElement(elem) => {
                write!(f, "Missing <{}> element in sensor data", elem)
            }
            WireError::BadTimestamp { element, value } => {
                write!(f, "Can't parse <{}> value '{}'", element, value)
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Serialize a batch to the wire/spool document format.
pub fn to_xml(batch: &RecordBatch) -> String {
    let mut out = String::with_capacity(256 + batch.len() * 256);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<SensorDatas>\n");
    for record in &batch.records {
        out.push_str("  <SensorData>\n");
        push_element(&mut out, 4, "Timestamp", &format_timestamp(record.timestamp));
        push_element(&mut out, 4, "Runtime", &format_timestamp(record.runtime));
        push_element(&mut out, 4, "Owner", &record.owner);
        push_element(&mut out, 4, "Tool", &record.tool);
        push_element(&mut out, 4, "Resource", &record.resource);
        push_element(&mut out, 4, "SensorDataType", &record.sensor_data_type);
        if !record.properties.is_empty() {
            out.push_str("    <Properties>\n");
            for (key, value) in &record.properties {
                out.push_str("      <Property>\n");
                push_element(&mut out, 8, "Key", key);
                push_element(&mut out, 8, "Value", value);
                out.push_str("      </Property>\n");
            }
            out.push_str("    </Properties>\n");
        }
        out.push_str("  </SensorData>\n");
    }
    out.push_str("</SensorDatas>\n");
    out
}

/// Parse a batch document, preserving record and property order.
pub fn from_xml(text: &str) -> Result<RecordBatch, WireError> {
    let doc = Document::parse(text).map_err(|e| WireError::Malformed(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "SensorDatas" {
        return Err(WireError::UnexpectedRoot(root.tag_name().name().to_string()));
    }

    let mut records = Vec::new();
    for node in root
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "SensorData")
    {
        records.push(parse_record(&node)?);
    }
    Ok(RecordBatch::new(records))
}

fn parse_record(node: &roxmltree::Node<'_, '_>) -> Result<SensorRecord, WireError> {
    let timestamp = required_text(node, "Timestamp")?;
    let runtime = required_text(node, "Runtime")?;

    let mut properties = Vec::new();
    if let Some(props) = child_element(node, "Properties") {
        for prop in props
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "Property")
        {
            let key = required_text(&prop, "Key")?;
            let value = required_text(&prop, "Value")?;
            properties.push((key, value));
        }
    }

    Ok(SensorRecord {
        timestamp: parse_timestamp("Timestamp", &timestamp).map_err(|_| {
            WireError::BadTimestamp {
                element: "Timestamp",
                value: timestamp.clone(),
            }
        })?,
        runtime: parse_timestamp("Runtime", &runtime).map_err(|_| WireError::BadTimestamp {
            element: "Runtime",
            value: runtime.clone(),
        })?,
        owner: required_text(node, "Owner")?,
        tool: required_text(node, "Tool")?,
        resource: required_text(node, "Resource")?,
        sensor_data_type: required_text(node, "SensorDataType")?,
        properties,
    })
}

fn child_element<'a, 'input>(
    node: &roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn required_text(node: &roxmltree::Node<'_, '_>, name: &'static str) -> Result<String, WireError> {
    let child = child_element(node, name).ok_or(WireError::MissingElement(name))?;
    Ok(child.text().unwrap_or_default().to_string())
}

fn push_element(out: &mut String, indent: usize, name: &str, text: &str) {
    for _ in 0..indent {
        out.push(' ');
    }
    out.push('<');
    out.push_str(name);
    out.push('>');
    push_escaped(out, text);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
    out.push('\n');
}

fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
}
