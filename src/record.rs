//! Sensor data records and batches.
//!
//! A [`SensorRecord`] is one telemetry event produced by a development-activity
//! sensor. Records carry six fixed fields plus an ordered list of free-form
//! key/value properties, and are transmitted to the server in ordered
//! [`RecordBatch`]es.

use chrono::{DateTime, SecondsFormat, Utc};

/// The six field names that are reserved in key/value maps handed to
/// `add`-style operations. Any other key becomes a record property.
pub const RESERVED_KEYS: [&str; 6] = [
    "timestamp",
    "runtime",
    "owner",
    "tool",
    "sensorDataType",
    "resource",
];

/// Tool name used when a key/value map does not name one.
pub const DEFAULT_TOOL: &str = "unknown";

/// A single telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRecord {
    /// When the observed event occurred.
    pub timestamp: DateTime<Utc>,

    /// The sensor process run this event belongs to.
    pub runtime: DateTime<Utc>,

    /// User identifier owning the event.
    pub owner: String,

    /// Short name of the tool that produced the event.
    pub tool: String,

    /// The kind of sensor data (e.g. "DevEvent").
    pub sensor_data_type: String,

    /// Opaque resource identifier, often a URI.
    pub resource: String,

    /// Ordered free-form properties. Keys are distinct and never collide
    /// with the six reserved field names.
    pub properties: Vec<(String, String)>,
}

/// Errors produced while constructing or validating a record.
#[derive(Debug)]
pub enum ValidationError {
    /// A required field is empty.
    MissingField(&'static str),

    /// A timestamp-valued entry could not be parsed.
    BadTimestamp { field: String, value: String },

    /// The same key appeared more than once in one record.
    DuplicateKey(String),

    /// A property key collides with one of the reserved field names.
    ReservedKey(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingField(field) => {
                write!(f, "Required field '{}' is missing or empty", field)
            }
            ValidationError::BadTimestamp { field, value } => {
                write!(f, "Can't parse '{}' as the {} timestamp", value, field)
            }
            ValidationError::DuplicateKey(key) => {
                write!(f, "Key '{}' appears more than once", key)
            }
            ValidationError::ReservedKey(key) => {
                write!(f, "Property key '{}' collides with a record field", key)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl SensorRecord {
    /// Create a record with the given mandatory fields and no properties.
    ///
    /// `timestamp` and `runtime` are both set to `now`.
    pub fn new(
        owner: impl Into<String>,
        tool: impl Into<String>,
        sensor_data_type: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now,
            runtime: now,
            owner: owner.into(),
            tool: tool.into(),
            sensor_data_type: sensor_data_type.into(),
            resource: resource.into(),
            properties: Vec::new(),
        }
    }

    /// Append a property, preserving insertion order.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Build a record from ordered key/value pairs.
    ///
    /// The reserved keys become record fields; everything else becomes a
    /// property in the order given. Missing `timestamp`/`runtime` default to
    /// now, `owner` defaults to `default_owner`, `tool` to
    /// [`DEFAULT_TOOL`], and `resource`/`sensorDataType` to the empty string.
    pub fn from_key_vals(
        pairs: &[(String, String)],
        default_owner: &str,
    ) -> Result<Self, ValidationError> {
        let now = Utc::now();
        let mut timestamp = None;
        let mut runtime = None;
        let mut owner = None;
        let mut tool = None;
        let mut sensor_data_type = None;
        let mut resource = None;
        let mut properties: Vec<(String, String)> = Vec::new();

        for (key, value) in pairs {
            let duplicate = match key.as_str() {
                "timestamp" => timestamp
                    .replace(parse_timestamp("timestamp", value)?)
                    .is_some(),
                "runtime" => runtime.replace(parse_timestamp("runtime", value)?).is_some(),
                "owner" => owner.replace(value.clone()).is_some(),
                "tool" => tool.replace(value.clone()).is_some(),
                "sensorDataType" => sensor_data_type.replace(value.clone()).is_some(),
                "resource" => resource.replace(value.clone()).is_some(),
                _ => {
                    if properties.iter().any(|(k, _)| k == key) {
                        true
                    } else {
                        properties.push((key.clone(), value.clone()));
                        false
                    }
                }
            };
            if duplicate {
                return Err(ValidationError::DuplicateKey(key.clone()));
            }
        }

        let record = Self {
            timestamp: timestamp.unwrap_or(now),
            runtime: runtime.unwrap_or(now),
            owner: owner.unwrap_or_else(|| default_owner.to_string()),
            tool: tool.unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            sensor_data_type: sensor_data_type.unwrap_or_default(),
            resource: resource.unwrap_or_default(),
            properties,
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the record invariants: non-empty owner and tool, distinct
    /// property keys, and no property key shadowing a field name.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner.is_empty() {
            return Err(ValidationError::MissingField("owner"));
        }
        if self.tool.is_empty() {
            return Err(ValidationError::MissingField("tool"));
        }
        for (i, (key, _)) in self.properties.iter().enumerate() {
            if RESERVED_KEYS.contains(&key.as_str()) {
                return Err(ValidationError::ReservedKey(key.clone()));
            }
            if self.properties[..i].iter().any(|(k, _)| k == key) {
                return Err(ValidationError::DuplicateKey(key.clone()));
            }
        }
        Ok(())
    }
}

/// An ordered sequence of records transmitted (or spooled) as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatch {
    /// The records, in the order they were added to the shell buffer.
    pub records: Vec<SensorRecord>,
}

impl RecordBatch {
    /// Create a batch from a vector of records.
    pub fn new(records: Vec<SensorRecord>) -> Self {
        Self { records }
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Format a timestamp the way the server expects it: RFC 3339, UTC,
/// millisecond precision.
pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp, normalizing any offset to UTC.
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::BadTimestamp {
            field: field.to_string(),
            value: value.to_string(),
        })
}
