//! The unified record model
//!
//! Every protocol client, whatever its wire format, produces [`ProtocolRecord`]s.
//! A record is immutable once produced; pipeline stages that need to augment it
//! (vendor classification, ISA-95 normalization) take it by `&mut` before it is
//! enqueued and never after. Downstream of the queue the record only moves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock;

/// The protocol that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Opcua,
    Mqtt,
    Modbus,
}

impl ProtocolType {
    /// Stable lowercase label used in metrics and diagnostics keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Opcua => "opcua",
            ProtocolType::Mqtt => "mqtt",
            ProtocolType::Modbus => "modbus",
        }
    }

    /// The URL scheme(s) a source endpoint for this protocol must use
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            ProtocolType::Opcua => &["opc.tcp"],
            ProtocolType::Mqtt => &["mqtt", "mqtts"],
            ProtocolType::Modbus => &["modbus"],
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor format assigned by the classifier
///
/// `Unknown` only exists pre-classification; the classifier always assigns a
/// concrete tag, with `Generic` as the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorFormat {
    Kepware,
    SparkplugB,
    Honeywell,
    Opcua,
    Modbus,
    Generic,
    Unknown,
}

impl VendorFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorFormat::Kepware => "kepware",
            VendorFormat::SparkplugB => "sparkplug_b",
            VendorFormat::Honeywell => "honeywell",
            VendorFormat::Opcua => "opcua",
            VendorFormat::Modbus => "modbus",
            VendorFormat::Generic => "generic",
            VendorFormat::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VendorFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-level projection of the protocol-native quality code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    Good,
    Uncertain,
    Bad,
}

impl QualityStatus {
    /// Project a protocol-native status code onto the three-level scale.
    ///
    /// OPC-UA encodes severity in the top two bits of the status code
    /// (00 good, 01 uncertain, 10/11 bad). Modbus and MQTT carry no native
    /// quality, so anything non-zero is treated as bad.
    pub fn from_code(protocol: ProtocolType, code: i32) -> Self {
        match protocol {
            ProtocolType::Opcua => match (code as u32) >> 30 {
                0b00 => QualityStatus::Good,
                0b01 => QualityStatus::Uncertain,
                _ => QualityStatus::Bad,
            },
            ProtocolType::Mqtt | ProtocolType::Modbus => {
                if code == 0 {
                    QualityStatus::Good
                } else {
                    QualityStatus::Bad
                }
            }
        }
    }
}

/// Primitive sample value carried by a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Numeric projection used for analytics columns; `None` for
    /// non-numeric payloads (booleans project to 0/1).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Str(s) => s.parse().ok(),
            Value::Bytes(_) => None,
        }
    }

    /// Human label for the value's type
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::I64(_) => "int64",
            Value::F64(_) => "float64",
            Value::Bool(_) => "boolean",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }

    /// In-memory payload size, used for byte-budget accounting
    pub fn payload_len(&self) -> usize {
        match self {
            Value::I64(_) | Value::F64(_) => 8,
            Value::Bool(_) => 1,
            Value::Str(s) => s.len(),
            Value::Bytes(b) => b.len(),
        }
    }
}

/// ISA-95 equipment hierarchy slice attached to a record
///
/// All levels are optional; the normalizer fills what it can derive from the
/// source configuration and the vendor-specific path structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isa95Path {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
}

impl Isa95Path {
    pub fn is_empty(&self) -> bool {
        self.enterprise.is_none()
            && self.site.is_none()
            && self.area.is_none()
            && self.line.is_none()
            && self.equipment.is_none()
    }

    /// Overlay `other` onto `self`, filling only levels still unset.
    pub fn fill_from(&mut self, other: &Isa95Path) {
        macro_rules! fill {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field.clone();
                }
            };
        }
        fill!(enterprise);
        fill!(site);
        fill!(area);
        fill!(line);
        fill!(equipment);
    }
}

/// The unified telemetry record flowing through the bridge
///
/// Produced by a protocol client callback, enriched by the classifier and
/// normalizer, then serialized into an ingest batch. Timestamps are UTC
/// nanoseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    /// Device-reported sample time; equals `ingest_time_ns` when the device
    /// reported none
    pub event_time_ns: i64,
    /// Time the record entered the bridge
    pub ingest_time_ns: i64,
    /// Logical name of the configured source
    pub source_name: String,
    /// Connection URL (`opc.tcp://…`, `mqtt(s)://…`, `modbus://…`)
    pub endpoint: String,
    /// Producing protocol
    pub protocol_type: ProtocolType,
    /// Node path, MQTT topic, or register address with unit id
    pub topic_or_path: String,
    /// Primitive sample value
    pub value: Value,
    /// Numeric projection of `value` for analytics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_num: Option<f64>,
    /// Human label for the value's type
    pub value_type: String,
    /// Protocol-native quality code
    pub status_code: i32,
    /// Three-level projection of `status_code`
    pub status: QualityStatus,
    /// Protocol-specific attributes (browse path, Sparkplug seq, register kind)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Assigned by the vendor classifier; `Unknown` until classification
    pub vendor_format: VendorFormat,
    /// Filled by the ISA-95 normalizer
    #[serde(default, skip_serializing_if = "Isa95Path::is_empty")]
    pub isa95: Isa95Path,
    /// W3C-style identifier if the source exposed a Thing Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thing_id: Option<String>,
    /// Ontology annotation (e.g. `PowerSensor`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_type: Option<String>,
    /// Unit identifier (e.g. a QUDT URI)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_uri: Option<String>,
}

impl ProtocolRecord {
    /// Create a record at the bridge boundary.
    ///
    /// Fills `ingest_time_ns` from the wall clock and defaults
    /// `event_time_ns` to it; clients that know the device-reported sample
    /// time overwrite `event_time_ns` afterwards.
    pub fn new(
        source_name: impl Into<String>,
        endpoint: impl Into<String>,
        protocol_type: ProtocolType,
        topic_or_path: impl Into<String>,
        value: Value,
    ) -> Self {
        let now = clock::wall_ns();
        let value_num = value.as_f64();
        let value_type = value.type_label().to_string();
        Self {
            event_time_ns: now,
            ingest_time_ns: now,
            source_name: source_name.into(),
            endpoint: endpoint.into(),
            protocol_type,
            topic_or_path: topic_or_path.into(),
            value,
            value_num,
            value_type,
            status_code: 0,
            status: QualityStatus::Good,
            metadata: BTreeMap::new(),
            vendor_format: VendorFormat::Unknown,
            isa95: Isa95Path::default(),
            thing_id: None,
            semantic_type: None,
            unit_uri: None,
        }
    }

    /// Set the protocol-native status code and its projection together
    pub fn with_status_code(mut self, code: i32) -> Self {
        self.status_code = code;
        self.status = QualityStatus::from_code(self.protocol_type, code);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Rough in-memory footprint, used for queue and batch byte budgets.
    /// Intentionally an estimate; exact wire size is known only after
    /// protobuf encoding.
    pub fn approx_bytes(&self) -> usize {
        let meta: usize = self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        64 + self.source_name.len()
            + self.endpoint.len()
            + self.topic_or_path.len()
            + self.value.payload_len()
            + meta
    }
}
