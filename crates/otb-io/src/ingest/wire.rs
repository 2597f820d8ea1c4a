//! Wire messages for the ingest stream
//!
//! Prost message structs mirroring the ingest service's protobuf schema,
//! maintained by hand in the shape `tonic-build` would emit. Field numbers
//! are assigned sequentially here; the authoritative mapping belongs to the
//! service's published proto definition.
//!
//! Spool frames hold the encoded [`WireRecord`] bytes, so whatever is on disk
//! is byte-identical to what a batch would carry.

use std::collections::BTreeMap;

use otb_core::{
    Isa95Path, ProtocolRecord, ProtocolType, QualityStatus, Value, VendorFormat,
};

/// One normalized telemetry record on the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireRecord {
    #[prost(int64, tag = "1")]
    pub event_time_ns: i64,
    #[prost(int64, tag = "2")]
    pub ingest_time_ns: i64,
    #[prost(string, tag = "3")]
    pub source_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub endpoint: ::prost::alloc::string::String,
    #[prost(enumeration = "Protocol", tag = "5")]
    pub protocol: i32,
    #[prost(string, tag = "6")]
    pub topic_or_path: ::prost::alloc::string::String,
    #[prost(oneof = "wire_record::Payload", tags = "7, 8, 9, 10, 11")]
    pub payload: ::core::option::Option<wire_record::Payload>,
    #[prost(double, optional, tag = "12")]
    pub value_num: ::core::option::Option<f64>,
    #[prost(string, tag = "13")]
    pub value_type: ::prost::alloc::string::String,
    #[prost(int32, tag = "14")]
    pub status_code: i32,
    #[prost(enumeration = "Quality", tag = "15")]
    pub status: i32,
    #[prost(btree_map = "string, string", tag = "16")]
    pub metadata: ::prost::alloc::collections::BTreeMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    #[prost(enumeration = "Vendor", tag = "17")]
    pub vendor_format: i32,
    #[prost(message, optional, tag = "18")]
    pub isa95: ::core::option::Option<WireIsa95>,
    #[prost(string, optional, tag = "19")]
    pub thing_id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "20")]
    pub semantic_type: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "21")]
    pub unit_uri: ::core::option::Option<::prost::alloc::string::String>,
}

/// Nested message and enum types in `WireRecord`.
pub mod wire_record {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(int64, tag = "7")]
        IntValue(i64),
        #[prost(double, tag = "8")]
        DoubleValue(f64),
        #[prost(bool, tag = "9")]
        BoolValue(bool),
        #[prost(string, tag = "10")]
        StringValue(::prost::alloc::string::String),
        #[prost(bytes, tag = "11")]
        BytesValue(::prost::alloc::vec::Vec<u8>),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireIsa95 {
    #[prost(string, optional, tag = "1")]
    pub enterprise: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub site: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub area: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "4")]
    pub line: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "5")]
    pub equipment: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Protocol {
    Unspecified = 0,
    Opcua = 1,
    Mqtt = 2,
    Modbus = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Quality {
    Good = 0,
    Uncertain = 1,
    Bad = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Vendor {
    Unknown = 0,
    Kepware = 1,
    SparkplugB = 2,
    Honeywell = 3,
    Opcua = 4,
    Modbus = 5,
    Generic = 6,
}

/// One client message on the stream: a batch of records targeting a table
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireBatch {
    #[prost(uint64, tag = "1")]
    pub batch_id: u64,
    #[prost(message, repeated, tag = "2")]
    pub records: ::prost::alloc::vec::Vec<WireRecord>,
    #[prost(fixed32, tag = "3")]
    pub checksum: u32,
    #[prost(string, tag = "4")]
    pub target: ::prost::alloc::string::String,
}

/// One server message: acknowledgement of a batch
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireAck {
    #[prost(uint64, tag = "1")]
    pub ack_batch_id: u64,
    #[prost(enumeration = "AckStatus", tag = "2")]
    pub status: i32,
    #[prost(string, optional, tag = "3")]
    pub message: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AckStatus {
    Ok = 0,
    InvalidToken = 1,
    SchemaMismatch = 2,
    InternalError = 3,
}

/// CRC32 over the concatenated record encodings, carried as the batch checksum
pub fn batch_checksum(records: &[WireRecord]) -> u32 {
    use prost::Message;
    let mut hasher = crc32fast::Hasher::new();
    for record in records {
        hasher.update(&record.encode_to_vec());
    }
    hasher.finalize()
}

impl From<&ProtocolRecord> for WireRecord {
    fn from(r: &ProtocolRecord) -> Self {
        let payload = match &r.value {
            Value::I64(v) => wire_record::Payload::IntValue(*v),
            Value::F64(v) => wire_record::Payload::DoubleValue(*v),
            Value::Bool(v) => wire_record::Payload::BoolValue(*v),
            Value::Str(v) => wire_record::Payload::StringValue(v.clone()),
            Value::Bytes(v) => wire_record::Payload::BytesValue(v.clone()),
        };
        WireRecord {
            event_time_ns: r.event_time_ns,
            ingest_time_ns: r.ingest_time_ns,
            source_name: r.source_name.clone(),
            endpoint: r.endpoint.clone(),
            protocol: Protocol::from(r.protocol_type) as i32,
            topic_or_path: r.topic_or_path.clone(),
            payload: Some(payload),
            value_num: r.value_num,
            value_type: r.value_type.clone(),
            status_code: r.status_code,
            status: Quality::from(r.status) as i32,
            metadata: r.metadata.clone(),
            vendor_format: Vendor::from(r.vendor_format) as i32,
            isa95: if r.isa95.is_empty() {
                None
            } else {
                Some(WireIsa95 {
                    enterprise: r.isa95.enterprise.clone(),
                    site: r.isa95.site.clone(),
                    area: r.isa95.area.clone(),
                    line: r.isa95.line.clone(),
                    equipment: r.isa95.equipment.clone(),
                })
            },
            thing_id: r.thing_id.clone(),
            semantic_type: r.semantic_type.clone(),
            unit_uri: r.unit_uri.clone(),
        }
    }
}

impl TryFrom<WireRecord> for ProtocolRecord {
    type Error = otb_core::BridgeError;

    fn try_from(w: WireRecord) -> Result<Self, Self::Error> {
        let protocol_type = Protocol::try_from(w.protocol)
            .ok()
            .and_then(protocol_to_core)
            .ok_or_else(|| {
                otb_core::BridgeError::SchemaMismatch(format!(
                    "unknown protocol enum {}",
                    w.protocol
                ))
            })?;
        let value = match w.payload {
            Some(wire_record::Payload::IntValue(v)) => Value::I64(v),
            Some(wire_record::Payload::DoubleValue(v)) => Value::F64(v),
            Some(wire_record::Payload::BoolValue(v)) => Value::Bool(v),
            Some(wire_record::Payload::StringValue(v)) => Value::Str(v),
            Some(wire_record::Payload::BytesValue(v)) => Value::Bytes(v),
            None => {
                return Err(otb_core::BridgeError::SchemaMismatch(
                    "record without payload".into(),
                ))
            }
        };
        let status = match Quality::try_from(w.status).unwrap_or(Quality::Bad) {
            Quality::Good => QualityStatus::Good,
            Quality::Uncertain => QualityStatus::Uncertain,
            Quality::Bad => QualityStatus::Bad,
        };
        let vendor_format = Vendor::try_from(w.vendor_format)
            .map(vendor_to_core)
            .unwrap_or(VendorFormat::Unknown);
        let metadata: BTreeMap<String, String> = w.metadata.into_iter().collect();
        Ok(ProtocolRecord {
            event_time_ns: w.event_time_ns,
            ingest_time_ns: w.ingest_time_ns,
            source_name: w.source_name,
            endpoint: w.endpoint,
            protocol_type,
            topic_or_path: w.topic_or_path,
            value,
            value_num: w.value_num,
            value_type: w.value_type,
            status_code: w.status_code,
            status,
            metadata,
            vendor_format,
            isa95: w
                .isa95
                .map(|i| Isa95Path {
                    enterprise: i.enterprise,
                    site: i.site,
                    area: i.area,
                    line: i.line,
                    equipment: i.equipment,
                })
                .unwrap_or_default(),
            thing_id: w.thing_id,
            semantic_type: w.semantic_type,
            unit_uri: w.unit_uri,
        })
    }
}

impl From<ProtocolType> for Protocol {
    fn from(p: ProtocolType) -> Self {
        match p {
            ProtocolType::Opcua => Protocol::Opcua,
            ProtocolType::Mqtt => Protocol::Mqtt,
            ProtocolType::Modbus => Protocol::Modbus,
        }
    }
}

fn protocol_to_core(p: Protocol) -> Option<ProtocolType> {
    match p {
        Protocol::Opcua => Some(ProtocolType::Opcua),
        Protocol::Mqtt => Some(ProtocolType::Mqtt),
        Protocol::Modbus => Some(ProtocolType::Modbus),
        Protocol::Unspecified => None,
    }
}

impl From<QualityStatus> for Quality {
    fn from(q: QualityStatus) -> Self {
        match q {
            QualityStatus::Good => Quality::Good,
            QualityStatus::Uncertain => Quality::Uncertain,
            QualityStatus::Bad => Quality::Bad,
        }
    }
}

impl From<VendorFormat> for Vendor {
    fn from(v: VendorFormat) -> Self {
        match v {
            VendorFormat::Kepware => Vendor::Kepware,
            VendorFormat::SparkplugB => Vendor::SparkplugB,
            VendorFormat::Honeywell => Vendor::Honeywell,
            VendorFormat::Opcua => Vendor::Opcua,
            VendorFormat::Modbus => Vendor::Modbus,
            VendorFormat::Generic => Vendor::Generic,
            VendorFormat::Unknown => Vendor::Unknown,
        }
    }
}

fn vendor_to_core(v: Vendor) -> VendorFormat {
    match v {
        Vendor::Kepware => VendorFormat::Kepware,
        Vendor::SparkplugB => VendorFormat::SparkplugB,
        Vendor::Honeywell => VendorFormat::Honeywell,
        Vendor::Opcua => VendorFormat::Opcua,
        Vendor::Modbus => VendorFormat::Modbus,
        Vendor::Generic => VendorFormat::Generic,
        Vendor::Unknown => VendorFormat::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    fn sample() -> ProtocolRecord {
        let mut r = ProtocolRecord::new(
            "s1",
            "mqtt://broker:1883",
            ProtocolType::Mqtt,
            "kepware/Chan/Dev/Tag",
            Value::F64(42.5),
        )
        .with_metadata("kepware.channel", "Chan");
        r.vendor_format = VendorFormat::Kepware;
        r.isa95.area = Some("Chan".into());
        r
    }

    #[test]
    fn record_survives_wire_encoding() {
        let original = sample();
        let wire = WireRecord::from(&original);
        let bytes = wire.encode_to_vec();
        let decoded = WireRecord::decode(bytes.as_slice()).unwrap();
        let back = ProtocolRecord::try_from(decoded).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn encoding_is_deterministic() {
        // Spool replay depends on re-encoding producing identical bytes;
        // BTreeMap metadata keeps key order stable.
        let wire = WireRecord::from(&sample());
        assert_eq!(wire.encode_to_vec(), wire.encode_to_vec());
    }

    #[test]
    fn missing_payload_is_schema_mismatch() {
        let mut wire = WireRecord::from(&sample());
        wire.payload = None;
        let err = ProtocolRecord::try_from(wire).unwrap_err();
        assert_eq!(err.reason(), "schema_mismatch");
    }

    #[test]
    fn batch_checksum_tracks_content() {
        let a = WireRecord::from(&sample());
        let mut b = a.clone();
        b.topic_or_path = "other".into();
        assert_ne!(batch_checksum(&[a.clone()]), batch_checksum(&[b]));
        assert_eq!(batch_checksum(&[a.clone()]), batch_checksum(&[a]));
    }
}
