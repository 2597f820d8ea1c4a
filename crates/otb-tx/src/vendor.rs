//! Vendor format classification
//!
//! Deterministic, first-match ordered rules over the producing protocol, the
//! topic or node path, and selected metadata keys. Classification never fails:
//! malformed vendor structures degrade to `Generic` with the reason recorded
//! under `classify.degraded`, and every record leaves with a concrete tag.

use otb_core::{ProtocolRecord, ProtocolType, VendorFormat};

/// Sparkplug B topic namespace prefix
const SPARKPLUG_PREFIX: &str = "spBv1.0/";

/// Sparkplug B lifecycle message types
const SPARKPLUG_MESSAGE_TYPES: [&str; 6] =
    ["NBIRTH", "NDATA", "NDEATH", "DBIRTH", "DDATA", "DDEATH"];

/// Honeywell Experion composite-point attribute suffixes
const HONEYWELL_SUFFIXES: [&str; 7] =
    [".PVEUHI", ".PVEULO", ".PVUNITS", ".PVBAD", ".PV", ".SP", ".OP"];

/// Assign a vendor format to a record.
///
/// Mutates only `vendor_format` and `metadata` keys under the vendor's
/// namespace (plus `classify.degraded` on malformed input). Rules higher in
/// the list win.
pub fn classify(record: &mut ProtocolRecord) {
    record.vendor_format = match record.protocol_type {
        ProtocolType::Mqtt => classify_mqtt(record),
        ProtocolType::Opcua => classify_opcua(record),
        ProtocolType::Modbus => VendorFormat::Modbus,
    };
}

fn classify_mqtt(record: &mut ProtocolRecord) -> VendorFormat {
    if record.topic_or_path.starts_with(SPARKPLUG_PREFIX) {
        return classify_sparkplug(record);
    }
    if let Some(rest) = record.topic_or_path.strip_prefix("kepware/") {
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() == 3 && segments.iter().all(|s| !s.is_empty()) {
            record
                .metadata
                .insert("kepware.channel".into(), segments[0].into());
            record
                .metadata
                .insert("kepware.device".into(), segments[1].into());
            record
                .metadata
                .insert("kepware.tag".into(), segments[2].into());
            return VendorFormat::Kepware;
        }
        return degrade(record, "kepware topic is not channel/device/tag");
    }
    VendorFormat::Generic
}

/// Topic shape: `spBv1.0/<group_id>/<message_type>/<edge_node_id>[/<device_id>]`
fn classify_sparkplug(record: &mut ProtocolRecord) -> VendorFormat {
    let rest = &record.topic_or_path[SPARKPLUG_PREFIX.len()..];
    let segments: Vec<&str> = rest.split('/').collect();
    if !(3..=4).contains(&segments.len()) || segments.iter().any(|s| s.is_empty()) {
        return degrade(record, "sparkplug topic has wrong segment count");
    }
    let message_type = segments[1];
    if !SPARKPLUG_MESSAGE_TYPES.contains(&message_type) {
        return degrade(record, "unknown sparkplug message type");
    }

    record
        .metadata
        .insert("sparkplug.group_id".into(), segments[0].into());
    record
        .metadata
        .insert("sparkplug.message_type".into(), message_type.into());
    record
        .metadata
        .insert("sparkplug.edge_node_id".into(), segments[2].into());
    if let Some(device_id) = segments.get(3) {
        record
            .metadata
            .insert("sparkplug.device_id".into(), (*device_id).into());
    }
    // Payload-level sequence counters arrive under bare keys from the MQTT
    // client; carry them into the sparkplug namespace.
    if let Some(seq) = record.metadata.get("seq").cloned() {
        record.metadata.insert("sparkplug.seq".into(), seq);
    }
    if let Some(bd_seq) = record.metadata.get("bdSeq").cloned() {
        record.metadata.insert("sparkplug.bdSeq".into(), bd_seq);
    }
    VendorFormat::SparkplugB
}

fn classify_opcua(record: &mut ProtocolRecord) -> VendorFormat {
    let browse_path = record
        .metadata
        .get("opcua.browse_path")
        .cloned()
        .unwrap_or_else(|| record.topic_or_path.clone());

    // Kepware organizes its OPC-UA address space as Channel.Device.Tag nodes.
    if let Some((channel, device, tag)) = kepware_node_segment(&browse_path) {
        record.metadata.insert("kepware.channel".into(), channel);
        record.metadata.insert("kepware.device".into(), device);
        record.metadata.insert("kepware.tag".into(), tag);
        return VendorFormat::Kepware;
    }

    if let Some((point, attribute)) = honeywell_composite_point(&browse_path) {
        record
            .metadata
            .insert("honeywell.point".into(), point);
        record
            .metadata
            .insert("honeywell.attribute".into(), attribute);
        return VendorFormat::Honeywell;
    }

    VendorFormat::Opcua
}

/// Match a path whose final segment is a Kepware `Channel.Device.Tag` triple.
fn kepware_node_segment(path: &str) -> Option<(String, String, String)> {
    let segment = path.rsplit('/').next()?;
    let segment = segment.strip_prefix("ns=2;s=").unwrap_or(segment);
    let parts: Vec<&str> = segment.split('.').collect();
    if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
        // A dotted triple ending in a Honeywell attribute is a composite
        // point, not a Kepware node; leave it for the next rule.
        let suffix = format!(".{}", parts[2]);
        if HONEYWELL_SUFFIXES.contains(&suffix.as_str()) {
            return None;
        }
        return Some((parts[0].into(), parts[1].into(), parts[2].into()));
    }
    None
}

/// Match a Honeywell composite point: base identifier plus attribute suffix.
fn honeywell_composite_point(path: &str) -> Option<(String, String)> {
    let segment = path.rsplit('/').next()?;
    for suffix in HONEYWELL_SUFFIXES {
        if let Some(point) = segment.strip_suffix(suffix) {
            if !point.is_empty() {
                return Some((point.to_string(), suffix.to_string()));
            }
        }
    }
    None
}

fn degrade(record: &mut ProtocolRecord, reason: &str) -> VendorFormat {
    record
        .metadata
        .insert("classify.degraded".into(), reason.into());
    VendorFormat::Generic
}
