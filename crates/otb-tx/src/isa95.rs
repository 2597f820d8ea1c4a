//! ISA-95 hierarchy normalization
//!
//! Fills the record's `{enterprise, site, area, line, equipment}` slice from,
//! in priority order, the source configuration's explicit hints and the
//! structural shape of the topic or path for the assigned vendor format.
//! Missing levels stay empty. Also clamps device-reported event times that
//! run ahead of the bridge clock and applies optional Thing-Description
//! enrichment.

use std::collections::HashMap;

use otb_core::{Isa95Path, ProtocolRecord, SourceSpec, VendorFormat};

/// Device clocks further than this ahead of the bridge are treated as wrong
/// and clamped to the ingest time.
pub const CLOCK_SKEW_BOUND_NS: i64 = 5_000_000_000;

/// What `normalize` did to the record, for the caller's accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    /// Event time violated the skew bound and was clamped to ingest time
    pub clock_clamped: bool,
    /// Thing-Description enrichment was applied
    pub enriched: bool,
}

/// Semantic annotations for a single topic or path, from a Thing Description
#[derive(Debug, Clone, Default)]
pub struct ThingDescription {
    pub thing_id: Option<String>,
    pub semantic_type: Option<String>,
    pub unit_uri: Option<String>,
}

/// Cached Thing-Description annotations for one source, keyed by topic/path.
///
/// A miss is never an error; the semantic fields simply stay empty.
#[derive(Debug, Clone, Default)]
pub struct ThingRegistry {
    entries: HashMap<String, ThingDescription>,
}

impl ThingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, topic_or_path: impl Into<String>, td: ThingDescription) {
        self.entries.insert(topic_or_path.into(), td);
    }

    pub fn lookup(&self, topic_or_path: &str) -> Option<&ThingDescription> {
        self.entries.get(topic_or_path)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize a classified record in place.
///
/// Pure: reads only the record, the source spec, and the optional registry.
pub fn normalize(
    record: &mut ProtocolRecord,
    source: &SourceSpec,
    things: Option<&ThingRegistry>,
) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();

    let mut isa95 = source.isa95_hints.clone().unwrap_or_default();
    isa95.fill_from(&structural_extraction(record));
    record.isa95 = isa95;

    if record.event_time_ns > record.ingest_time_ns + CLOCK_SKEW_BOUND_NS {
        record.event_time_ns = record.ingest_time_ns;
        outcome.clock_clamped = true;
    }

    if let Some(td) = things.and_then(|t| t.lookup(&record.topic_or_path)) {
        record.thing_id = td.thing_id.clone();
        record.semantic_type = td.semantic_type.clone();
        record.unit_uri = td.unit_uri.clone();
        outcome.enriched = true;
    }

    outcome
}

/// Derive hierarchy levels from the vendor-specific path structure.
fn structural_extraction(record: &ProtocolRecord) -> Isa95Path {
    let meta = &record.metadata;
    let mut path = Isa95Path::default();
    match record.vendor_format {
        VendorFormat::Kepware => {
            path.area = meta.get("kepware.channel").cloned();
            path.line = meta.get("kepware.device").cloned();
            path.equipment = meta.get("kepware.tag").cloned();
        }
        VendorFormat::SparkplugB => {
            path.area = meta.get("sparkplug.group_id").cloned();
            path.line = meta.get("sparkplug.edge_node_id").cloned();
            // Device-scoped lifecycle messages name the device; node-scoped
            // ones fall back to the edge node itself.
            let device_scoped = matches!(
                meta.get("sparkplug.message_type").map(String::as_str),
                Some("DBIRTH") | Some("DDATA") | Some("DDEATH")
            );
            path.equipment = if device_scoped {
                meta.get("sparkplug.device_id")
                    .or_else(|| meta.get("sparkplug.edge_node_id"))
                    .cloned()
            } else {
                meta.get("sparkplug.edge_node_id").cloned()
            };
        }
        VendorFormat::Honeywell => {
            path.line = honeywell_module(&record.topic_or_path);
            path.equipment = meta.get("honeywell.point").cloned();
        }
        VendorFormat::Opcua
        | VendorFormat::Modbus
        | VendorFormat::Generic
        | VendorFormat::Unknown => {}
    }
    path
}

/// The Experion module is the path prefix segment, e.g. `FIM_01` in
/// `FIM_01/ANALOG_IN.PV`.
fn honeywell_module(path: &str) -> Option<String> {
    let (module, rest) = path.split_once('/')?;
    if module.is_empty() || rest.is_empty() {
        return None;
    }
    Some(module.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_core::{ProtocolType, Value};

    fn source(hints: Option<Isa95Path>) -> SourceSpec {
        SourceSpec {
            name: "s1".into(),
            protocol_type: ProtocolType::Mqtt,
            endpoint: "mqtt://broker:1883".into(),
            enabled: true,
            subscription_mode: true,
            polling_interval_ms: 1_000,
            isa95_hints: hints,
            credentials_ref: None,
        }
    }

    fn classified(topic: &str) -> ProtocolRecord {
        let mut r = ProtocolRecord::new(
            "s1",
            "mqtt://broker:1883",
            ProtocolType::Mqtt,
            topic,
            Value::F64(123.4),
        );
        crate::vendor::classify(&mut r);
        r
    }

    #[test]
    fn kepware_extraction() {
        let mut r = classified("kepware/Siemens_S7_Crushing/Crusher_01/MotorPower");
        normalize(&mut r, &source(None), None);
        assert_eq!(r.isa95.area.as_deref(), Some("Siemens_S7_Crushing"));
        assert_eq!(r.isa95.line.as_deref(), Some("Crusher_01"));
        assert_eq!(r.isa95.equipment.as_deref(), Some("MotorPower"));
    }

    #[test]
    fn sparkplug_device_vs_node_equipment() {
        let mut ddata = classified("spBv1.0/G/DDATA/E/D");
        normalize(&mut ddata, &source(None), None);
        assert_eq!(ddata.isa95.area.as_deref(), Some("G"));
        assert_eq!(ddata.isa95.line.as_deref(), Some("E"));
        assert_eq!(ddata.isa95.equipment.as_deref(), Some("D"));

        let mut nbirth = classified("spBv1.0/G/NBIRTH/E");
        normalize(&mut nbirth, &source(None), None);
        assert_eq!(nbirth.isa95.equipment.as_deref(), Some("E"));
    }

    #[test]
    fn honeywell_module_and_point() {
        let mut r = ProtocolRecord::new(
            "s1",
            "opc.tcp://exp:4840",
            ProtocolType::Opcua,
            "FIM_01/ANALOG_IN.PV",
            Value::F64(1.0),
        );
        crate::vendor::classify(&mut r);
        normalize(&mut r, &source(None), None);
        assert_eq!(r.isa95.line.as_deref(), Some("FIM_01"));
        assert_eq!(r.isa95.equipment.as_deref(), Some("ANALOG_IN"));
    }

    #[test]
    fn hints_take_precedence_over_structure() {
        let hints = Isa95Path {
            enterprise: Some("acme".into()),
            site: Some("hamburg".into()),
            area: Some("configured-area".into()),
            ..Default::default()
        };
        let mut r = classified("kepware/Channel/Device/Tag");
        normalize(&mut r, &source(Some(hints)), None);
        // Hint wins where set, structure fills the rest.
        assert_eq!(r.isa95.area.as_deref(), Some("configured-area"));
        assert_eq!(r.isa95.line.as_deref(), Some("Device"));
        assert_eq!(r.isa95.enterprise.as_deref(), Some("acme"));
    }

    #[test]
    fn clamps_future_event_times() {
        let mut r = classified("plant/line/tag");
        r.event_time_ns = r.ingest_time_ns + CLOCK_SKEW_BOUND_NS + 1;
        let outcome = normalize(&mut r, &source(None), None);
        assert!(outcome.clock_clamped);
        assert_eq!(r.event_time_ns, r.ingest_time_ns);

        let mut ok = classified("plant/line/tag");
        ok.event_time_ns = ok.ingest_time_ns - 1_000_000;
        let outcome = normalize(&mut ok, &source(None), None);
        assert!(!outcome.clock_clamped);
    }

    #[test]
    fn thing_registry_enrichment_and_miss() {
        let mut registry = ThingRegistry::new();
        registry.insert(
            "plant/line/power",
            ThingDescription {
                thing_id: Some("urn:dev:ops:32473-pwr".into()),
                semantic_type: Some("PowerSensor".into()),
                unit_uri: Some("http://qudt.org/vocab/unit/W".into()),
            },
        );

        let mut hit = classified("plant/line/power");
        let outcome = normalize(&mut hit, &source(None), Some(&registry));
        assert!(outcome.enriched);
        assert_eq!(hit.semantic_type.as_deref(), Some("PowerSensor"));

        let mut miss = classified("plant/line/other");
        let outcome = normalize(&mut miss, &source(None), Some(&registry));
        assert!(!outcome.enriched);
        assert!(miss.thing_id.is_none());
    }
}
