//! Bridge configuration
//!
//! The bridge is configured from a single YAML document describing sources,
//! the ingest (zerobus) target, queue/spool behavior, rate limits, breaker
//! tuning, and the operator web UI. Environment variables override the
//! connection-material zerobus fields after parse.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! sources:
//!   - name: press-line-plc
//!     protocol_type: opcua
//!     endpoint: "opc.tcp://10.0.4.17:4840"
//!     isa95_hints:
//!       enterprise: acme
//!       site: hamburg
//! zerobus:
//!   enabled: true
//!   workspace_host: "https://acme.cloud.example.com"
//!   zerobus_endpoint: "https://ingest.example.com:443"
//!   default_target:
//!     catalog: edge
//!     schema: ot
//!     table: telemetry
//!   auth:
//!     client_id: "svc-bridge"
//!     client_secret_ref: "zerobus-secret"
//! queue:
//!   max_in_memory: 10000
//!   spill_enabled: true
//!   spill_path: /var/lib/otb/spool
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::record::{Isa95Path, ProtocolType};

/// A secret value that never leaves the process in readable form.
///
/// `Display`, `Debug`, and serde serialization all render `***`. The
/// backing bytes are zeroed on drop.
#[derive(Clone, Default, Deserialize)]
#[serde(from = "String")]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Access the secret bytes. Call sites are the audit surface; keep them few.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if self.0.is_empty() { "" } else { "***" })
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        for b in bytes.iter_mut() {
            *b = 0;
        }
    }
}

/// Per-source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Logical name; unique across the bridge
    pub name: String,

    /// Producing protocol; constrains the endpoint scheme
    pub protocol_type: ProtocolType,

    /// Connection URL (`opc.tcp://…`, `mqtt(s)://…`, `modbus://…`)
    pub endpoint: String,

    /// Disabled sources are kept in config but never supervised
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Subscribe to change notifications when true; poll otherwise
    #[serde(default = "default_true")]
    pub subscription_mode: bool,

    /// Poll cadence when `subscription_mode` is false
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Explicit ISA-95 hierarchy; takes precedence over structural extraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isa95_hints: Option<Isa95Path>,

    /// Name under which the credential store holds this source's secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
}

impl SourceSpec {
    /// Validate this source in isolation: non-empty name, an endpoint whose
    /// scheme matches the protocol, and a sane polling interval.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.name.is_empty() {
            return Err(BridgeError::ConfigInvalid("source with empty name".into()));
        }
        let schemes = self.protocol_type.schemes();
        let ok = schemes
            .iter()
            .any(|scheme| self.endpoint.starts_with(&format!("{scheme}://")));
        if !ok {
            return Err(BridgeError::ConfigInvalid(format!(
                "source '{}': endpoint '{}' must use scheme {:?} for protocol {}",
                self.name, self.endpoint, schemes, self.protocol_type
            )));
        }
        if !self.subscription_mode && self.polling_interval_ms == 0 {
            return Err(BridgeError::ConfigInvalid(format!(
                "source '{}': polling_interval_ms must be > 0 in polling mode",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether replacing `self` with `other` requires a connection restart.
    ///
    /// Name and hierarchy hints are reconciled in place; everything touching
    /// the session is connection-material.
    pub fn connection_material_differs(&self, other: &SourceSpec) -> bool {
        self.protocol_type != other.protocol_type
            || self.endpoint != other.endpoint
            || self.subscription_mode != other.subscription_mode
            || self.polling_interval_ms != other.polling_interval_ms
            || self.credentials_ref != other.credentials_ref
    }
}

/// Three-part ingest destination identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestTarget {
    pub catalog: String,
    pub schema: String,
    pub table: String,
}

impl IngestTarget {
    /// Parse a `catalog.schema.table` string; anything else is `TargetInvalid`.
    pub fn parse(s: &str) -> Result<Self, BridgeError> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [catalog, schema, table]
                if !catalog.is_empty() && !schema.is_empty() && !table.is_empty() =>
            {
                Ok(IngestTarget {
                    catalog: catalog.to_string(),
                    schema: schema.to_string(),
                    table: table.to_string(),
                })
            }
            _ => Err(BridgeError::TargetInvalid(format!(
                "expected catalog.schema.table, got '{s}'"
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.catalog.is_empty() || self.schema.is_empty() || self.table.is_empty() {
            return Err(BridgeError::TargetInvalid(self.to_string()));
        }
        if [&self.catalog, &self.schema, &self.table]
            .iter()
            .any(|p| p.contains('.'))
        {
            return Err(BridgeError::TargetInvalid(self.to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for IngestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

/// OAuth client-credentials configuration for the ingest stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZerobusAuthSpec {
    pub client_id: String,
    /// Name of the secret in the credential store; the secret itself never
    /// appears in config files
    #[serde(default)]
    pub client_secret_ref: String,
}

/// Outbound proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySpec {
    /// Honor `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`
    #[serde(default)]
    pub use_env_vars: bool,
    /// Explicit proxy URL; wins over environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Cloud ingest (zerobus) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZerobusSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Workspace host serving `/oidc/v1/token`
    pub workspace_host: String,
    /// gRPC ingest endpoint
    pub zerobus_endpoint: String,
    pub default_target: IngestTarget,
    pub auth: ZerobusAuthSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,
}

/// What to evict when both memory and spool are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Reject the incoming record
    DropNewest,
    /// Evict the oldest queued record to admit the incoming one
    DropOldest,
}

/// Bounded queue and disk spool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    #[serde(default = "default_max_in_memory")]
    pub max_in_memory: usize,
    /// Spill to disk once memory occupancy crosses this percentage
    #[serde(default = "default_high_watermark_pct")]
    pub high_watermark_pct: u8,
    #[serde(default)]
    pub spill_enabled: bool,
    #[serde(default = "default_spill_path")]
    pub spill_path: PathBuf,
    #[serde(default = "default_spill_max_bytes")]
    pub spill_max_bytes: u64,
    #[serde(default = "default_spill_segment_bytes")]
    pub spill_segment_bytes: u64,
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicy,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            max_in_memory: default_max_in_memory(),
            high_watermark_pct: default_high_watermark_pct(),
            spill_enabled: false,
            spill_path: default_spill_path(),
            spill_max_bytes: default_spill_max_bytes(),
            spill_segment_bytes: default_spill_segment_bytes(),
            drop_policy: default_drop_policy(),
        }
    }
}

/// Token-bucket limits on the ingest stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    #[serde(default = "default_records_per_sec")]
    pub records_per_sec: u64,
    #[serde(default = "default_bytes_per_sec")]
    pub bytes_per_sec: u64,
    /// Bucket size as a multiple of the per-second rate
    #[serde(default = "default_burst_mult")]
    pub burst_mult: f64,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self {
            records_per_sec: default_records_per_sec(),
            bytes_per_sec: default_bytes_per_sec(),
            burst_mult: default_burst_mult(),
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSpec {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_breaker_cool_down_ms")]
    pub cool_down_ms: u64,
    #[serde(default = "default_breaker_cool_down_max_ms")]
    pub cool_down_max_ms: u64,
}

impl Default for BreakerSpec {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            window_ms: default_breaker_window_ms(),
            cool_down_ms: default_breaker_cool_down_ms(),
            cool_down_max_ms: default_breaker_cool_down_max_ms(),
        }
    }
}

/// Authentication gate for the operator API.
///
/// RBAC and MFA enforcement live in the external auth layer; the bridge only
/// honors the on/off gate and the bearer token check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebAuthSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub require_mfa: bool,
    #[serde(default)]
    pub rbac_roles: Vec<String>,
}

/// Operator web API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebUiSpec {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: WebAuthSpec,
}

impl Default for WebUiSpec {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth: WebAuthSpec::default(),
        }
    }
}

/// Complete bridge specification loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSpec {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zerobus: Option<ZerobusSpec>,
    #[serde(default)]
    pub queue: QueueSpec,
    #[serde(default)]
    pub rate_limit: RateLimitSpec,
    #[serde(default)]
    pub breaker: BreakerSpec,
    #[serde(default)]
    pub web_ui: WebUiSpec,
}

impl BridgeSpec {
    /// Parse a YAML document into a spec. Validation is separate so callers
    /// can apply environment overrides in between.
    pub fn from_yaml(yaml: &str) -> Result<Self, BridgeError> {
        serde_yaml::from_str(yaml).map_err(|e| BridgeError::ConfigInvalid(e.to_string()))
    }

    /// Apply environment-variable overrides to the zerobus connection fields.
    ///
    /// `WORKSPACE_HOST`, `INGEST_ENDPOINT`, `CLIENT_ID`, and `CLIENT_SECRET`
    /// override their config counterparts when present. `CLIENT_SECRET` is
    /// returned to the caller rather than stored so the spec stays printable.
    pub fn apply_env_overrides(&mut self, env: &BTreeMap<String, String>) -> Option<Secret> {
        let zerobus = self.zerobus.as_mut()?;
        if let Some(host) = env.get("WORKSPACE_HOST") {
            zerobus.workspace_host = host.clone();
        }
        if let Some(endpoint) = env.get("INGEST_ENDPOINT") {
            zerobus.zerobus_endpoint = endpoint.clone();
        }
        if let Some(client_id) = env.get("CLIENT_ID") {
            zerobus.auth.client_id = client_id.clone();
        }
        env.get("CLIENT_SECRET").map(|s| Secret::new(s.clone()))
    }

    /// Validate the whole document. Violations refuse startup (exit code 2).
    pub fn validate(&self) -> Result<(), BridgeError> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.name.as_str()) {
                return Err(BridgeError::ConfigInvalid(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }

        if self.queue.max_in_memory == 0 {
            return Err(BridgeError::ConfigInvalid(
                "queue.max_in_memory must be > 0".into(),
            ));
        }
        if !(1..=100).contains(&self.queue.high_watermark_pct) {
            return Err(BridgeError::ConfigInvalid(
                "queue.high_watermark_pct must be in 1..=100".into(),
            ));
        }
        if self.rate_limit.records_per_sec == 0 || self.rate_limit.bytes_per_sec == 0 {
            return Err(BridgeError::ConfigInvalid(
                "rate_limit rates must be > 0".into(),
            ));
        }
        if self.rate_limit.burst_mult < 1.0 {
            return Err(BridgeError::ConfigInvalid(
                "rate_limit.burst_mult must be >= 1.0".into(),
            ));
        }
        if self.breaker.threshold == 0 {
            return Err(BridgeError::ConfigInvalid(
                "breaker.threshold must be > 0".into(),
            ));
        }

        if let Some(zerobus) = &self.zerobus {
            if zerobus.enabled {
                if zerobus.workspace_host.is_empty() {
                    return Err(BridgeError::ConfigInvalid(
                        "zerobus.workspace_host is required".into(),
                    ));
                }
                if zerobus.zerobus_endpoint.is_empty() {
                    return Err(BridgeError::ConfigInvalid(
                        "zerobus.zerobus_endpoint is required".into(),
                    ));
                }
                zerobus.default_target.validate()?;
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.name == name)
    }
}

fn default_true() -> bool {
    true
}
fn default_polling_interval_ms() -> u64 {
    1_000
}
fn default_max_in_memory() -> usize {
    10_000
}
fn default_high_watermark_pct() -> u8 {
    80
}
fn default_spill_path() -> PathBuf {
    PathBuf::from("./spool")
}
fn default_spill_max_bytes() -> u64 {
    1024 * 1024 * 1024
}
fn default_spill_segment_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_drop_policy() -> DropPolicy {
    DropPolicy::DropNewest
}
fn default_records_per_sec() -> u64 {
    500
}
fn default_bytes_per_sec() -> u64 {
    5 * 1024 * 1024
}
fn default_burst_mult() -> f64 {
    2.0
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_window_ms() -> u64 {
    60_000
}
fn default_breaker_cool_down_ms() -> u64 {
    10_000
}
fn default_breaker_cool_down_max_ms() -> u64 {
    300_000
}
fn default_bind() -> String {
    "127.0.0.1:8480".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
sources:
  - name: s1
    protocol_type: opcua
    endpoint: "opc.tcp://10.0.0.5:4840"
zerobus:
  workspace_host: "https://acme.example.com"
  zerobus_endpoint: "https://ingest.example.com:443"
  default_target:
    catalog: edge
    schema: ot
    table: telemetry
  auth:
    client_id: svc
    client_secret_ref: zerobus-secret
"#
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let spec = BridgeSpec::from_yaml(minimal_yaml()).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.sources.len(), 1);
        assert!(spec.sources[0].enabled);
        assert!(spec.sources[0].subscription_mode);
        assert_eq!(spec.queue.high_watermark_pct, 80);
        assert_eq!(spec.rate_limit.records_per_sec, 500);
        assert_eq!(spec.breaker.threshold, 5);
    }

    #[test]
    fn rejects_duplicate_source_names() {
        let mut spec = BridgeSpec::from_yaml(minimal_yaml()).unwrap();
        spec.sources.push(spec.sources[0].clone());
        let err = spec.validate().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn rejects_scheme_protocol_mismatch() {
        let mut spec = BridgeSpec::from_yaml(minimal_yaml()).unwrap();
        spec.sources[0].endpoint = "mqtt://broker:1883".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn target_parse_requires_three_parts() {
        assert!(IngestTarget::parse("edge.ot.telemetry").is_ok());
        assert!(IngestTarget::parse("edge.telemetry").is_err());
        assert!(IngestTarget::parse("edge..telemetry").is_err());
        assert!(IngestTarget::parse("a.b.c.d").is_err());
    }

    #[test]
    fn env_overrides_replace_connection_fields() {
        let mut spec = BridgeSpec::from_yaml(minimal_yaml()).unwrap();
        let mut env = BTreeMap::new();
        env.insert("WORKSPACE_HOST".to_string(), "https://other.example".to_string());
        env.insert("CLIENT_SECRET".to_string(), "hunter2".to_string());
        let secret = spec.apply_env_overrides(&env);
        assert_eq!(
            spec.zerobus.as_ref().unwrap().workspace_host,
            "https://other.example"
        );
        assert_eq!(secret.unwrap().expose(), "hunter2");
    }

    #[test]
    fn secrets_never_render() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s}"), "***");
        assert_eq!(format!("{s:?}"), "Secret(***)");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"***\"");
    }

    #[test]
    fn connection_material_change_detection() {
        let spec = BridgeSpec::from_yaml(minimal_yaml()).unwrap();
        let a = spec.sources[0].clone();
        let mut b = a.clone();
        b.isa95_hints = Some(Isa95Path {
            area: Some("press".into()),
            ..Default::default()
        });
        assert!(!a.connection_material_differs(&b));
        b.endpoint = "opc.tcp://10.0.0.6:4840".into();
        assert!(a.connection_material_differs(&b));
    }
}
