//! Protocol server discovery
//!
//! Operators probe candidate endpoints before configuring them as sources.
//! The registry delegates the actual reachability check to the injected
//! client factory's `test_connection`, so no raw protocol probing lives in
//! the bridge, and remembers what it has seen for `/api/discovery/servers`.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use otb_core::{ClientFactory, CredentialStore, ProtocolType, SourceSpec};

/// One probed endpoint and its latest outcome
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredServer {
    pub endpoint: String,
    pub protocol_type: ProtocolType,
    pub reachable: bool,
    pub error: Option<String>,
    pub checked_at: String,
}

/// `/api/discovery/scan` and `/api/discovery/test` request body
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeRequest {
    pub protocol_type: ProtocolType,
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub credentials_ref: Option<String>,
}

pub struct DiscoveryRegistry {
    factory: Arc<dyn ClientFactory>,
    credentials: Arc<dyn CredentialStore>,
    servers: Mutex<Vec<DiscoveredServer>>,
}

impl DiscoveryRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            factory,
            credentials,
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Probe each endpoint and record the outcome.
    pub async fn scan(&self, request: ProbeRequest) -> Vec<DiscoveredServer> {
        let mut results = Vec::with_capacity(request.endpoints.len());
        for endpoint in &request.endpoints {
            results.push(
                self.probe(request.protocol_type, endpoint, request.credentials_ref.clone())
                    .await,
            );
        }
        let mut servers = self.servers.lock().unwrap();
        for result in &results {
            servers.retain(|s| s.endpoint != result.endpoint);
            servers.push(result.clone());
        }
        results
    }

    /// Probe a single endpoint without recording it.
    pub async fn probe(
        &self,
        protocol_type: ProtocolType,
        endpoint: &str,
        credentials_ref: Option<String>,
    ) -> DiscoveredServer {
        let spec = SourceSpec {
            name: format!("discovery-{}", endpoint),
            protocol_type,
            endpoint: endpoint.to_string(),
            enabled: false,
            subscription_mode: true,
            polling_interval_ms: 1_000,
            isa95_hints: None,
            credentials_ref,
        };
        let outcome = match self.factory.build(&spec, self.credentials.as_ref()) {
            Ok(mut client) => client.test_connection().await,
            Err(e) => Err(e),
        };
        DiscoveredServer {
            endpoint: endpoint.to_string(),
            protocol_type,
            reachable: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
            checked_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Everything scanned so far
    pub fn servers(&self) -> Vec<DiscoveredServer> {
        self.servers.lock().unwrap().clone()
    }
}
