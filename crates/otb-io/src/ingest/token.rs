//! OAuth2 client-credentials token source
//!
//! The workspace host issues bearer tokens at `/oidc/v1/token`. Tokens are
//! cached and reused until shortly before expiry; a 401 from the ingest
//! service invalidates the cache so the next attempt fetches a fresh one.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use otb_core::{BridgeError, ProxySpec, Secret};

/// Refresh this long before the advertised expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Something that can produce a bearer token for the ingest stream
#[async_trait]
pub trait BearerSource: Send + Sync {
    async fn bearer(&self) -> Result<String, BridgeError>;

    /// Drop any cached token; the next `bearer` call must fetch anew
    fn invalidate(&self);
}

/// Fixed token, for tests and demo deployments without an identity provider
pub struct StaticBearer(pub String);

#[async_trait]
impl BearerSource for StaticBearer {
    async fn bearer(&self) -> Result<String, BridgeError> {
        Ok(self.0.clone())
    }

    fn invalidate(&self) {}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3_600
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Client-credentials token source against the workspace host
pub struct TokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(
        workspace_host: &str,
        client_id: &str,
        client_secret: Secret,
        proxy: Option<&ProxySpec>,
    ) -> Result<Self, BridgeError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        match proxy {
            Some(spec) => {
                if let Some(url) = &spec.url {
                    let proxy = reqwest::Proxy::all(url)
                        .map_err(|e| BridgeError::ConfigInvalid(format!("proxy url: {e}")))?;
                    builder = builder.proxy(proxy);
                } else if !spec.use_env_vars {
                    builder = builder.no_proxy();
                }
                // use_env_vars: reqwest honors HTTP(S)_PROXY / NO_PROXY itself
            }
            None => builder = builder.no_proxy(),
        }
        let http = builder
            .build()
            .map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;
        Ok(Self {
            http,
            token_url: format!("{}/oidc/v1/token", workspace_host.trim_end_matches('/')),
            client_id: client_id.to_string(),
            client_secret,
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<CachedToken, BridgeError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    BridgeError::NetworkUnreachable(format!("token endpoint: {e}"))
                } else {
                    BridgeError::Internal(anyhow::Error::new(e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(BridgeError::AuthFailed(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(BridgeError::ProtocolError(format!(
                "token endpoint returned {status}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::ProtocolError(format!("token response: {e}")))?;
        tracing::debug!("obtained ingest token");
        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }
}

#[async_trait]
impl BearerSource for TokenSource {
    async fn bearer(&self) -> Result<String, BridgeError> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some(token) = cached.as_ref() {
                if Instant::now() + EXPIRY_MARGIN < token.expires_at {
                    return Ok(token.access_token.clone());
                }
            }
        }
        let fresh = self.fetch().await?;
        let token = fresh.access_token.clone();
        *self.cached.lock().unwrap() = Some(fresh);
        Ok(token)
    }

    fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }
}
