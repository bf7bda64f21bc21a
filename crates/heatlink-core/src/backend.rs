//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Backend exchange used by posting and credential refresh."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Context;
use async_trait::async_trait;
use heatlink_common::BackendConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::settings::{SettingUpdateRequest, SettingsError};
use crate::snapshot::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend answered with status {0}")]
    Status(u16),
    #[error("backend reply could not be decoded: {0}")]
    Decode(String),
    #[error("backend exchange is disabled")]
    Disabled,
}

/// Fields the bridge reads from a backend reply. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    #[serde(rename = "Access", default)]
    pub access: Option<String>,
    #[serde(rename = "accesstoken", alias = "AccessToken", default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub update: Option<Value>,
    #[serde(default)]
    pub up: Option<Value>,
    #[serde(default)]
    pub online: Option<Value>,
}

fn flag(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

impl BackendReply {
    pub fn granted() -> Self {
        Self {
            access: Some("Granted".to_owned()),
            ..Self::default()
        }
    }

    pub fn is_denied(&self) -> bool {
        self.access.as_deref() == Some("Denied")
    }

    /// Command envelope, present when `update == 1`.
    pub fn update_request(&self) -> Option<Result<SettingUpdateRequest, SettingsError>> {
        if self.update.as_ref().and_then(flag) != Some(1) {
            return None;
        }
        let up = self.up.as_ref()?;
        Some(match up {
            Value::String(raw) => SettingUpdateRequest::parse(raw),
            other => SettingUpdateRequest::from_json(other),
        })
    }

    pub fn online(&self) -> Option<bool> {
        match self.online.as_ref().and_then(flag)? {
            1 => Some(true),
            0 => Some(false),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|token| !token.is_empty())
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn post(&self, body: &Snapshot) -> Result<BackendReply, BackendError>;

    /// Exchange the device identity with an empty token for a fresh token.
    async fn request_token(&self, device_id: u64) -> Result<String, BackendError> {
        let mut body = Snapshot::new();
        body.insert("pumpid".into(), json!(device_id));
        body.insert("accesstoken".into(), json!(""));
        let reply = self.post(&body).await?;
        reply
            .token()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Decode("reply carried no access token".into()))
    }
}

/// JSON-over-HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    url: Url,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let url = config.parsed_url()?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build backend http client")?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn post(&self, body: &Snapshot) -> Result<BackendReply, BackendError> {
        let response = self.client.post(self.url.clone()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        let text = response.text().await?;
        let reply = serde_json::from_str(&text)
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        debug!(status = status.as_u16(), "backend reply received");
        Ok(reply)
    }
}

/// Logs outbound bodies instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct DryRunBackend;

#[async_trait]
impl Backend for DryRunBackend {
    async fn post(&self, body: &Snapshot) -> Result<BackendReply, BackendError> {
        let rendered = serde_json::to_string(body).unwrap_or_default();
        info!(body = %rendered, "dry run: backend post skipped");
        Ok(BackendReply::granted())
    }

    async fn request_token(&self, device_id: u64) -> Result<String, BackendError> {
        info!(device_id, "dry run: token request skipped");
        Err(BackendError::Disabled)
    }
}
