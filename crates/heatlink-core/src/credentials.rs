//! ---
//! ems_section: "06-security-access-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device identity resolution and access-token lifecycle."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use heatlink_common::IdentityConfig;
use heatlink_metrics::BridgeMetrics;
use heatlink_persistence::{CredentialStore, IdentityStore};
use tracing::{debug, info, warn};

use crate::backend::Backend;

/// Device identity: config override, then the credential file, then the identity file.
pub fn resolve_identity(config: &IdentityConfig) -> Result<u64> {
    if let Some(device_id) = config.device_id {
        return Ok(device_id);
    }
    let credentials = CredentialStore::new(&config.credential_file);
    let stored = credentials
        .load()
        .with_context(|| format!("failed to read {}", config.credential_file.display()))?;
    if let Some(record) = stored.filter(|record| record.device_id != 0) {
        return Ok(record.device_id);
    }
    let identity = IdentityStore::new(&config.identity_file);
    match identity
        .load()
        .with_context(|| format!("failed to read {}", config.identity_file.display()))?
    {
        Some(device_id) => Ok(device_id),
        None => bail!(
            "no device identity: set identity.device_id or provide {}",
            config.identity_file.display()
        ),
    }
}

/// Holds the access token and reacts to backend rejections.
pub struct CredentialManager {
    device_id: u64,
    token: String,
    denied: u32,
    threshold: u32,
    store: CredentialStore,
    identity: IdentityStore,
    backend: Arc<dyn Backend>,
    metrics: Option<BridgeMetrics>,
}

impl CredentialManager {
    pub fn new(
        device_id: u64,
        config: &IdentityConfig,
        threshold: u32,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            device_id,
            token: String::new(),
            denied: 0,
            threshold,
            store: CredentialStore::new(&config.credential_file),
            identity: IdentityStore::new(&config.identity_file),
            backend,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Empty when no token is held.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn denied_count(&self) -> u32 {
        self.denied
    }

    /// Load the stored token, provisioning one when none is on disk.
    pub async fn bootstrap(&mut self) {
        match self.store.load() {
            Ok(Some(record)) if record.has_token() && record.device_id == self.device_id => {
                debug!(device_id = self.device_id, "using stored access token");
                self.token = record.token;
                return;
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "credential file unreadable; provisioning"),
        }
        if let Err(err) = self.provision().await {
            warn!(device_id = self.device_id, error = %err, "provisioning failed; continuing without token");
        }
    }

    /// One token exchange; on success both files are rewritten.
    pub async fn provision(&mut self) -> Result<()> {
        let token = self
            .backend
            .request_token(self.device_id)
            .await
            .context("token exchange failed")?;
        self.store
            .store_token(self.device_id, &token)
            .context("failed to persist access token")?;
        self.identity
            .save(self.device_id)
            .context("failed to persist device identity")?;
        self.token = token;
        info!(device_id = self.device_id, "access token provisioned");
        Ok(())
    }

    /// Count a rejection; at the threshold drop the token and refresh once.
    pub async fn observe_denied(&mut self) {
        self.denied += 1;
        debug!(denied = self.denied, threshold = self.threshold, "backend denied access");
        if self.denied < self.threshold {
            return;
        }
        warn!(device_id = self.device_id, "access token rejected repeatedly; refreshing");
        self.denied = 0;
        self.token.clear();
        if let Err(err) = self.store.store_token(self.device_id, "") {
            warn!(error = %err, "failed to clear stored access token");
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_token_refresh();
        }
        if let Err(err) = self.provision().await {
            warn!(error = %err, "token refresh failed; waiting for next threshold");
        }
    }

    pub fn observe_accepted(&mut self) {
        self.denied = 0;
    }
}
