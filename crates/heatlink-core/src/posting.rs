//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Periodic upload of buffered results and handling of backend replies."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use heatlink_common::BackendConfig;
use heatlink_metrics::BridgeMetrics;
use heatlink_rt::RateLimiter;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendReply};
use crate::credentials::CredentialManager;
use crate::job::{Job, JobQueue};
use crate::snapshot::OutboundBuffer;

/// How one posting attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    Accepted,
    Denied,
    Failed,
}

impl PostOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PostOutcome::Accepted => "accepted",
            PostOutcome::Denied => "denied",
            PostOutcome::Failed => "failed",
        }
    }
}

pub struct PostingLoop {
    config: BackendConfig,
    settings_priority: u8,
    backend: Arc<dyn Backend>,
    credentials: CredentialManager,
    outbound: OutboundBuffer,
    queue: JobQueue,
    online: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    metrics: Option<BridgeMetrics>,
}

impl PostingLoop {
    pub fn new(
        config: BackendConfig,
        settings_priority: u8,
        backend: Arc<dyn Backend>,
        credentials: CredentialManager,
        outbound: OutboundBuffer,
        queue: JobQueue,
    ) -> Self {
        let (online, _) = watch::channel(false);
        let (connected, _) = watch::channel(false);
        Self {
            config,
            settings_priority,
            backend,
            credentials,
            outbound,
            queue,
            online,
            connected,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Backend-requested dense polling.
    pub fn online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Whether the last post reached the backend.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        self.credentials.bootstrap().await;
        let mut limiter =
            RateLimiter::starting_after(self.config.initial_delay, self.config.post_interval);
        info!(device_id = self.credentials.device_id(), "posting loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("posting loop shutdown");
                    break;
                }
                _ = limiter.tick() => {
                    self.post_once().await;
                }
                _ = self.outbound.send_requested() => {
                    // A wakeup left over from a batch already sent by an earlier post.
                    if !self.outbound.has_confirmations() {
                        continue;
                    }
                    debug!("confirmations pending; posting early");
                    self.post_once().await;
                    limiter.reset();
                }
            }
        }
        Ok(())
    }

    /// Drain, post and interpret. The buffer is empty afterwards whatever the result.
    pub async fn post_once(&mut self) -> PostOutcome {
        let mut body = self.outbound.drain();
        body.insert("pumpid".into(), json!(self.credentials.device_id()));
        body.insert("accesstoken".into(), json!(self.credentials.token()));

        let outcome = match self.backend.post(&body).await {
            Ok(reply) => {
                self.connected.send_replace(true);
                self.interpret(reply).await
            }
            Err(err) => {
                warn!(error = %err, "backend post failed; buffered data dropped");
                self.connected.send_replace(false);
                PostOutcome::Failed
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_post(outcome.as_str());
        }
        outcome
    }

    async fn interpret(&mut self, reply: BackendReply) -> PostOutcome {
        if reply.is_denied() {
            self.credentials.observe_denied().await;
            return PostOutcome::Denied;
        }
        self.credentials.observe_accepted();

        match reply.update_request() {
            Some(Ok(request)) if !request.is_empty() => {
                info!(keys = request.len(), "remote setting change received");
                Job::settings(self.settings_priority, request).submit(&self.queue);
            }
            Some(Ok(_)) | None => {}
            Some(Err(err)) => warn!(error = %err, "ignoring malformed setting envelope"),
        }
        if let Some(online) = reply.online() {
            self.online.send_if_modified(|current| {
                let changed = *current != online;
                if changed {
                    info!(online, "secondary polling toggled");
                }
                *current = online;
                changed
            });
        }
        PostOutcome::Accepted
    }
}
