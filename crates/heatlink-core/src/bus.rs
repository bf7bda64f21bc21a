//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process publish/subscribe bus for local consumers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use heatlink_common::config::BusConfig;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::job::{Job, JobQueue};
use crate::settings::SettingUpdateRequest;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Full device snapshot, sent only when it changed.
    Snapshot(Arc<Snapshot>),
    /// `{"id": [..]}` batch addressed to the controller side.
    DeviceAck(Value),
}

/// Local fan-out of bridge events. Slow subscribers lose old events, never block publishers.
#[derive(Debug, Clone)]
pub struct LocalBus {
    events: broadcast::Sender<BusEvent>,
    snapshot_file: Option<PathBuf>,
    inbound: Option<(JobQueue, u8)>,
}

impl LocalBus {
    pub fn new(config: &BusConfig) -> Self {
        let (events, _) = broadcast::channel(config.capacity.max(1));
        Self {
            events,
            snapshot_file: config.snapshot_file.clone(),
            inbound: None,
        }
    }

    /// Accept setting updates from local subscribers onto `queue` at `priority`.
    pub fn with_inbound(mut self, queue: JobQueue, priority: u8) -> Self {
        self.inbound = Some((queue, priority));
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub fn publish_snapshot(&self, snapshot: &Snapshot) {
        if let Some(path) = &self.snapshot_file {
            match serde_json::to_vec(snapshot) {
                Ok(bytes) => {
                    if let Err(err) = heatlink_persistence::write_atomic(path, &bytes) {
                        warn!(path = %path.display(), error = %err, "failed to write snapshot file");
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialise snapshot"),
            }
        }
        let receivers = self
            .events
            .send(BusEvent::Snapshot(Arc::new(snapshot.clone())))
            .unwrap_or(0);
        debug!(receivers, "snapshot published");
    }

    pub fn publish_device_ack(&self, ack: Value) {
        let receivers = self.events.send(BusEvent::DeviceAck(ack)).unwrap_or(0);
        debug!(receivers, "device acknowledgement published");
    }

    /// Turn a local setting change into a `setSettingData` job.
    pub fn submit_settings(&self, request: SettingUpdateRequest) -> Result<()> {
        let (queue, priority) = self
            .inbound
            .as_ref()
            .context("local bus does not accept inbound settings")?;
        if request.is_empty() {
            return Ok(());
        }
        Job::settings(*priority, request).submit(queue);
        Ok(())
    }

    pub fn submit_settings_json(&self, raw: &str) -> Result<()> {
        let request =
            SettingUpdateRequest::parse(raw).context("invalid setting update from local bus")?;
        self.submit_settings(request)
    }
}
