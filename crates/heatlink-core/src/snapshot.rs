//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device snapshot cache, change-only publisher, and outbound buffer."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use heatlink_metrics::BridgeMetrics;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::trace;

use crate::bus::LocalBus;
use crate::settings::WriteBatch;

pub type Snapshot = Map<String, Value>;

/// Merge `partial` into `target`. Objects under the same key merge field-wise;
/// anything else is overwritten.
pub fn merge_into(target: &mut Snapshot, partial: Snapshot) {
    for (key, value) in partial {
        match value {
            Value::Object(fields) => match target.get_mut(&key) {
                Some(Value::Object(existing)) => existing.extend(fields),
                _ => {
                    target.insert(key, Value::Object(fields));
                }
            },
            value => {
                target.insert(key, value);
            }
        }
    }
}

/// Latest known device state. Only the dispatcher writes; everyone else reads copies.
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    inner: Arc<RwLock<Snapshot>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&self, partial: Snapshot) {
        merge_into(&mut self.inner.write(), partial);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().clone()
    }

    pub fn field(&self, section: Option<&str>, field: &str) -> Option<Value> {
        let guard = self.inner.read();
        match section {
            Some(section) => guard.get(section)?.get(field).cloned(),
            None => guard.get(field).cloned(),
        }
    }
}

/// Publishes the snapshot only when it differs from the last one sent.
pub struct SnapshotPublisher {
    bus: LocalBus,
    last: Option<Snapshot>,
    metrics: Option<BridgeMetrics>,
}

impl SnapshotPublisher {
    pub fn new(bus: LocalBus, metrics: Option<BridgeMetrics>) -> Self {
        Self {
            bus,
            last: None,
            metrics,
        }
    }

    pub fn publish_if_changed(&mut self, snapshot: Snapshot) -> bool {
        if self.last.as_ref() == Some(&snapshot) {
            trace!("snapshot unchanged; publish skipped");
            return false;
        }
        self.bus.publish_snapshot(&snapshot);
        if let Some(metrics) = &self.metrics {
            metrics.inc_snapshot_publish();
        }
        self.last = Some(snapshot);
        true
    }
}

#[derive(Debug, Default)]
struct Pending {
    sections: Snapshot,
    confirmations: Vec<String>,
}

/// Results and confirmations gathered between posting ticks.
#[derive(Debug, Clone, Default)]
pub struct OutboundBuffer {
    pending: Arc<Mutex<Pending>>,
    send_now: Arc<Notify>,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, partial: Snapshot) {
        merge_into(&mut self.pending.lock().sections, partial);
    }

    /// Queue a confirmation batch and ask the posting loop to send right away.
    pub fn push_confirmations(&self, batch: &WriteBatch) {
        if batch.is_empty() {
            return;
        }
        self.pending
            .lock()
            .confirmations
            .extend(batch.wire_ids());
        self.send_now.notify_one();
    }

    pub fn has_confirmations(&self) -> bool {
        !self.pending.lock().confirmations.is_empty()
    }

    /// Resolves once a confirmation is waiting to be sent.
    pub async fn send_requested(&self) {
        self.send_now.notified().await;
    }

    /// Take everything buffered, leaving the buffer empty.
    pub fn drain(&self) -> Snapshot {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut body = pending.sections;
        if !pending.confirmations.is_empty() {
            body.insert(
                "id".to_owned(),
                Value::Array(pending.confirmations.into_iter().map(Value::from).collect()),
            );
        }
        body
    }
}
