//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Write-then-verify handling for setting updates."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use heatlink_common::config::{RegisterKind, WriteConfig};
use heatlink_device::{FaultKind, SharedTransport};
use tracing::{debug, info, warn};

use crate::settings::{SettingUpdate, SettingUpdateRequest, WriteBatch, WriteOutcome};

/// Applies setting batches key by key: offset, resolve, write, read back, retry.
pub struct WriteConfirmer {
    transport: SharedTransport,
    config: WriteConfig,
}

impl WriteConfirmer {
    pub fn new(transport: SharedTransport, config: WriteConfig) -> Self {
        Self { transport, config }
    }

    pub fn sentinel(&self) -> &str {
        &self.config.sentinel_id
    }

    /// Keys are processed in order. Keys written before a later failure stay written.
    pub async fn apply(&self, request: &SettingUpdateRequest) -> WriteBatch {
        let mut batch = WriteBatch::default();
        for (key, update) in &request.updates {
            let outcome = self.apply_key(key, update).await;
            if outcome.is_confirmed() {
                debug!(key = %key, id = %update.id, "setting confirmed");
            } else {
                warn!(key = %key, id = %update.id, "setting write failed");
            }
            batch.outcomes.push(outcome);
        }
        batch
    }

    async fn apply_key(&self, key: &str, update: &SettingUpdate) -> WriteOutcome {
        let failed = || WriteOutcome::Failed(update.id.clone());

        let Some(requested) = update.value() else {
            warn!(key, value = %update.set, "setting value is not an integer");
            return failed();
        };
        let biased = requested + self.config.offsets.get(key).copied().unwrap_or(0);
        let Some(address) = self.config.settings.get(key).copied() else {
            warn!(key, "setting key has no register mapping");
            return failed();
        };
        let Ok(word) = u16::try_from(biased) else {
            warn!(key, value = biased, "setting value outside register range");
            return failed();
        };

        for attempt in 1..=self.config.max_attempts {
            match self.write_and_verify(address, word).await {
                Ok(true) => return WriteOutcome::Confirmed(update.id.clone()),
                Ok(false) => {
                    debug!(key, address, attempt, "read-back mismatch");
                }
                Err(fault) => {
                    debug!(key, address, attempt, error = %fault, "write attempt faulted");
                }
            }
        }
        info!(key, address, attempts = self.config.max_attempts, "giving up on setting write");
        failed()
    }

    async fn write_and_verify(&self, address: u16, word: u16) -> Result<bool, FaultKind> {
        self.transport.write_register(address, word).await?;
        let read_back = self
            .transport
            .read_word(RegisterKind::Holding, address)
            .await?;
        Ok(read_back == word)
    }
}
