//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Register transport to the heat-pump controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use heatlink_common::config::RegisterKind;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout, Instant};
use tracing::trace;

/// Why a single register operation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultKind {
    #[error("transport call timed out")]
    Timeout,
    #[error("transport io error: {0}")]
    Io(String),
    #[error("device exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },
    #[error("malformed response: {0}")]
    Frame(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl FaultKind {
    /// Faults that indicate the link itself is unusable right now.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, FaultKind::Timeout | FaultKind::Io(_))
    }
}

/// Primitive register operations against the controller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, FaultKind>;

    async fn read_holding_registers(&self, address: u16, count: u16)
        -> Result<Vec<u16>, FaultKind>;

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FaultKind>;

    async fn write_register(&self, address: u16, value: u16) -> Result<(), FaultKind>;

    /// Read one word using the function family of `kind`.
    async fn read_word(&self, kind: RegisterKind, address: u16) -> Result<u16, FaultKind> {
        let words = match kind {
            RegisterKind::Input => self.read_input_registers(address, 1).await?,
            RegisterKind::Holding => self.read_holding_registers(address, 1).await?,
            RegisterKind::Coil => {
                let coils = self.read_coils(address, 1).await?;
                coils.into_iter().map(u16::from).collect()
            }
        };
        words
            .first()
            .copied()
            .ok_or_else(|| FaultKind::Frame(format!("empty response for register {address}")))
    }
}

pub type SharedTransport = Arc<dyn Transport>;

/// Serialises every call onto one bus slot, bounds each call with a timeout,
/// and keeps a minimum pause between consecutive operations.
pub struct SerializedTransport {
    inner: SharedTransport,
    slot: Mutex<Option<Instant>>,
    call_timeout: Duration,
    pause: Duration,
}

struct BusSlot<'a> {
    last_done: MutexGuard<'a, Option<Instant>>,
}

impl Drop for BusSlot<'_> {
    fn drop(&mut self) {
        *self.last_done = Some(Instant::now());
    }
}

impl SerializedTransport {
    pub fn new(inner: SharedTransport, call_timeout: Duration, pause: Duration) -> Self {
        Self {
            inner,
            slot: Mutex::new(None),
            call_timeout,
            pause,
        }
    }

    async fn acquire(&self) -> BusSlot<'_> {
        let last_done = self.slot.lock().await;
        if let Some(done) = *last_done {
            tokio::time::sleep_until(done + self.pause).await;
        }
        BusSlot { last_done }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, FaultKind>>,
    ) -> Result<T, FaultKind> {
        let _slot = self.acquire().await;
        trace!(op, "transport call");
        match timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FaultKind::Timeout),
        }
    }
}

#[async_trait]
impl Transport for SerializedTransport {
    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, FaultKind> {
        self.bounded("read_input", self.inner.read_input_registers(address, count))
            .await
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FaultKind> {
        self.bounded(
            "read_holding",
            self.inner.read_holding_registers(address, count),
        )
        .await
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FaultKind> {
        self.bounded("read_coils", self.inner.read_coils(address, count))
            .await
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), FaultKind> {
        self.bounded("write_register", self.inner.write_register(address, value))
            .await
    }
}
