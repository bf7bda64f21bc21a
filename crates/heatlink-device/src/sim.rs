//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory controller used for simulation and tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::transport::{FaultKind, Transport};

#[derive(Debug, Default)]
struct DeviceState {
    input: HashMap<u16, u16>,
    holding: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    latency: Duration,
    /// Addresses that fail every operation.
    broken: HashMap<u16, FaultKind>,
    /// Addresses that fail the next N operations.
    flaky: HashMap<u16, VecDeque<FaultKind>>,
    /// Writes are accepted but not stored.
    stuck: HashSet<u16>,
    /// A write to the key is also reflected at the value address.
    mirrors: HashMap<u16, u16>,
    writes: Vec<(u16, u16)>,
}

impl DeviceState {
    fn check(&mut self, address: u16) -> Result<(), FaultKind> {
        if let Some(fault) = self.broken.get(&address) {
            return Err(fault.clone());
        }
        if let Some(queue) = self.flaky.get_mut(&address) {
            if let Some(fault) = queue.pop_front() {
                return Err(fault);
            }
        }
        Ok(())
    }
}

/// In-memory controller that simulates input, holding and coil registers.
///
/// Unset registers read as zero.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<DeviceState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_input(&self, address: u16, value: u16) {
        self.state.lock().await.input.insert(address, value);
    }

    pub async fn set_holding(&self, address: u16, value: u16) {
        self.state.lock().await.holding.insert(address, value);
    }

    pub async fn set_coil(&self, address: u16, value: bool) {
        self.state.lock().await.coils.insert(address, value);
    }

    pub async fn holding(&self, address: u16) -> u16 {
        self.state
            .lock()
            .await
            .holding
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn break_address(&self, address: u16, fault: FaultKind) {
        self.state.lock().await.broken.insert(address, fault);
    }

    pub async fn repair_address(&self, address: u16) {
        let mut state = self.state.lock().await;
        state.broken.remove(&address);
        state.flaky.remove(&address);
    }

    pub async fn fail_next(&self, address: u16, fault: FaultKind, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.flaky.entry(address).or_default();
        queue.extend(std::iter::repeat(fault).take(times));
    }

    pub async fn stick(&self, address: u16) {
        self.state.lock().await.stuck.insert(address);
    }

    pub async fn mirror(&self, written: u16, reported: u16) {
        self.state.lock().await.mirrors.insert(written, reported);
    }

    /// Every accepted write in arrival order.
    pub async fn writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().await.writes.clone()
    }

    pub async fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = self.state.lock().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        InFlight(self.in_flight.clone())
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn read_words(
    state: &mut DeviceState,
    bank: fn(&DeviceState) -> &HashMap<u16, u16>,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, FaultKind> {
    let mut values = Vec::with_capacity(count as usize);
    for offset in 0..count {
        let address = start
            .checked_add(offset)
            .ok_or(FaultKind::Exception {
                function: 0x03,
                code: 0x02,
            })?;
        state.check(address)?;
        values.push(bank(state).get(&address).copied().unwrap_or(0));
    }
    Ok(values)
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, FaultKind> {
        let _busy = self.enter().await;
        let mut state = self.state.lock().await;
        read_words(&mut state, |s| &s.input, address, count)
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, FaultKind> {
        let _busy = self.enter().await;
        let mut state = self.state.lock().await;
        read_words(&mut state, |s| &s.holding, address, count)
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, FaultKind> {
        let _busy = self.enter().await;
        let mut state = self.state.lock().await;
        let mut values = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let coil = address.saturating_add(offset);
            state.check(coil)?;
            values.push(state.coils.get(&coil).copied().unwrap_or(false));
        }
        Ok(values)
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), FaultKind> {
        let _busy = self.enter().await;
        let mut state = self.state.lock().await;
        state.check(address)?;
        state.writes.push((address, value));
        if state.stuck.contains(&address) {
            return Ok(());
        }
        state.holding.insert(address, value);
        if let Some(reported) = state.mirrors.get(&address).copied() {
            state.holding.insert(reported, value);
        }
        Ok(())
    }
}
