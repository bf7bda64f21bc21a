//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Single consumer servicing queued jobs against the controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use heatlink_common::config::RegisterKind;
use heatlink_common::{AppConfig, JobKind};
use heatlink_device::{read_group, FaultKind, SharedTransport};
use heatlink_metrics::BridgeMetrics;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::bus::LocalBus;
use crate::confirm::WriteConfirmer;
use crate::hostinfo::HostFacts;
use crate::job::{Job, JobPayload, JobQueue};
use crate::monitor::{follow_ups, relay_asserted};
use crate::network::{NetState, NetTriple};
use crate::settings::{AckRoute, SettingUpdateRequest};
use crate::snapshot::{OutboundBuffer, ResultCache, Snapshot, SnapshotPublisher};

/// Pops jobs one at a time and is the only writer of the device snapshot.
pub struct Dispatcher {
    config: Arc<AppConfig>,
    queue: JobQueue,
    transport: SharedTransport,
    confirmer: WriteConfirmer,
    cache: ResultCache,
    outbound: OutboundBuffer,
    publisher: SnapshotPublisher,
    bus: LocalBus,
    net_status: watch::Sender<NetState>,
    relay: watch::Sender<bool>,
    host: HostFacts,
    system_status: Option<Snapshot>,
    metrics: Option<BridgeMetrics>,
}

impl Dispatcher {
    /// Fails when a job that can be raised has no register group to read.
    pub fn new(
        config: Arc<AppConfig>,
        queue: JobQueue,
        transport: SharedTransport,
        bus: LocalBus,
    ) -> Result<Self> {
        config.validate()?;
        let confirmer = WriteConfirmer::new(transport.clone(), config.writes.clone());
        let (net_status, _) = watch::channel(NetState::Unknown);
        let (relay, _) = watch::channel(false);
        Ok(Self {
            publisher: SnapshotPublisher::new(bus.clone(), None),
            config,
            queue,
            transport,
            confirmer,
            cache: ResultCache::new(),
            outbound: OutboundBuffer::new(),
            bus,
            net_status,
            relay,
            host: HostFacts::new(env!("CARGO_PKG_VERSION")),
            system_status: None,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.publisher = SnapshotPublisher::new(self.bus.clone(), Some(metrics.clone()));
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> ResultCache {
        self.cache.clone()
    }

    pub fn outbound(&self) -> OutboundBuffer {
        self.outbound.clone()
    }

    pub fn net_status(&self) -> watch::Receiver<NetState> {
        self.net_status.subscribe()
    }

    pub fn error_relay(&self) -> watch::Receiver<bool> {
        self.relay.subscribe()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("dispatcher started");
        loop {
            let job = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("dispatcher shutdown");
                    break;
                }
                job = self.queue.pop() => job,
            };
            self.service(job).await;
        }
        Ok(())
    }

    /// Run one job to completion. Faults are logged and counted, never propagated.
    pub async fn service(&mut self, job: Job) {
        let started = Instant::now();
        let result = self.handle(&job).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_job(job.kind.as_str(), started.elapsed(), result.is_err());
            metrics.set_queue_depth(self.queue.len());
        }
        match result {
            Ok(partial) if partial.is_empty() => {}
            Ok(partial) => self.absorb(partial),
            Err(fault) => {
                warn!(job = %job.kind, priority = job.priority, error = %fault, "job faulted");
            }
        }
    }

    fn absorb(&mut self, partial: Snapshot) {
        if let Some(asserted) = relay_asserted(&self.config.schedule.error_monitor, &partial) {
            self.relay.send_if_modified(|current| {
                let changed = *current != asserted;
                *current = asserted;
                changed
            });
        }
        for job in follow_ups(
            &self.config.follow_up,
            &partial,
            self.config.schedule.fault_priority,
        ) {
            debug!(job = %job.kind, priority = job.priority, "follow-up raised");
            job.submit(&self.queue);
        }
        self.outbound.extend(partial.clone());
        self.cache.apply(partial);
        self.publisher.publish_if_changed(self.cache.snapshot());
    }

    async fn handle(&mut self, job: &Job) -> Result<Snapshot, FaultKind> {
        match job.kind {
            JobKind::GetSystemStatusData => Ok(self.system_status().await),
            kind @ (JobKind::GetSensorData
            | JobKind::GetRelayData
            | JobKind::GetUserData
            | JobKind::GetMonteurData
            | JobKind::GetSystemTimeData
            | JobKind::GetSpecialBlocksData
            | JobKind::GetSystemBlocksData) => self.read_poll_group(kind).await,
            JobKind::GetPing => {
                let mut partial = Snapshot::new();
                partial.insert("Ping".into(), json!(0));
                Ok(partial)
            }
            JobKind::GetNetStatus => self.read_net_status().await,
            JobKind::SetNetOn => self.write_net_flag(self.config.network.on_value).await,
            JobKind::SetNetOff => self.write_net_flag(self.config.network.off_value).await,
            JobKind::SetIp => match &job.payload {
                Some(JobPayload::Network(triple)) => self.write_addresses(*triple).await,
                _ => Err(FaultKind::Unsupported("setIP without an address payload")),
            },
            JobKind::SetSettingData => match &job.payload {
                Some(JobPayload::Settings(request)) => self.apply_settings(request).await,
                _ => Err(FaultKind::Unsupported("setSettingData without a settings payload")),
            },
        }
    }

    async fn read_poll_group(&self, job: JobKind) -> Result<Snapshot, FaultKind> {
        let group = self
            .config
            .poll_group(job)
            .ok_or(FaultKind::Unsupported("no register group configured"))?;
        let read = read_group(self.transport.as_ref(), group).await;
        if read.is_empty() {
            return Err(read
                .failures
                .into_iter()
                .next()
                .map(|(_, fault)| fault)
                .unwrap_or_else(|| FaultKind::Decode(format!("{job} produced no fields"))));
        }
        if !read.failures.is_empty() {
            debug!(job = %job, failed = read.failures.len(), aborted = read.aborted, "partial group read");
        }
        let mut partial = Snapshot::new();
        if !read.fields.is_empty() {
            match &group.section {
                Some(section) => {
                    partial.insert(section.clone(), Value::Object(read.fields));
                }
                None => partial.extend(read.fields),
            }
        }
        partial.extend(read.top_level);
        Ok(partial)
    }

    /// Controller part is read until it succeeds once; host facts are fresh every run.
    async fn system_status(&mut self) -> Snapshot {
        if self.system_status.is_none() {
            if let Some(group) = self.config.poll_group(JobKind::GetSystemStatusData) {
                let read = read_group(self.transport.as_ref(), group).await;
                if read.failures.is_empty() && !read.is_empty() {
                    self.system_status = Some(read.fields);
                } else {
                    debug!(failed = read.failures.len(), "system status read incomplete; retrying next run");
                }
            }
        }

        let mut fields = self.system_status.clone().unwrap_or_default();
        fields.extend(self.host.collect());
        let section = self
            .config
            .poll_group(JobKind::GetSystemStatusData)
            .and_then(|group| group.section.clone());
        match section {
            Some(section) => {
                let mut partial = Snapshot::new();
                partial.insert(section, Value::Object(fields));
                partial
            }
            None => fields,
        }
    }

    async fn read_net_status(&self) -> Result<Snapshot, FaultKind> {
        let register = self.config.network.status_register;
        let result = self
            .transport
            .read_word(RegisterKind::Holding, register)
            .await
            .map(NetState::from_register);
        let state = result.clone().unwrap_or(NetState::Unknown);
        self.net_status.send_replace(state);
        debug!(?state, "network status read");
        result.map(|_| Snapshot::new())
    }

    async fn write_net_flag(&self, value: u16) -> Result<Snapshot, FaultKind> {
        self.transport
            .write_register(self.config.network.status_write_register, value)
            .await?;
        Ok(Snapshot::new())
    }

    async fn write_addresses(&self, triple: NetTriple) -> Result<Snapshot, FaultKind> {
        let base = self.config.network.address_base;
        for (offset, octet) in (0u16..).zip(triple.octets()) {
            self.transport
                .write_register(base + offset, u16::from(octet))
                .await?;
        }
        debug!(ip = %triple.ip, gateway = %triple.gateway, dns = %triple.dns, "address block written");
        Ok(Snapshot::new())
    }

    async fn apply_settings(&self, request: &SettingUpdateRequest) -> Result<Snapshot, FaultKind> {
        let batch = self.confirmer.apply(request).await;
        if let Some(metrics) = &self.metrics {
            for outcome in &batch.outcomes {
                metrics.record_write(outcome.is_confirmed());
            }
        }
        match batch.route(self.confirmer.sentinel()) {
            AckRoute::Device => self.bus.publish_device_ack(batch.to_json()),
            AckRoute::Backend => self.outbound.push_confirmations(&batch),
        }
        Ok(Snapshot::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatlink_common::config::{Encoding, PollGroup, RegisterEntry};
    use heatlink_common::BusConfig;
    use heatlink_device::SimulatedTransport;
    use std::net::Ipv4Addr;

    fn entry(name: &str, address: u16, kind: RegisterKind) -> RegisterEntry {
        RegisterEntry {
            name: name.into(),
            address,
            kind,
            encoding: Encoding::U16,
            low_address: None,
            scale: None,
            read_offset: 0,
            top_level: false,
            first_index: 1,
            bit_count: 16,
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.schedule.primary = [("getSensorData".to_owned(), 10), ("getPing".to_owned(), 30)]
            .into_iter()
            .collect();
        config.schedule.secondary = Default::default();
        config.schedule.error_monitor.job = JobKind::GetRelayData;
        config.follow_up = Vec::new();
        config.polls = vec![
            PollGroup {
                job: JobKind::GetSensorData,
                section: Some("sensordata".into()),
                fields: vec![
                    entry("F1", 1, RegisterKind::Input),
                    entry("F2", 2, RegisterKind::Input),
                ],
            },
            PollGroup {
                job: JobKind::GetRelayData,
                section: Some("relaydata".into()),
                fields: vec![entry("RLY2", 2, RegisterKind::Coil)],
            },
            PollGroup {
                job: JobKind::GetSystemStatusData,
                section: Some("systemstatusdata".into()),
                fields: vec![entry("FABNR", 190, RegisterKind::Holding)],
            },
        ];
        config
    }

    fn dispatcher(device: &SimulatedTransport) -> Dispatcher {
        Dispatcher::new(
            Arc::new(config()),
            JobQueue::new(),
            Arc::new(device.clone()),
            LocalBus::new(&BusConfig::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failed_field_keeps_the_previous_value() {
        let device = SimulatedTransport::new();
        device.set_input(1, 20).await;
        device.set_input(2, 30).await;
        let mut dispatcher = dispatcher(&device);
        let cache = dispatcher.cache();

        dispatcher.service(Job::new(10, JobKind::GetSensorData)).await;
        device.set_input(1, 21).await;
        device
            .break_address(2, FaultKind::Exception { function: 4, code: 2 })
            .await;
        dispatcher.service(Job::new(10, JobKind::GetSensorData)).await;

        assert_eq!(cache.field(Some("sensordata"), "F1"), Some(json!(21)));
        assert_eq!(cache.field(Some("sensordata"), "F2"), Some(json!(30)));
    }

    #[tokio::test]
    async fn every_group_job_is_read_into_its_section() {
        use strum::IntoEnumIterator;

        let device = SimulatedTransport::new();
        let mut config = config();
        config.polls.clear();
        let kinds: Vec<JobKind> = JobKind::iter()
            .filter(|kind| kind.reads_register_group())
            .collect();
        for (n, kind) in kinds.iter().enumerate() {
            let address = 100 + n as u16;
            device.set_holding(address, address).await;
            config.polls.push(PollGroup {
                job: *kind,
                section: Some(kind.as_str().to_owned()),
                fields: vec![entry("VALUE", address, RegisterKind::Holding)],
            });
        }
        let mut dispatcher = Dispatcher::new(
            Arc::new(config),
            JobQueue::new(),
            Arc::new(device.clone()),
            LocalBus::new(&BusConfig::default()),
        )
        .unwrap();

        for (n, kind) in kinds.iter().enumerate() {
            dispatcher.service(Job::new(10, *kind)).await;
            assert_eq!(
                dispatcher.cache().field(Some(kind.as_str()), "VALUE"),
                Some(json!(100 + n)),
                "{kind}"
            );
        }
    }

    #[tokio::test]
    async fn dispatcher_survives_a_fully_failed_group() {
        let device = SimulatedTransport::new();
        device.break_address(1, FaultKind::Timeout).await;
        device.break_address(2, FaultKind::Timeout).await;
        let mut dispatcher = dispatcher(&device);
        dispatcher.service(Job::new(10, JobKind::GetSensorData)).await;
        dispatcher.service(Job::new(10, JobKind::GetPing)).await;
        assert_eq!(dispatcher.cache().field(None, "Ping"), Some(json!(0)));
        assert_eq!(dispatcher.cache().field(Some("sensordata"), "F1"), None);
    }

    #[tokio::test]
    async fn relay_field_drives_the_error_flag() {
        let device = SimulatedTransport::new();
        device.set_coil(2, true).await;
        let mut dispatcher = dispatcher(&device);
        let relay = dispatcher.error_relay();
        dispatcher.service(Job::new(10, JobKind::GetRelayData)).await;
        assert!(*relay.borrow());
        device.set_coil(2, false).await;
        dispatcher.service(Job::new(10, JobKind::GetRelayData)).await;
        assert!(!*relay.borrow());
    }

    #[tokio::test]
    async fn system_status_is_read_once_and_host_facts_every_time() {
        let device = SimulatedTransport::new();
        device.set_holding(190, 4711).await;
        let mut dispatcher = dispatcher(&device);
        let cache = dispatcher.cache();

        dispatcher.service(Job::new(10, JobKind::GetSystemStatusData)).await;
        device.set_holding(190, 1).await;
        dispatcher.service(Job::new(10, JobKind::GetSystemStatusData)).await;

        assert_eq!(cache.field(Some("systemstatusdata"), "FABNR"), Some(json!(4711)));
        assert!(cache.field(Some("systemstatusdata"), "SWPI").is_some());
    }

    #[tokio::test]
    async fn net_status_is_published_and_faults_report_unknown() {
        let device = SimulatedTransport::new();
        device.set_holding(210, 1).await;
        let mut dispatcher = dispatcher(&device);
        let status = dispatcher.net_status();
        dispatcher.service(Job::new(2, JobKind::GetNetStatus)).await;
        assert_eq!(*status.borrow(), NetState::On);

        device.break_address(210, FaultKind::Timeout).await;
        dispatcher.service(Job::new(2, JobKind::GetNetStatus)).await;
        assert_eq!(*status.borrow(), NetState::Unknown);
    }

    #[tokio::test]
    async fn set_ip_writes_twelve_octets_from_the_base() {
        let device = SimulatedTransport::new();
        let mut dispatcher = dispatcher(&device);
        let triple = NetTriple {
            ip: Ipv4Addr::new(192, 168, 0, 9),
            gateway: Ipv4Addr::new(192, 168, 0, 1),
            dns: Ipv4Addr::new(1, 1, 1, 1),
        };
        dispatcher.service(Job::set_ip(2, triple)).await;
        dispatcher.service(Job::new(2, JobKind::SetNetOn)).await;

        let writes = device.writes().await;
        assert_eq!(writes.len(), 13);
        assert_eq!(writes[0], (211, 192));
        assert_eq!(writes[11], (222, 1));
        assert_eq!(writes[12], (466, 1));
    }

    #[tokio::test]
    async fn sentinel_batches_go_to_the_bus_and_others_to_the_backend() {
        let device = SimulatedTransport::new();
        let mut dispatcher = dispatcher(&device);
        let mut events = dispatcher.bus.subscribe();
        let outbound = dispatcher.outbound();

        let mut device_batch = SettingUpdateRequest::default();
        device_batch.insert("B1", json!(1), "1000");
        dispatcher.service(Job::settings(1, device_batch)).await;
        match events.try_recv() {
            Ok(crate::bus::BusEvent::DeviceAck(ack)) => assert_eq!(ack, json!({"id": ["1000"]})),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!outbound.has_confirmations());

        let mut backend_batch = SettingUpdateRequest::default();
        backend_batch.insert("B2", json!(1), "5");
        dispatcher.service(Job::settings(1, backend_batch)).await;
        assert_eq!(outbound.drain().get("id"), Some(&json!(["5"])));
    }
}
