//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use heatlink_common::config::ProbeKind;
use heatlink_common::AppConfig;
use heatlink_device::{SerializedTransport, SharedTransport};
use heatlink_metrics::BridgeMetrics;
use heatlink_rt::{PeriodicProducer, TaskSet};
use tokio::sync::broadcast;
use tracing::info;

use crate::backend::Backend;
use crate::bus::LocalBus;
use crate::credentials::CredentialManager;
use crate::dispatcher::Dispatcher;
use crate::hostinfo::HostAddresses;
use crate::job::{Job, JobQueue};
use crate::monitor::ErrorMonitor;
use crate::network::{AddressSource, NetworkTask, Reachability};
use crate::posting::PostingLoop;
use crate::snapshot::ResultCache;

/// Wires producers, dispatcher, posting loop and network reconciler together.
pub struct BridgeOrchestrator {
    config: Arc<AppConfig>,
    transport: SharedTransport,
    backend: Arc<dyn Backend>,
    device_id: u64,
    metrics: Option<BridgeMetrics>,
    addresses: Option<Arc<dyn AddressSource>>,
}

impl BridgeOrchestrator {
    pub fn new(
        config: AppConfig,
        transport: SharedTransport,
        backend: Arc<dyn Backend>,
        device_id: u64,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            backend,
            device_id,
            metrics: None,
            addresses: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace host address discovery, e.g. with fixed addresses.
    pub fn with_address_source(mut self, addresses: Arc<dyn AddressSource>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    /// Start every task and return a handle for lifecycle control.
    pub async fn start(self) -> Result<BridgeHandle> {
        let config = self.config;
        let schedule = &config.schedule;
        let (shutdown_tx, _) = broadcast::channel(16);
        let mut tasks = TaskSet::default();

        let transport: SharedTransport = Arc::new(SerializedTransport::new(
            self.transport,
            config.device.response_timeout_ms,
            config.device.inter_request_delay_ms,
        ));
        let queue = JobQueue::new();
        let bus = LocalBus::new(&config.bus).with_inbound(queue.clone(), schedule.settings_priority);

        let mut dispatcher = Dispatcher::new(config.clone(), queue.clone(), transport, bus.clone())
            .context("dispatcher configuration rejected")?;
        if let Some(metrics) = &self.metrics {
            dispatcher = dispatcher.with_metrics(metrics.clone());
        }
        let cache = dispatcher.cache();
        let net_status = dispatcher.net_status();
        let relay = dispatcher.error_relay();

        let mut credentials = CredentialManager::new(
            self.device_id,
            &config.identity,
            config.backend.denied_threshold,
            self.backend.clone(),
        );
        if let Some(metrics) = &self.metrics {
            credentials = credentials.with_metrics(metrics.clone());
        }
        let mut posting = PostingLoop::new(
            config.backend.clone(),
            schedule.settings_priority,
            self.backend.clone(),
            credentials,
            dispatcher.outbound(),
            queue.clone(),
        );
        if let Some(metrics) = &self.metrics {
            posting = posting.with_metrics(metrics.clone());
        }
        let online = posting.online();
        let connectivity = posting.connectivity();

        for (job, period) in schedule.primary_jobs()? {
            let producer = PeriodicProducer::new(
                job.as_str(),
                queue.clone(),
                schedule.routine_priority,
                Job::new(schedule.routine_priority, job),
                period,
            );
            tasks.spawn("primary-producer", producer.run(shutdown_tx.subscribe()));
        }
        for (job, period) in schedule.secondary_jobs()? {
            let producer = PeriodicProducer::new(
                job.as_str(),
                queue.clone(),
                schedule.secondary_priority,
                Job::new(schedule.secondary_priority, job),
                period,
            )
            .gated(online.clone());
            tasks.spawn("secondary-producer", producer.run(shutdown_tx.subscribe()));
        }

        let monitor = ErrorMonitor::new(
            schedule.error_monitor.clone(),
            schedule.fault_priority,
            queue.clone(),
            relay,
        )
        .with_connectivity(connectivity.clone());
        tasks.spawn("error-monitor", monitor.run(shutdown_tx.subscribe()));
        tasks.spawn("dispatcher", dispatcher.run(shutdown_tx.subscribe()));
        tasks.spawn("posting", posting.run(shutdown_tx.subscribe()));

        if config.network.enabled {
            let url = config.backend.parsed_url()?;
            let host = url
                .host_str()
                .context("backend url has no host")?
                .to_owned();
            let port = url.port_or_known_default().unwrap_or(80);
            let probe = match config.network.probe {
                ProbeKind::Posting => Reachability::Posting(connectivity),
                ProbeKind::Tcp => Reachability::Tcp {
                    host: host.clone(),
                    port,
                    timeout: config.network.probe_timeout,
                },
            };
            let addresses = self
                .addresses
                .unwrap_or_else(|| Arc::new(HostAddresses::new(host, port)));
            let network = NetworkTask::new(
                config.network.clone(),
                schedule.network_priority,
                queue.clone(),
                net_status,
                probe,
                addresses,
            );
            tasks.spawn("network", network.run(shutdown_tx.subscribe()));
        }

        info!(
            device_id = self.device_id,
            tasks = tasks.len(),
            network = config.network.enabled,
            "bridge started"
        );
        Ok(BridgeHandle {
            shutdown: shutdown_tx,
            tasks,
            bus,
            cache,
            queue,
        })
    }
}

/// Handle to a running bridge.
pub struct BridgeHandle {
    shutdown: broadcast::Sender<()>,
    tasks: TaskSet,
    bus: LocalBus,
    cache: ResultCache,
    queue: JobQueue,
}

impl BridgeHandle {
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.tasks.join().await?;
        info!("bridge shutdown complete");
        Ok(())
    }
}
