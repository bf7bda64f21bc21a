//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the bridge.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get(move || metrics_handler(registry.clone())),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener.local_addr().unwrap_or(addr);
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Address the listener actually bound.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters and gauges recorded by the bridge tasks.
#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    registry: SharedRegistry,
    jobs_total: IntCounterVec,
    job_faults_total: IntCounterVec,
    job_seconds: Histogram,
    queue_depth: IntGauge,
    write_outcomes_total: IntCounterVec,
    posts_total: IntCounterVec,
    token_refresh_total: IntCounter,
    snapshot_publishes_total: IntCounter,
}

impl BridgeMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let jobs_total = IntCounterVec::new(
            Opts::new("heatlink_jobs_total", "Jobs serviced by the dispatcher"),
            &["job"],
        )?;
        registry.register(Box::new(jobs_total.clone()))?;

        let job_faults_total = IntCounterVec::new(
            Opts::new(
                "heatlink_job_faults_total",
                "Jobs whose handler returned a fault",
            ),
            &["job"],
        )?;
        registry.register(Box::new(job_faults_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 12)
            .context("failed to construct histogram buckets")?;
        let job_seconds = Histogram::with_opts(
            HistogramOpts::new("heatlink_job_seconds", "Handler execution time").buckets(buckets),
        )?;
        registry.register(Box::new(job_seconds.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "heatlink_queue_depth",
            "Jobs waiting in the priority queue",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let write_outcomes_total = IntCounterVec::new(
            Opts::new(
                "heatlink_write_outcomes_total",
                "Setting writes by confirmation result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(write_outcomes_total.clone()))?;

        let posts_total = IntCounterVec::new(
            Opts::new("heatlink_posts_total", "Backend posting attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(posts_total.clone()))?;

        let token_refresh_total = IntCounter::with_opts(Opts::new(
            "heatlink_token_refresh_total",
            "Access token refresh exchanges attempted",
        ))?;
        registry.register(Box::new(token_refresh_total.clone()))?;

        let snapshot_publishes_total = IntCounter::with_opts(Opts::new(
            "heatlink_snapshot_publishes_total",
            "Device snapshots published to the local bus",
        ))?;
        registry.register(Box::new(snapshot_publishes_total.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            job_faults_total,
            job_seconds,
            queue_depth,
            write_outcomes_total,
            posts_total,
            token_refresh_total,
            snapshot_publishes_total,
        })
    }

    /// Metrics bound to a private registry, for tests and tools.
    pub fn detached() -> Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_job(&self, job: &str, elapsed: Duration, faulted: bool) {
        self.jobs_total.with_label_values(&[job]).inc();
        self.job_seconds.observe(elapsed.as_secs_f64());
        if faulted {
            self.job_faults_total.with_label_values(&[job]).inc();
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn record_write(&self, confirmed: bool) {
        let result = if confirmed { "confirmed" } else { "failed" };
        self.write_outcomes_total.with_label_values(&[result]).inc();
    }

    pub fn record_post(&self, outcome: &str) {
        self.posts_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_token_refresh(&self) {
        self.token_refresh_total.inc();
    }

    pub fn inc_snapshot_publish(&self) {
        self.snapshot_publishes_total.inc();
    }

    pub fn jobs_serviced(&self, job: &str) -> u64 {
        self.jobs_total.with_label_values(&[job]).get()
    }

    pub fn snapshot_publishes(&self) -> u64 {
        self.snapshot_publishes_total.get()
    }

    pub fn token_refreshes(&self) -> u64 {
        self.token_refresh_total.get()
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone, Debug)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "heatlinkd_starts_total",
            "Total number of times the bridge daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "heatlinkd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_metrics_register_once_per_registry() {
        let registry = new_registry();
        let metrics = BridgeMetrics::new(registry.clone()).unwrap();
        assert!(BridgeMetrics::new(registry.clone()).is_err());

        metrics.record_job("getSensorData", Duration::from_millis(40), false);
        metrics.record_job("getSensorData", Duration::from_millis(40), true);
        metrics.record_write(true);
        metrics.inc_snapshot_publish();

        assert_eq!(metrics.jobs_serviced("getSensorData"), 2);
        assert_eq!(metrics.snapshot_publishes(), 1);
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"heatlink_job_faults_total".to_owned()));
        assert!(names.contains(&"heatlink_write_outcomes_total".to_owned()));
    }

    #[tokio::test]
    async fn exporter_binds_and_shuts_down() {
        let registry = new_registry();
        DaemonMetrics::new(&registry).unwrap().inc_start();
        let server =
            spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exporter_serves_the_text_format() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let registry = new_registry();
        DaemonMetrics::new(&registry).unwrap().inc_start();
        let server =
            spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();

        let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response
            .to_ascii_lowercase()
            .contains(&format!("content-type: {}", prometheus::TEXT_FORMAT)));
        assert!(response.contains("heatlinkd_starts_total 1"));
        server.shutdown().await.unwrap();
    }
}
