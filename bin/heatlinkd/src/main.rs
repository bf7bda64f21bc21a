//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the heatlink daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use heatlink_common::config::TransportKind;
use heatlink_common::{init_tracing, AppConfig};
use heatlink_core::{
    resolve_identity, Backend, BridgeOrchestrator, CredentialManager, DryRunBackend, HttpBackend,
};
use heatlink_device::{RtuTransport, SharedTransport, SimulatedTransport};
use heatlink_metrics::{new_registry, spawn_http_server, BridgeMetrics, DaemonMetrics};
use tokio::signal;
use tracing::{info, warn};

const SERVICE_NAME: &str = "heatlinkd";

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("heatlink ", env!("CARGO_PKG_VERSION")),
    about = "Heat-pump controller bridge daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured device transport")]
    transport: Option<CliTransport>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTransport {
    Rtu,
    Simulated,
}

impl From<CliTransport> for TransportKind {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Rtu => TransportKind::Rtu,
            CliTransport::Simulated => TransportKind::Simulated,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the bridge until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then print a summary")]
    CheckConfig,
    #[command(about = "Exchange the device identity for an access token and store it")]
    Provision,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/heatlink.toml"));
    candidates.push(PathBuf::from("/etc/heatlink/heatlink.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if let Some(transport) = cli.transport {
        config.device.transport = transport.into();
        config.validate()?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => print_summary(&config, &loaded.source),
        Commands::Provision => {
            init_tracing(SERVICE_NAME, &config.logging)?;
            provision(&config).await?;
        }
        Commands::Run => {
            init_tracing(SERVICE_NAME, &config.logging)?;
            info!(source = %loaded.source.display(), "configuration loaded");
            run_daemon(config, load_duration.as_secs_f64()).await?;
        }
    }
    Ok(())
}

fn build_backend(config: &AppConfig) -> Result<Arc<dyn Backend>> {
    if config.backend.enabled {
        Ok(Arc::new(HttpBackend::new(&config.backend)?))
    } else {
        warn!("backend disabled; outbound messages are logged only");
        Ok(Arc::new(DryRunBackend))
    }
}

fn open_transport(config: &AppConfig) -> Result<SharedTransport> {
    match config.device.transport {
        TransportKind::Rtu => {
            let transport = RtuTransport::open(&config.device)
                .map_err(|fault| anyhow!("{fault}"))
                .with_context(|| format!("failed to open {}", config.device.serial_port))?;
            info!(port = %config.device.serial_port, baud = config.device.baud_rate, "serial transport opened");
            Ok(Arc::new(transport))
        }
        TransportKind::Simulated => {
            warn!("using the in-memory simulated controller");
            Ok(Arc::new(SimulatedTransport::new()))
        }
    }
}

async fn run_daemon(config: AppConfig, load_seconds: f64) -> Result<()> {
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(load_seconds);
    daemon_metrics.inc_start();
    let bridge_metrics = BridgeMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry.clone(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let device_id = resolve_identity(&config.identity).context("cannot start without a device identity")?;
    let transport = open_transport(&config)?;
    let backend = build_backend(&config)?;

    let handle = BridgeOrchestrator::new(config, transport, backend, device_id)
        .with_metrics(bridge_metrics)
        .start()
        .await?;

    info!(device_id, "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn provision(config: &AppConfig) -> Result<()> {
    let device_id = resolve_identity(&config.identity)?;
    let backend = build_backend(config)?;
    let mut credentials = CredentialManager::new(
        device_id,
        &config.identity,
        config.backend.denied_threshold,
        backend,
    );
    credentials.provision().await?;
    println!(
        "Provisioned device {} ({})",
        device_id,
        config.identity.credential_file.display()
    );
    Ok(())
}

fn print_summary(config: &AppConfig, source: &std::path::Path) {
    println!("Configuration: {}", source.display());
    println!(
        "Transport: {:?} ({} @ {} baud, unit {})",
        config.device.transport,
        config.device.serial_port,
        config.device.baud_rate,
        config.device.unit_id
    );
    println!(
        "Backend: {} (enabled: {}, every {}s)",
        config.backend.url,
        config.backend.enabled,
        config.backend.post_interval.as_secs()
    );
    println!(
        "Schedule: {} primary, {} secondary job(s)",
        config.schedule.primary.len(),
        config.schedule.secondary.len()
    );
    for group in &config.polls {
        println!(
            "  {:<22} {:>3} field(s) -> {}",
            group.job.as_str(),
            group.fields.len(),
            group.section.as_deref().unwrap_or("<top level>")
        );
    }
    println!(
        "Network reconciler: {} (probe {:?})",
        if config.network.enabled { "enabled" } else { "disabled" },
        config.network.probe
    );
    println!("Follow-up rules: {}", config.follow_up.len());
}
