//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tracing bootstrap for the bridge daemon and its tools."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "HEATLINK_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Stdout format of the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Filter directive from `HEATLINK_LOG`, then `RUST_LOG`, then `info`.
/// A directive that does not parse is reported and skipped.
pub fn filter_directive(heatlink_log: Option<&str>, rust_log: Option<&str>) -> String {
    [(LOG_ENV, heatlink_log), ("RUST_LOG", rust_log)]
        .into_iter()
        .find_map(|(name, value)| {
            let value = value?.trim();
            if value.is_empty() {
                return None;
            }
            match EnvFilter::try_new(value) {
                Ok(_) => Some(value.to_owned()),
                Err(err) => {
                    eprintln!("ignoring invalid {name} directive '{value}': {err}");
                    None
                }
            }
        })
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned())
}

fn rolling_file(service_name: &str, config: &LoggingConfig) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!(
            "unable to create log directory {}",
            config.directory.display()
        )
    })?;
    let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(config.retained_files.max(1))
        .build(&config.directory)
        .with_context(|| format!("unable to open log file in {}", config.directory.display()))
}

/// Install the global subscriber: stdout in the configured format and, unless
/// disabled, a daily JSON file with bounded retention. Calling it twice keeps
/// the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let heatlink_log = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(heatlink_log.as_deref(), rust_log.as_deref());

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file {
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(rolling_file(service_name, config)?);
        let _ = FILE_GUARD.set(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(&directive))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        filter = %directive,
        log_dir = %config.directory.display(),
        file = config.file,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}
