//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the bridge runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the HeatLink bridge workspace.
//! This crate exposes configuration loading, the job vocabulary shared by
//! the scheduler and dispatcher, and the logging bootstrap.

pub mod config;
pub mod jobs;
pub mod logging;

pub use config::{
    AppConfig, BackendConfig, BusConfig, DeviceConfig, ErrorMonitorConfig, FollowUpRule,
    IdentityConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, NetworkConfig, PollGroup,
    RegisterEntry, ScheduleConfig, WriteConfig,
};
pub use jobs::JobKind;
pub use logging::{init_tracing, LogFormat};
