//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the bridge runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::jobs::JobKind;
use crate::logging::LogFormat;

fn default_true() -> bool {
    true
}

fn default_serial_port() -> String {
    "/dev/ttyACM0".to_owned()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_unit_id() -> u8 {
    16
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_inter_request_delay() -> Duration {
    Duration::from_millis(30)
}

fn default_identity_file() -> PathBuf {
    PathBuf::from("/var/lib/heatlink/fabnr.cfg")
}

fn default_credential_file() -> PathBuf {
    PathBuf::from("/var/lib/heatlink/config.cfg")
}

fn default_backend_url() -> String {
    "https://ws.dvienergi.com/ws-dvi.php".to_owned()
}

fn default_post_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_denied_threshold() -> u32 {
    10
}

fn default_routine_priority() -> u8 {
    10
}

fn default_secondary_priority() -> u8 {
    2
}

fn default_fault_priority() -> u8 {
    2
}

fn default_settings_priority() -> u8 {
    1
}

fn default_network_priority() -> u8 {
    2
}

fn default_primary_schedule() -> IndexMap<String, u64> {
    [
        ("getRelayData", 10),
        ("getMonteurData", 3600),
        ("getSensorData", 10),
        ("getSpecialBlocksData", 3600),
        ("getUserData", 10),
        ("getSystemStatusData", 3600),
        ("getSystemTimeData", 3600),
        ("getSystemBlocksData", 60),
        ("getPing", 30),
    ]
    .into_iter()
    .map(|(name, secs)| (name.to_owned(), secs))
    .collect()
}

fn default_secondary_schedule() -> IndexMap<String, u64> {
    [
        ("getSensorData", 30),
        ("getRelayData", 10),
        ("getMonteurData", 1200),
        ("getUserData", 60),
        ("getPing", 3),
    ]
    .into_iter()
    .map(|(name, secs)| (name.to_owned(), secs))
    .collect()
}

fn default_error_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_cooldown_ticks() -> u32 {
    5
}

fn default_error_section() -> Option<String> {
    Some("relaydata".to_owned())
}

fn default_error_field() -> String {
    "RLY2".to_owned()
}

fn default_error_job() -> JobKind {
    JobKind::GetSystemBlocksData
}

fn default_network_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_status_register() -> u16 {
    210
}

fn default_status_write_register() -> u16 {
    466
}

fn default_on_value() -> u16 {
    1
}

fn default_off_value() -> u16 {
    2
}

fn default_address_base() -> u16 {
    211
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_sentinel_id() -> String {
    "1000".to_owned()
}

fn default_write_offsets() -> IndexMap<String, i64> {
    [
        ("B5", -50),
        ("DVI10", 20),
        ("DVI22", 10),
        ("DVI26", 50),
        ("DVI27", 5),
        ("DVI54", 10),
        ("DVI55", 20),
        ("DVI56", 20),
        ("DVI57", 20),
        ("DVI60", 2),
        ("DVI64", 5),
        ("DVI93", 50),
        ("DVI94", 50),
        ("DVI95", 50),
        ("DVI96", 50),
    ]
    .into_iter()
    .map(|(key, offset)| (key.to_owned(), offset))
    .collect()
}

fn default_setting_addresses() -> IndexMap<String, u16> {
    let mut map = IndexMap::new();
    for n in 1..=20u16 {
        map.insert(format!("B{n}"), n);
    }
    for n in 1..=25u16 {
        map.insert(format!("M{n}"), 20 + n);
    }
    for n in 1..=100u16 {
        map.insert(format!("DVI{n}"), 45 + n);
    }
    map.insert("PUMPSTATUS".to_owned(), 156);
    map.insert("AFRIM".to_owned(), 157);
    map
}

fn default_follow_up() -> Vec<FollowUpRule> {
    vec![FollowUpRule {
        section: Some("userdata".to_owned()),
        field: "PUMPSTATUS".to_owned(),
        equals: 2,
        job: JobKind::GetSystemBlocksData,
        priority: Some(1),
    }]
}

fn default_bus_capacity() -> usize {
    64
}

fn default_first_index() -> u32 {
    1
}

fn default_bit_count() -> u8 {
    16
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_file() -> bool {
    true
}

fn default_retained_log_files() -> usize {
    7
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9899))
}

/// Primary configuration object for the bridge runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub writes: WriteConfig,
    #[serde(default)]
    pub polls: Vec<PollGroup>,
    #[serde(default = "default_follow_up")]
    pub follow_up: Vec<FollowUpRule>,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            identity: IdentityConfig::default(),
            backend: BackendConfig::default(),
            schedule: ScheduleConfig::default(),
            network: NetworkConfig::default(),
            writes: WriteConfig::default(),
            polls: Vec::new(),
            follow_up: default_follow_up(),
            bus: BusConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "HEATLINK_CONFIG";

    /// Load configuration from disk, respecting the `HEATLINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Register group serviced by the given read job, if configured.
    pub fn poll_group(&self, job: JobKind) -> Option<&PollGroup> {
        self.polls.iter().find(|group| group.job == job)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        let primary = self.schedule.primary_jobs()?;
        let secondary = self.schedule.secondary_jobs()?;
        if primary.is_empty() {
            bail!("schedule.primary must contain at least one job");
        }

        for (job, _) in primary.iter().chain(secondary.iter()) {
            if job.reads_register_group() && self.poll_group(*job).is_none() {
                bail!("scheduled job '{}' has no [[polls]] register group", job);
            }
        }
        if self.schedule.error_monitor.job.reads_register_group()
            && self.poll_group(self.schedule.error_monitor.job).is_none()
        {
            bail!(
                "error monitor job '{}' has no [[polls]] register group",
                self.schedule.error_monitor.job
            );
        }
        for rule in &self.follow_up {
            if rule.job.requires_payload() {
                bail!("follow-up rule for '{}' cannot raise '{}'", rule.field, rule.job);
            }
            if rule.job.reads_register_group() && self.poll_group(rule.job).is_none() {
                bail!(
                    "follow-up rule for '{}' raises '{}' which has no [[polls]] register group",
                    rule.field,
                    rule.job
                );
            }
        }

        let mut seen_jobs = HashSet::new();
        for group in &self.polls {
            if !group.job.reads_register_group() {
                bail!("job '{}' does not read a register group", group.job);
            }
            if !seen_jobs.insert(group.job) {
                bail!("duplicate [[polls]] group for job '{}'", group.job);
            }
            group.validate()?;
        }

        self.device.validate()?;
        self.backend.validate()?;
        self.network.validate()?;
        self.writes.validate()?;
        Ok(())
    }
}

impl FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Which transport implementation talks to the controller.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Rtu,
    Simulated,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rtu" => Ok(TransportKind::Rtu),
            "simulated" => Ok(TransportKind::Simulated),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// How holding registers are read from the controller.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HoldingRead {
    /// Single-register write of zero; the echoed value is the current content.
    #[default]
    Echo,
    /// Plain read-holding-registers request.
    Fc03,
}

/// Writes to addresses below `below` are shifted up by `offset`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteWindow {
    pub below: u16,
    pub offset: u16,
}

impl Default for WriteWindow {
    fn default() -> Self {
        Self {
            below: 210,
            offset: 256,
        }
    }
}

impl WriteWindow {
    pub fn translate(&self, address: u16) -> u16 {
        if address < self.below {
            address.saturating_add(self.offset)
        } else {
            address
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_response_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub response_timeout_ms: Duration,
    #[serde(default = "default_inter_request_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub inter_request_delay_ms: Duration,
    #[serde(default)]
    pub holding_read: HoldingRead,
    #[serde(default)]
    pub write_window: WriteWindow,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            unit_id: default_unit_id(),
            response_timeout_ms: default_response_timeout(),
            inter_request_delay_ms: default_inter_request_delay(),
            holding_read: HoldingRead::default(),
            write_window: WriteWindow::default(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.response_timeout_ms.is_zero() {
            bail!("device.response_timeout_ms must be greater than zero");
        }
        if self.transport == TransportKind::Rtu && self.serial_port.trim().is_empty() {
            bail!("device.serial_port is required for the rtu transport");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,
    /// Overrides whatever the identity files contain.
    #[serde(default)]
    pub device_id: Option<u64>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identity_file: default_identity_file(),
            credential_file: default_credential_file(),
            device_id: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// When false outbound messages are logged instead of posted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_post_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub post_interval: Duration,
    #[serde(default = "default_initial_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_delay: Duration,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_denied_threshold")]
    pub denied_threshold: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            enabled: true,
            post_interval: default_post_interval(),
            initial_delay: default_initial_delay(),
            request_timeout: default_request_timeout(),
            denied_threshold: default_denied_threshold(),
        }
    }
}

impl BackendConfig {
    pub fn parsed_url(&self) -> Result<Url> {
        Url::parse(&self.url).with_context(|| format!("invalid backend url '{}'", self.url))
    }

    pub fn validate(&self) -> Result<()> {
        self.parsed_url()?;
        if self.post_interval.is_zero() {
            bail!("backend.post_interval must be greater than zero");
        }
        if self.denied_threshold == 0 {
            bail!("backend.denied_threshold must be greater than zero");
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMonitorConfig {
    #[serde(default = "default_error_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_cooldown_ticks")]
    pub cooldown_ticks: u32,
    #[serde(default = "default_error_section")]
    pub section: Option<String>,
    #[serde(default = "default_error_field")]
    pub field: String,
    #[serde(default = "default_error_job")]
    pub job: JobKind,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_error_interval(),
            cooldown_ticks: default_cooldown_ticks(),
            section: default_error_section(),
            field: default_error_field(),
            job: default_error_job(),
        }
    }
}

/// Periodic poll tables. Intervals are in seconds and keyed by job wire name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_routine_priority")]
    pub routine_priority: u8,
    #[serde(default = "default_secondary_priority")]
    pub secondary_priority: u8,
    #[serde(default = "default_fault_priority")]
    pub fault_priority: u8,
    #[serde(default = "default_settings_priority")]
    pub settings_priority: u8,
    #[serde(default = "default_network_priority")]
    pub network_priority: u8,
    /// Always active.
    #[serde(default = "default_primary_schedule")]
    pub primary: IndexMap<String, u64>,
    /// Active only while the backend reports a user online.
    #[serde(default = "default_secondary_schedule")]
    pub secondary: IndexMap<String, u64>,
    #[serde(default)]
    pub error_monitor: ErrorMonitorConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            routine_priority: default_routine_priority(),
            secondary_priority: default_secondary_priority(),
            fault_priority: default_fault_priority(),
            settings_priority: default_settings_priority(),
            network_priority: default_network_priority(),
            primary: default_primary_schedule(),
            secondary: default_secondary_schedule(),
            error_monitor: ErrorMonitorConfig::default(),
        }
    }
}

impl ScheduleConfig {
    pub fn primary_jobs(&self) -> Result<Vec<(JobKind, Duration)>> {
        parse_schedule("primary", &self.primary)
    }

    pub fn secondary_jobs(&self) -> Result<Vec<(JobKind, Duration)>> {
        parse_schedule("secondary", &self.secondary)
    }
}

fn parse_schedule(table: &str, entries: &IndexMap<String, u64>) -> Result<Vec<(JobKind, Duration)>> {
    entries
        .iter()
        .map(|(name, secs)| -> Result<(JobKind, Duration)> {
            let job = JobKind::from_str(name)
                .map_err(|_| anyhow!("schedule.{table}: unknown job name '{name}'"))?;
            if job.is_command() {
                bail!("schedule.{table}: '{name}' cannot be raised by a timer");
            }
            if *secs == 0 {
                bail!("schedule.{table}: interval for '{name}' must be greater than zero");
            }
            Ok((job, Duration::from_secs(*secs)))
        })
        .collect()
}

/// How the network reconciler decides whether the backend is reachable.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Outcome of the most recent posting attempt.
    #[default]
    Posting,
    /// Bounded TCP connect to the backend host.
    Tcp,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_network_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    /// How long a tick waits for the status poll to be serviced.
    #[serde(default = "default_settle")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub settle: Duration,
    #[serde(default = "default_status_register")]
    pub status_register: u16,
    #[serde(default = "default_status_write_register")]
    pub status_write_register: u16,
    #[serde(default = "default_on_value")]
    pub on_value: u16,
    #[serde(default = "default_off_value")]
    pub off_value: u16,
    /// First of twelve consecutive registers holding ip, gateway and dns octets.
    #[serde(default = "default_address_base")]
    pub address_base: u16,
    #[serde(default)]
    pub probe: ProbeKind,
    #[serde(default = "default_probe_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub probe_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_network_interval(),
            settle: default_settle(),
            status_register: default_status_register(),
            status_write_register: default_status_write_register(),
            on_value: default_on_value(),
            off_value: default_off_value(),
            address_base: default_address_base(),
            probe: ProbeKind::default(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.interval.is_zero() {
            bail!("network.interval must be greater than zero");
        }
        if self.on_value == self.off_value {
            bail!("network.on_value and network.off_value must differ");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Confirmation id that marks a batch as a device-level acknowledgement.
    #[serde(default = "default_sentinel_id")]
    pub sentinel_id: String,
    /// Additive bias applied to the value of a key before it is written.
    #[serde(default = "default_write_offsets")]
    pub offsets: IndexMap<String, i64>,
    /// External setting key to device register address.
    #[serde(default = "default_setting_addresses")]
    pub settings: IndexMap<String, u16>,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            sentinel_id: default_sentinel_id(),
            offsets: default_write_offsets(),
            settings: default_setting_addresses(),
        }
    }
}

impl WriteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("writes.max_attempts must be greater than zero");
        }
        if self.sentinel_id.trim().is_empty() {
            bail!("writes.sentinel_id must not be empty");
        }
        Ok(())
    }
}

/// Function-code family used to read a register.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Input,
    #[default]
    Holding,
    Coil,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    U16,
    /// Two's-complement fold for values above 30000.
    S16,
    /// High word at `address`, low word at `low_address` (default `address + 1`).
    U32,
    /// Each bit becomes its own `<name><n>` field.
    Bits,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    Divisor(f64),
    Multiplier(f64),
    /// Register whose value 1..=4 selects x100, x10, x1 or /10.
    DecimalSelector(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterEntry {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub kind: RegisterKind,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub low_address: Option<u16>,
    #[serde(default)]
    pub scale: Option<Scale>,
    /// Added to the decoded value.
    #[serde(default)]
    pub read_offset: i64,
    /// Emit next to the group section instead of inside it.
    #[serde(default)]
    pub top_level: bool,
    #[serde(default = "default_first_index")]
    pub first_index: u32,
    #[serde(default = "default_bit_count")]
    pub bit_count: u8,
}

impl RegisterEntry {
    pub fn low_word_address(&self) -> u16 {
        self.low_address
            .unwrap_or_else(|| self.address.saturating_add(1))
    }

    /// Snapshot keys this entry produces once decoded.
    pub fn published_names(&self) -> Vec<String> {
        match self.encoding {
            Encoding::Bits => (0..u32::from(self.bit_count))
                .map(|n| format!("{}{}", self.name, self.first_index + n))
                .collect(),
            _ => vec![self.name.clone()],
        }
    }
}

/// Registers read by one poll job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollGroup {
    pub job: JobKind,
    /// Object key the fields are published under; fields go top-level when absent.
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub fields: Vec<RegisterEntry>,
}

impl PollGroup {
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for entry in &self.fields {
            if entry.encoding == Encoding::Bits && !(1..=16).contains(&entry.bit_count) {
                bail!("field '{}' must expand between 1 and 16 bits", entry.name);
            }
            for name in entry.published_names() {
                if !names.insert(name.clone()) {
                    bail!(
                        "[[polls]] group '{}' declares field '{}' twice",
                        self.job,
                        name
                    );
                }
            }
            if let Some(Scale::Divisor(divisor)) = entry.scale {
                if divisor == 0.0 {
                    bail!("field '{}' has a zero divisor", entry.name);
                }
            }
        }
        Ok(())
    }
}

/// Raise `job` when `section.field` equals `equals` after a poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpRule {
    #[serde(default)]
    pub section: Option<String>,
    pub field: String,
    pub equals: i64,
    pub job: JobKind,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
    /// Latest published snapshot is mirrored here when set.
    #[serde(default)]
    pub snapshot_file: Option<PathBuf>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            snapshot_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Also write a daily JSON file under `directory`.
    #[serde(default = "default_log_file")]
    pub file: bool,
    /// Daily files kept before the oldest is removed.
    #[serde(default = "default_retained_log_files")]
    pub retained_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file: default_log_file(),
            retained_files: default_retained_log_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        follow_up = []

        [schedule]
        primary = { getSensorData = 10, getPing = 30 }
        secondary = {}

        [schedule.error_monitor]
        job = "getPing"

        [[polls]]
        job = "getSensorData"
        section = "sensordata"
        fields = [
            { name = "F1", address = 1, kind = "input", encoding = "s16" },
            { name = "S_5_M", address = 325, kind = "input", encoding = "u32", scale = { decimal_selector = 29 } },
        ]
    "#;

    #[test]
    fn minimal_configuration_parses_with_defaults() {
        let config: AppConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.device.unit_id, 16);
        assert_eq!(config.device.response_timeout_ms, Duration::from_secs(2));
        assert_eq!(config.backend.denied_threshold, 10);
        assert_eq!(config.writes.max_attempts, 3);
        assert_eq!(config.writes.settings.get("M1"), Some(&21));
        assert_eq!(config.writes.settings.get("DVI100"), Some(&145));
        assert_eq!(config.writes.offsets.get("B5"), Some(&-50));
        let jobs = config.schedule.primary_jobs().unwrap();
        assert_eq!(jobs[0], (JobKind::GetSensorData, Duration::from_secs(10)));
        let group = config.poll_group(JobKind::GetSensorData).unwrap();
        assert_eq!(group.fields[1].scale, Some(Scale::DecimalSelector(29)));
        assert_eq!(group.fields[1].low_word_address(), 326);
    }

    #[test]
    fn unknown_job_names_fail_fast() {
        let raw = MINIMAL.replace("getPing = 30", "getPWMData = 10");
        let err = raw.parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("unknown job name 'getPWMData'"));
    }

    #[test]
    fn scheduled_read_job_requires_register_group() {
        let raw = MINIMAL.replace("getPing = 30", "getUserData = 10");
        let err = raw.parse::<AppConfig>().unwrap_err();
        assert!(format!("{err:#}").contains("getUserData"));
    }

    #[test]
    fn command_jobs_cannot_be_scheduled() {
        let raw = MINIMAL.replace("getPing = 30", "setNetOn = 10");
        assert!(raw.parse::<AppConfig>().is_err());
    }

    #[test]
    fn write_window_shifts_low_addresses_only() {
        let window = WriteWindow::default();
        assert_eq!(window.translate(5), 261);
        assert_eq!(window.translate(466), 466);
    }

    #[test]
    fn load_with_source_picks_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heatlink.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.polls.len(), 1);
    }

    #[test]
    fn reference_configuration_is_valid() {
        let config: AppConfig = include_str!("../../../configs/heatlink.example.toml")
            .parse()
            .unwrap();
        assert_eq!(config.polls.len(), 8);
        assert_eq!(config.writes.settings["DVI40"], 85);
        let relays = config.poll_group(JobKind::GetRelayData).unwrap();
        assert!(relays.fields.iter().any(|f| f.top_level && f.name == "KASKADEonLIST"));
        let sensors = config.poll_group(JobKind::GetSensorData).unwrap();
        let energy = sensors.fields.iter().find(|f| f.name == "S_5_M").unwrap();
        assert_eq!(energy.scale, Some(Scale::DecimalSelector(29)));
    }

    #[test]
    fn overlapping_bit_expansions_are_rejected() {
        let group = PollGroup {
            job: JobKind::GetSystemBlocksData,
            section: None,
            fields: vec![
                RegisterEntry {
                    name: "SBLOCK".into(),
                    address: 171,
                    kind: RegisterKind::Holding,
                    encoding: Encoding::Bits,
                    low_address: None,
                    scale: None,
                    read_offset: 0,
                    top_level: false,
                    first_index: 1,
                    bit_count: 16,
                },
                RegisterEntry {
                    name: "SBLOCK16".into(),
                    address: 172,
                    kind: RegisterKind::Holding,
                    encoding: Encoding::U16,
                    low_address: None,
                    scale: None,
                    read_offset: 0,
                    top_level: false,
                    first_index: 1,
                    bit_count: 16,
                },
            ],
        };
        assert!(group.validate().is_err());
    }
}
