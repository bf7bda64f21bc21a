//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fault follow-up polling and value-triggered follow-up jobs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use heatlink_common::config::ErrorMonitorConfig;
use heatlink_common::FollowUpRule;
use heatlink_rt::RateLimiter;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::job::{Job, JobQueue};
use crate::snapshot::Snapshot;

/// Raises once on the first tick, then while the error relay is asserted or the
/// backend is unreachable, and for `cooldown` ticks after both clear.
#[derive(Debug, Clone)]
pub struct ErrorFollowUp {
    cooldown: u32,
    remaining: u32,
    started: bool,
}

impl ErrorFollowUp {
    pub fn new(cooldown: u32) -> Self {
        Self {
            cooldown,
            remaining: 0,
            started: false,
        }
    }

    pub fn on_tick(&mut self, asserted: bool, offline: bool) -> bool {
        let first = !self.started;
        self.started = true;
        if asserted || offline {
            self.remaining = self.cooldown;
        }
        let follow = asserted || offline || self.remaining > 0;
        if follow {
            self.remaining = self.remaining.saturating_sub(1);
        }
        first || follow
    }
}

pub struct ErrorMonitor {
    config: ErrorMonitorConfig,
    priority: u8,
    queue: JobQueue,
    relay: watch::Receiver<bool>,
    connectivity: Option<watch::Receiver<bool>>,
    posted: bool,
    state: ErrorFollowUp,
}

impl ErrorMonitor {
    pub fn new(
        config: ErrorMonitorConfig,
        priority: u8,
        queue: JobQueue,
        relay: watch::Receiver<bool>,
    ) -> Self {
        let state = ErrorFollowUp::new(config.cooldown_ticks);
        Self {
            config,
            priority,
            queue,
            relay,
            connectivity: None,
            posted: false,
            state,
        }
    }

    /// Treat a failed post to the backend like an asserted relay.
    pub fn with_connectivity(mut self, connectivity: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Offline only once a post has actually failed; no post yet is not offline.
    fn offline(&mut self) -> bool {
        let Some(connectivity) = self.connectivity.as_mut() else {
            return false;
        };
        if connectivity.has_changed().unwrap_or(false) {
            self.posted = true;
        }
        self.posted && !*connectivity.borrow_and_update()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut limiter = RateLimiter::new(self.config.interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("error monitor shutdown");
                    break;
                }
                _ = limiter.tick() => {
                    let asserted = *self.relay.borrow();
                    let offline = self.offline();
                    if self.state.on_tick(asserted, offline) {
                        trace!(asserted, offline, job = %self.config.job, "error follow-up raised");
                        Job::new(self.priority, self.config.job).submit(&self.queue);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Looks up `section.field` (or top-level `field`) in a partial result.
pub fn partial_field<'a>(partial: &'a Snapshot, section: Option<&str>, field: &str) -> Option<&'a Value> {
    match section {
        Some(section) => partial.get(section)?.get(field),
        None => partial.get(field),
    }
}

/// Whether the configured error-relay field is present and non-zero in `partial`.
pub fn relay_asserted(config: &ErrorMonitorConfig, partial: &Snapshot) -> Option<bool> {
    partial_field(partial, config.section.as_deref(), &config.field)
        .and_then(Value::as_f64)
        .map(|value| value != 0.0)
}

/// Jobs raised by `rules` whose field matches in `partial`.
pub fn follow_ups(rules: &[FollowUpRule], partial: &Snapshot, default_priority: u8) -> Vec<Job> {
    rules
        .iter()
        .filter(|rule| {
            partial_field(partial, rule.section.as_deref(), &rule.field)
                .and_then(Value::as_f64)
                .is_some_and(|value| value == rule.equals as f64)
        })
        .map(|rule| Job::new(rule.priority.unwrap_or(default_priority), rule.job))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatlink_common::JobKind;
    use serde_json::json;
    use std::time::Duration;

    fn object(value: Value) -> Snapshot {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn relay_burst_is_followed_by_a_bounded_cooldown() {
        let mut monitor = ErrorFollowUp::new(5);
        let raised: Vec<bool> = [false, true, true, false, false, false, false, false, false]
            .into_iter()
            .map(|asserted| monitor.on_tick(asserted, false))
            .collect();
        assert_eq!(
            raised,
            vec![true, true, true, true, true, true, true, false, false]
        );
    }

    #[test]
    fn quiet_relay_raises_only_the_initial_poll() {
        let mut monitor = ErrorFollowUp::new(5);
        assert!(monitor.on_tick(false, false));
        assert!((0..10).all(|_| !monitor.on_tick(false, false)));
    }

    #[test]
    fn offline_backend_keeps_follow_up_running() {
        let mut monitor = ErrorFollowUp::new(2);
        assert!(monitor.on_tick(false, false));
        assert!(!monitor.on_tick(false, false));
        assert!((0..4).all(|_| monitor.on_tick(false, true)));
        assert!(monitor.on_tick(false, false));
        assert!(!monitor.on_tick(false, false));
    }

    #[test]
    fn follow_up_rules_match_exact_values() {
        let rules = vec![FollowUpRule {
            section: Some("userdata".into()),
            field: "PUMPSTATUS".into(),
            equals: 2,
            job: JobKind::GetSystemBlocksData,
            priority: Some(1),
        }];
        let raised = follow_ups(&rules, &object(json!({"userdata": {"PUMPSTATUS": 2}})), 2);
        assert_eq!(raised, vec![Job::new(1, JobKind::GetSystemBlocksData)]);
        assert!(follow_ups(&rules, &object(json!({"userdata": {"PUMPSTATUS": 1}})), 2).is_empty());
        assert!(follow_ups(&rules, &object(json!({"relaydata": {"RLY2": 2}})), 2).is_empty());
    }

    #[test]
    fn relay_flag_reads_the_configured_field() {
        let config = ErrorMonitorConfig::default();
        assert_eq!(
            relay_asserted(&config, &object(json!({"relaydata": {"RLY2": 1}}))),
            Some(true)
        );
        assert_eq!(
            relay_asserted(&config, &object(json!({"relaydata": {"RLY2": 0}}))),
            Some(false)
        );
        assert_eq!(relay_asserted(&config, &object(json!({"sensordata": {}}))), None);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_raises_at_fault_priority() {
        let queue = JobQueue::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (_relay_tx, relay_rx) = watch::channel(false);
        let config = ErrorMonitorConfig::default();
        let interval = config.interval;
        let task = tokio::spawn(ErrorMonitor::new(config, 2, queue.clone(), relay_rx).run(shutdown_rx));

        tokio::time::sleep(interval * 3 + Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 1);
        let job = queue.pop().await;
        assert_eq!(job, Job::new(2, JobKind::GetSystemBlocksData));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_post_raises_every_tick_until_cooldown() {
        let queue = JobQueue::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (_relay_tx, relay_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);
        let config = ErrorMonitorConfig {
            cooldown_ticks: 2,
            ..ErrorMonitorConfig::default()
        };
        let interval = config.interval;
        let monitor = ErrorMonitor::new(config, 2, queue.clone(), relay_rx)
            .with_connectivity(connected_rx);
        let task = tokio::spawn(monitor.run(shutdown_rx));

        // Not yet posted: only the start-up poll.
        tokio::time::sleep(interval * 2 + Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 1);

        connected_tx.send_replace(false);
        tokio::time::sleep(interval * 3).await;
        assert_eq!(queue.len(), 4);

        connected_tx.send_replace(true);
        tokio::time::sleep(interval * 4).await;
        assert_eq!(queue.len(), 5);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
