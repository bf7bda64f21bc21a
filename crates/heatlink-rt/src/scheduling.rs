//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the bridge orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Simple async rate limiter that ensures steady loop intervals.
///
/// The first tick completes immediately; late ticks are delayed rather than bunched.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Same cadence, but the first tick fires after `delay` instead of immediately.
    pub fn starting_after(delay: Duration, period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    /// Push the next tick a full period into the future.
    pub fn reset(&mut self) {
        self.interval.reset();
    }
}

/// Named set of long-running tasks joined together at shutdown.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl TaskSet {
    pub fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Await every task, logging failures instead of stopping at the first one.
    pub async fn join(self) -> Result<()> {
        let mut failures = 0usize;
        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => debug!(task = name, "task finished"),
                Ok(Err(err)) => {
                    failures += 1;
                    error!(task = name, error = %err, "task returned an error");
                }
                Err(err) => {
                    failures += 1;
                    error!(task = name, error = %err, "task join failure");
                }
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} task(s) ended abnormally");
        }
        Ok(())
    }
}
