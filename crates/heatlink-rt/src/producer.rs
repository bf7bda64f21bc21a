//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixed-interval producers feeding the shared priority queue."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::queue::PriorityQueue;
use crate::scheduling::RateLimiter;

/// Enqueues a copy of `item` every `period`, whether or not earlier copies were consumed.
///
/// A gated producer only enqueues while its gate reads `true`, and enqueues once
/// right away whenever the gate opens.
#[derive(Debug)]
pub struct PeriodicProducer<T> {
    name: String,
    queue: PriorityQueue<T>,
    priority: u8,
    item: T,
    period: Duration,
    gate: Option<watch::Receiver<bool>>,
}

impl<T> PeriodicProducer<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        queue: PriorityQueue<T>,
        priority: u8,
        item: T,
        period: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            priority,
            item,
            period,
            gate: None,
        }
    }

    pub fn gated(mut self, gate: watch::Receiver<bool>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn is_open(&self) -> bool {
        self.gate.as_ref().map_or(true, |gate| *gate.borrow())
    }

    fn enqueue(&self) {
        trace!(producer = %self.name, priority = self.priority, "enqueue");
        self.queue.push(self.priority, self.item.clone());
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut limiter = RateLimiter::new(self.period);
        let mut gate_live = self.gate.is_some();
        debug!(producer = %self.name, period_secs = self.period.as_secs_f64(), gated = gate_live, "producer started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(producer = %self.name, "producer shutdown");
                    break;
                }
                changed = wait_for_gate(self.gate.as_mut()), if gate_live => {
                    match changed {
                        Ok(true) => {
                            self.enqueue();
                            limiter.reset();
                        }
                        Ok(false) => {}
                        Err(_) => gate_live = false,
                    }
                }
                _ = limiter.tick() => {
                    if self.is_open() {
                        self.enqueue();
                    }
                }
            }
        }
        Ok(())
    }
}

async fn wait_for_gate(
    gate: Option<&mut watch::Receiver<bool>>,
) -> Result<bool, watch::error::RecvError> {
    match gate {
        Some(gate) => {
            gate.changed().await?;
            Ok(*gate.borrow_and_update())
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn producer_enqueues_every_period_without_waiting_for_consumers() {
        let queue = PriorityQueue::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let producer = PeriodicProducer::new(
            "sensor",
            queue.clone(),
            10,
            "getSensorData",
            Duration::from_secs(10),
        );
        let task = tokio::spawn(producer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(queue.len(), 4);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gated_producer_follows_its_gate() {
        let queue = PriorityQueue::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (gate_tx, gate_rx) = watch::channel(false);
        let producer = PeriodicProducer::new(
            "login-sensor",
            queue.clone(),
            2,
            "getSensorData",
            Duration::from_secs(30),
        )
        .gated(gate_rx);
        let task = tokio::spawn(producer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert!(queue.is_empty());

        gate_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.len(), 2);

        gate_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(queue.len(), 2);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
