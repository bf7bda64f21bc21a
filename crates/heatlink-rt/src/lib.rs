//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the bridge orchestrator."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Scheduling helpers for the HeatLink runtime.

pub mod producer;
pub mod queue;
pub mod scheduling;

pub use producer::PeriodicProducer;
pub use queue::PriorityQueue;
pub use scheduling::{RateLimiter, TaskSet};
