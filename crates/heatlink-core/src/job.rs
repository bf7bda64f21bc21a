//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Jobs exchanged between producers and the dispatcher."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use heatlink_common::JobKind;
use heatlink_rt::PriorityQueue;

use crate::network::NetTriple;
use crate::settings::SettingUpdateRequest;

/// The queue every producer pushes onto and the dispatcher drains.
pub type JobQueue = PriorityQueue<Job>;

#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Settings(SettingUpdateRequest),
    Network(NetTriple),
}

/// One unit of scheduled work. Lower priority numbers are serviced first.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub priority: u8,
    pub kind: JobKind,
    pub payload: Option<JobPayload>,
}

impl Job {
    pub fn new(priority: u8, kind: JobKind) -> Self {
        Self {
            priority,
            kind,
            payload: None,
        }
    }

    pub fn settings(priority: u8, request: SettingUpdateRequest) -> Self {
        Self {
            priority,
            kind: JobKind::SetSettingData,
            payload: Some(JobPayload::Settings(request)),
        }
    }

    pub fn set_ip(priority: u8, triple: NetTriple) -> Self {
        Self {
            priority,
            kind: JobKind::SetIp,
            payload: Some(JobPayload::Network(triple)),
        }
    }

    pub fn submit(self, queue: &JobQueue) {
        queue.push(self.priority, self);
    }
}
