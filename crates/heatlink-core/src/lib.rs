//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Bridge core: job dispatch, write confirmation, snapshot publishing,
//! network reconciliation, credential lifecycle and the posting loop.

pub mod backend;
pub mod bus;
pub mod confirm;
pub mod credentials;
pub mod dispatcher;
pub mod hostinfo;
pub mod job;
pub mod monitor;
pub mod network;
pub mod orchestrator;
pub mod posting;
pub mod settings;
pub mod snapshot;

pub use backend::{Backend, BackendError, BackendReply, DryRunBackend, HttpBackend};
pub use bus::{BusEvent, LocalBus};
pub use confirm::WriteConfirmer;
pub use credentials::{resolve_identity, CredentialManager};
pub use dispatcher::Dispatcher;
pub use hostinfo::{HostAddresses, HostFacts};
pub use job::{Job, JobPayload, JobQueue};
pub use network::{AddressSource, NetAction, NetReconciler, NetState, NetTriple, StaticAddresses};
pub use orchestrator::{BridgeHandle, BridgeOrchestrator};
pub use posting::{PostOutcome, PostingLoop};
pub use settings::{SettingUpdate, SettingUpdateRequest, WriteBatch, WriteOutcome};
pub use snapshot::{OutboundBuffer, ResultCache, Snapshot};
