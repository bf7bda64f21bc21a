//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Register transport and decoding for the heat-pump controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Everything that touches controller registers: the [`Transport`] seam, the
//! serialising decorator every caller goes through, word decoding helpers, and
//! the two transport implementations (serial Modbus RTU and an in-memory device).

pub mod codec;
pub mod group;
pub mod rtu;
pub mod sim;
pub mod transport;

pub use group::{read_group, GroupRead};
pub use rtu::RtuTransport;
pub use sim::SimulatedTransport;
pub use transport::{FaultKind, SerializedTransport, SharedTransport, Transport};
