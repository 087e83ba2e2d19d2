//! Simulated SoundWire host controller and TOML topologies for exercising
//! the bus engine without hardware.

mod host;
mod topology;

pub use host::{HostEvent, MasterPortRegs, SimHost};
pub use topology::{BusSpec, EndpointSpec, PortSpec, StreamSpec, System, Topology};
