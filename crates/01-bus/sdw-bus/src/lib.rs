//! SoundWire bandwidth allocation and bank-switch engine.
//!
//! A [`SdwCore`] owns the registered [`Bus`]es and the stream-tag table.
//! Stream transitions re-plan every bus a stream spans: the solver picks a
//! clock gear and frame shape, the transport computer lays out each port,
//! and the bank-switch protocol programs the inactive bank and flips to it.
#![allow(missing_docs)]

pub mod bank;
mod bus;
mod completion;
mod engine;
mod error;
pub mod frame;
mod host;
mod manager;
mod params;
pub mod regs;
mod runtime;
mod slave;
pub mod solver;
pub mod transport;

pub use bank::{AggregatedSwitch, BankSwitch, PendingSwitch, SwitchState, SyncSwitch};
pub use bus::{Bus, BusState, SwitchMetricsSnapshot};
pub use completion::Completion;
pub use engine::{Link, Transition};
pub use error::{SdwError, SdwResult};
pub use frame::RowColPair;
pub use host::{HostOps, Target};
pub use manager::{Endpoint, PortConfig, SdwCore, StreamConfig, MAX_STREAM_TAGS};
pub use params::{
    Bank, BlockPackMode, BusConfig, BusId, BusParams, DataMode, DevNum, Direction, FlowMode,
    PortParams, StreamParams, StreamTag, StreamType, TransportParams, BROADCAST_DEV_NUM,
    CLK_FREQ_MODULUS, DOUBLE_RATE_FACTOR, MAX_DATA_PORT, MIN_DATA_PORT,
};
pub use runtime::{
    BusRuntime, MasterRuntime, PortList, PortRuntime, SlaveRuntime, StreamRuntime, StreamState,
};
pub use slave::{AudioModeProps, DpnProps, SlaveDevice};
pub use solver::Selection;
pub use transport::GroupParams;
