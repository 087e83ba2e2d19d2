use std::collections::TryReserveError;

use thiserror::Error;

use crate::params::{BusId, DevNum, StreamTag};
use crate::runtime::StreamState;

pub type SdwResult<T> = Result<T, SdwError>;

#[derive(Debug, Error)]
pub enum SdwError {
    /// No clock gear is accepted by every slave port attached to the bus.
    #[error("bus {bus}: no clock gear satisfies every attached slave port")]
    CapabilityMismatch { bus: BusId },

    /// No frame shape leaves enough headroom at any candidate clock.
    #[error("bus {bus}: no frame shape carries {bandwidth} bit/s")]
    BandwidthExhausted { bus: BusId, bandwidth: u64 },

    #[error("rate groups need {needed} columns, frame has {available}")]
    ColumnOverflow { needed: u32, available: u32 },

    #[error("bus {bus}: bank switch not confirmed within {timeout_ms} ms")]
    SwitchTimeout { bus: BusId, timeout_ms: u64 },

    #[error("allocation failed: {0}")]
    AllocationFailure(#[from] TryReserveError),

    #[error("invalid bus configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("frame shape {row}x{col} is not in the row/column catalog")]
    InvalidFrameShape { row: u32, col: u32 },

    #[error("zero sample or frame interval")]
    InvalidInterval,

    #[error("port {port}: {field}={value} does not fit its register")]
    Encoding {
        port: u8,
        field: &'static str,
        value: u32,
    },

    #[error("unknown stream tag {0}")]
    UnknownStream(StreamTag),

    #[error("unknown bus {0}")]
    UnknownBus(BusId),

    #[error("bus {bus}: unknown slave device {dev}")]
    UnknownSlave { bus: BusId, dev: DevNum },

    #[error("stream {tag}: cannot {op} from {state:?}")]
    InvalidState {
        tag: StreamTag,
        op: &'static str,
        state: StreamState,
    },

    #[error("invalid port {port}: {reason}")]
    InvalidPort { port: u8, reason: &'static str },

    #[error("resource busy: {0}")]
    Busy(&'static str),

    #[error("host controller error: {0}")]
    Host(String),
}

impl SdwError {
    pub fn host(msg: impl Into<String>) -> Self {
        SdwError::Host(msg.into())
    }

    /// Errors raised by the solver or the transport computer, before any
    /// register was touched.
    pub fn is_computation(&self) -> bool {
        matches!(
            self,
            SdwError::CapabilityMismatch { .. }
                | SdwError::BandwidthExhausted { .. }
                | SdwError::ColumnOverflow { .. }
                | SdwError::InvalidInterval
                | SdwError::Encoding { .. }
        )
    }
}
