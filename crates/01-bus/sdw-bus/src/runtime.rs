//! Stream runtime graph.
//!
//! A bus owns one [`MasterRuntime`] per stream it carries; each Master owns
//! the [`SlaveRuntime`]s of that stream on the same bus, and every runtime
//! owns its [`PortRuntime`]s. Streams refer to these records by
//! `(BusId, DevNum)` handles instead of pointers.

use smallvec::SmallVec;

use crate::params::{
    BusId, DevNum, Direction, PortParams, StreamParams, StreamTag, StreamType, TransportParams,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Allocated,
    Configured,
    Prepared,
    Enabled,
    Disabled,
    Deprepared,
}

impl StreamState {
    /// Whether a stream in this state occupies bandwidth on its buses.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Prepared | StreamState::Enabled | StreamState::Disabled
        )
    }

    /// Whether the stream's channels are enabled in the live bank.
    pub fn channels_enabled(self) -> bool {
        self == StreamState::Enabled
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRuntime {
    pub port_num: u8,
    pub channel_mask: u8,
    pub transport_params: TransportParams,
    pub port_params: PortParams,
}

impl PortRuntime {
    pub fn new(port_num: u8, channel_mask: u8) -> Self {
        Self {
            port_num,
            channel_mask,
            transport_params: TransportParams::default(),
            port_params: PortParams::default(),
        }
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_mask.count_ones()
    }
}

pub type PortList = SmallVec<[PortRuntime; 4]>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlaveRuntime {
    pub dev: DevNum,
    pub stream: StreamTag,
    pub direction: Direction,
    pub stream_params: StreamParams,
    pub ports: PortList,
}

impl SlaveRuntime {
    pub fn channel_count(&self) -> u32 {
        self.ports.iter().map(PortRuntime::channel_count).sum()
    }
}

/// Column range and offset the Master's first port received in the last
/// computation pass; the Slave ports are laid out from it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusRuntime {
    pub hstart: u32,
    pub hstop: u32,
    pub block_offset: u32,
    pub sub_block_offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterRuntime {
    pub bus: BusId,
    pub stream: StreamTag,
    pub direction: Direction,
    pub stream_params: StreamParams,
    /// Bus-local copy of the owning stream's state.
    pub state: StreamState,
    pub ports: PortList,
    pub slaves: SmallVec<[SlaveRuntime; 2]>,
    pub bus_runtime: BusRuntime,
}

impl MasterRuntime {
    pub fn new(bus: BusId, stream: StreamTag, direction: Direction, params: StreamParams) -> Self {
        Self {
            bus,
            stream,
            direction,
            stream_params: params,
            state: StreamState::Configured,
            ports: SmallVec::new(),
            slaves: SmallVec::new(),
            bus_runtime: BusRuntime::default(),
        }
    }

    /// Included in bandwidth accounting and transport computation.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn slave(&self, dev: DevNum) -> Option<&SlaveRuntime> {
        self.slaves.iter().find(|s| s.dev == dev)
    }

    pub fn slave_mut(&mut self, dev: DevNum) -> Option<&mut SlaveRuntime> {
        self.slaves.iter_mut().find(|s| s.dev == dev)
    }

    /// Every port below this Master, Slave ports first.
    pub fn all_ports(&self) -> impl Iterator<Item = &PortRuntime> {
        self.slaves
            .iter()
            .flat_map(|s| s.ports.iter())
            .chain(self.ports.iter())
    }
}

/// Stream-level record. Runtimes themselves live on the buses.
#[derive(Clone, Debug)]
pub struct StreamRuntime {
    pub tag: StreamTag,
    pub name: Option<String>,
    pub stream_type: StreamType,
    pub params: StreamParams,
    pub state: StreamState,
    pub tx_ref_count: u32,
    pub rx_ref_count: u32,
    pub masters: SmallVec<[BusId; 2]>,
    pub slaves: SmallVec<[(BusId, DevNum); 4]>,
}

impl StreamRuntime {
    pub fn new(tag: StreamTag, name: Option<String>) -> Self {
        Self {
            tag,
            name,
            stream_type: StreamType::Pcm,
            params: StreamParams::default(),
            state: StreamState::Allocated,
            tx_ref_count: 0,
            rx_ref_count: 0,
            masters: SmallVec::new(),
            slaves: SmallVec::new(),
        }
    }

    /// Buses spanned by the stream, ascending: the lock acquisition order.
    pub fn bus_order(&self) -> SmallVec<[BusId; 2]> {
        let mut buses = self.masters.clone();
        buses.sort_unstable();
        buses.dedup();
        buses
    }

    pub fn count_endpoint(&mut self, direction: Direction) {
        match direction {
            Direction::Tx => self.tx_ref_count += 1,
            Direction::Rx => self.rx_ref_count += 1,
        }
    }

    pub fn uncount_endpoint(&mut self, direction: Direction) {
        match direction {
            Direction::Tx => self.tx_ref_count = self.tx_ref_count.saturating_sub(1),
            Direction::Rx => self.rx_ref_count = self.rx_ref_count.saturating_sub(1),
        }
    }
}
