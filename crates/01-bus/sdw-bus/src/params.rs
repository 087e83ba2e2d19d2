//! Bus, stream, and port parameter records shared by the solver, the
//! transport computer, and the bank-switch protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SdwError, SdwResult};
use crate::frame;

/// Double-rate factor: data is clocked on both edges.
pub const DOUBLE_RATE_FACTOR: u32 = 2;

/// Candidate double-rate clocks must be a multiple of this to keep frame
/// rates aligned.
pub const CLK_FREQ_MODULUS: u32 = 3000;

/// Data ports 1..=14 carry audio; DP0 is the control port and 15 is reserved.
pub const MIN_DATA_PORT: u8 = 1;
pub const MAX_DATA_PORT: u8 = 14;

/// Slave device number (1..=11 on the wire; 15 is broadcast).
pub type DevNum = u8;

/// Broadcast device number.
pub const BROADCAST_DEV_NUM: DevNum = 15;

/// Identifies a bus (link) registered with the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(pub u32);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sdw{}", self.0)
    }
}

/// Bus-driver identifier shared by every endpoint of one logical stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamTag(pub u32);

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One of the two register banks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bank {
    #[default]
    B0,
    B1,
}

impl Bank {
    pub fn index(self) -> u8 {
        match self {
            Bank::B0 => 0,
            Bank::B1 => 1,
        }
    }

    /// The bank that is not `self`.
    pub fn other(self) -> Bank {
        match self {
            Bank::B0 => Bank::B1,
            Bank::B1 => Bank::B0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub fn index(self) -> u8 {
        match self {
            Direction::Rx => 0,
            Direction::Tx => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    #[default]
    Pcm,
    Pdm,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    #[default]
    Normal,
    Prbs,
    Static0,
    Static1,
}

impl DataMode {
    pub fn bits(self) -> u8 {
        match self {
            DataMode::Normal => 0,
            DataMode::Prbs => 1,
            DataMode::Static0 => 2,
            DataMode::Static1 => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlowMode {
    #[default]
    Isochronous,
    TxControlled,
    RxControlled,
    Async,
}

impl FlowMode {
    pub fn bits(self) -> u8 {
        match self {
            FlowMode::Isochronous => 0,
            FlowMode::TxControlled => 1,
            FlowMode::RxControlled => 2,
            FlowMode::Async => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockPackMode {
    #[default]
    PerPort,
    PerChannel,
}

impl BlockPackMode {
    pub fn bits(self) -> u8 {
        match self {
            BlockPackMode::PerPort => 0,
            BlockPackMode::PerChannel => 1,
        }
    }
}

/// Audio format shared by every endpoint of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    /// Sample rate in Hz.
    pub rate: u32,
    pub channel_count: u32,
    /// Bits per sample.
    pub bps: u32,
}

impl StreamParams {
    /// Bits per second this stream occupies on one bus.
    pub fn bandwidth(&self) -> u64 {
        u64::from(self.rate) * u64::from(self.channel_count) * u64::from(self.bps)
    }

    /// Bits per sample period.
    pub fn payload_bits(&self) -> u32 {
        self.bps * self.channel_count
    }
}

/// Bank-independent port programming.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortParams {
    pub num: u8,
    pub bps: u32,
    pub flow_mode: FlowMode,
    pub data_mode: DataMode,
}

/// Banked transport programming for one data port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportParams {
    pub port_num: u8,
    pub valid: bool,
    /// Encoded block group count (0 means one group).
    pub block_group_count: u8,
    pub offset1: u8,
    pub offset2: u8,
    pub hstart: u8,
    pub hstop: u8,
    /// Sample interval in bits; the register holds `sample_interval - 1`.
    pub sample_interval: u32,
    pub block_pack_mode: BlockPackMode,
    pub lane_ctrl: u8,
}

/// Largest encodable sample interval (16-bit register holding interval - 1).
pub const MAX_SAMPLE_INTERVAL: u32 = 1 << 16;
/// Largest column index encodable in a 4-bit hstart/hstop field.
pub const MAX_HCTRL: u32 = 0xf;
/// Block offset spans the two 8-bit offset registers.
pub const MAX_BLOCK_OFFSET: u32 = 0xffff;

impl TransportParams {
    /// Builds transport parameters for a port, rejecting values the DPn
    /// registers cannot hold.
    pub fn new(
        port_num: u8,
        sample_interval: u32,
        block_offset: u32,
        hstart: u32,
        hstop: u32,
    ) -> SdwResult<Self> {
        let check = |field, value: u32, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(SdwError::Encoding {
                    port: port_num,
                    field,
                    value,
                })
            }
        };
        check(
            "sample_interval",
            sample_interval,
            (1..=MAX_SAMPLE_INTERVAL).contains(&sample_interval),
        )?;
        check("block_offset", block_offset, block_offset <= MAX_BLOCK_OFFSET)?;
        check("hstart", hstart, hstart <= MAX_HCTRL)?;
        check("hstop", hstop, hstop <= MAX_HCTRL && hstart <= hstop)?;

        Ok(Self {
            port_num,
            valid: true,
            block_group_count: 0,
            offset1: (block_offset & 0xff) as u8,
            offset2: (block_offset >> 8) as u8,
            hstart: hstart as u8,
            hstop: hstop as u8,
            sample_interval,
            block_pack_mode: BlockPackMode::PerPort,
            lane_ctrl: 0,
        })
    }

    pub fn block_offset(&self) -> u32 {
        u32::from(self.offset1) | (u32::from(self.offset2) << 8)
    }
}

/// Static bus configuration supplied when the bus is registered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum bus clock in Hz (single rate).
    pub max_clk_freq: u32,
    /// Clock divisors the controller supports.
    pub clk_gears: Vec<u32>,
    /// Frame shape used before any stream is prepared.
    pub default_row: u32,
    pub default_col: u32,
    pub m_data_mode: DataMode,
    pub s_data_mode: DataMode,
    pub bank_switch_timeout_ms: u64,
    /// Force aggregated bank switches even for single-bus streams.
    pub multi_link: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_clk_freq: 12_000_000,
            clk_gears: vec![1, 2, 4],
            default_row: 48,
            default_col: 2,
            m_data_mode: DataMode::Normal,
            s_data_mode: DataMode::Normal,
            bank_switch_timeout_ms: 3,
            multi_link: false,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> SdwResult<()> {
        if self.max_clk_freq == 0 {
            return Err(SdwError::InvalidConfig("max_clk_freq must be non-zero"));
        }
        if self.clk_gears.is_empty() {
            return Err(SdwError::InvalidConfig("no clock gears configured"));
        }
        if self.clk_gears.contains(&0) {
            return Err(SdwError::InvalidConfig("clock gear of zero"));
        }
        if frame::try_row_index(self.default_row).is_none()
            || frame::try_col_index(self.default_col).is_none()
        {
            return Err(SdwError::InvalidFrameShape {
                row: self.default_row,
                col: self.default_col,
            });
        }
        Ok(())
    }

    pub fn max_dr_clk_freq(&self) -> u32 {
        self.max_clk_freq.saturating_mul(DOUBLE_RATE_FACTOR)
    }
}

/// Live bus parameters, mutated only by the allocation engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusParams {
    pub max_dr_clk_freq: u32,
    pub curr_dr_clk_freq: u32,
    pub clk_div: u32,
    pub row: u32,
    pub col: u32,
    pub frame_freq: u32,
    pub system_interval: u64,
    pub stream_interval: u64,
    pub active_bank: Bank,
    /// Aggregate bandwidth of included streams, bit/s.
    pub bandwidth: u64,
}

impl BusParams {
    pub fn from_config(config: &BusConfig) -> Self {
        let max_dr = config.max_dr_clk_freq();
        let frame_int = config.default_row * config.default_col;
        Self {
            max_dr_clk_freq: max_dr,
            curr_dr_clk_freq: max_dr,
            clk_div: 1,
            row: config.default_row,
            col: config.default_col,
            frame_freq: if frame_int == 0 { 0 } else { max_dr / frame_int },
            system_interval: 0,
            stream_interval: 0,
            active_bank: Bank::B0,
            bandwidth: 0,
        }
    }

    pub fn frame_interval(&self) -> u32 {
        self.row * self.col
    }

    /// Bank that is safe to reprogram.
    pub fn next_bank(&self) -> Bank {
        self.active_bank.other()
    }
}
