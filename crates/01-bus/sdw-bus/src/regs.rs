//! SCP and DPn register addresses and the Slave-side port programming
//! derived from them.

use smallvec::SmallVec;

use crate::params::{Bank, PortParams, TransportParams};

/// Frame-control register of bank 0; bank 1 sits 0x10 above.
pub const SCP_FRAMECTRL_B0: u32 = 0x60;
const BANK_STRIDE: u32 = 0x10;

pub const DPN_PORTCTRL: u32 = 0x02;
pub const DPN_BLOCKCTRL1: u32 = 0x03;

pub const DPN_CHANNELEN_B0: u32 = 0x20;
pub const DPN_BLOCKCTRL2_B0: u32 = 0x21;
pub const DPN_SAMPLECTRL1_B0: u32 = 0x22;
pub const DPN_SAMPLECTRL2_B0: u32 = 0x23;
pub const DPN_OFFSETCTRL1_B0: u32 = 0x24;
pub const DPN_OFFSETCTRL2_B0: u32 = 0x25;
pub const DPN_HCTRL_B0: u32 = 0x26;
pub const DPN_BLOCKCTRL3_B0: u32 = 0x27;
pub const DPN_LANECTRL_B0: u32 = 0x28;

pub fn scp_framectrl(bank: Bank) -> u32 {
    SCP_FRAMECTRL_B0 + BANK_STRIDE * u32::from(bank.index())
}

pub fn dpn_base(port: u8) -> u32 {
    0x100 * u32::from(port)
}

/// Address of a banked DPn register given its bank-0 offset.
pub fn dpn_banked(port: u8, bank: Bank, reg_b0: u32) -> u32 {
    dpn_base(port) + reg_b0 + BANK_STRIDE * u32::from(bank.index())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegWrite {
    pub addr: u32,
    pub value: u8,
}

impl RegWrite {
    fn new(addr: u32, value: u8) -> Self {
        Self { addr, value }
    }
}

pub fn channel_enable(port: u8, bank: Bank, mask: u8) -> RegWrite {
    RegWrite::new(dpn_banked(port, bank, DPN_CHANNELEN_B0), mask)
}

/// Writes that program one Slave data port: the bank-independent control
/// first, then the banked transport registers of `bank`.
pub fn slave_port_writes(
    port: &PortParams,
    tp: &TransportParams,
    bank: Bank,
) -> SmallVec<[RegWrite; 10]> {
    let num = tp.port_num;
    let si = tp.sample_interval.saturating_sub(1);
    let word_length = port.bps.saturating_sub(1).min(u32::from(u8::MAX)) as u8;
    let banked = |reg| dpn_banked(num, bank, reg);

    let mut writes = SmallVec::new();
    writes.push(RegWrite::new(
        dpn_base(num) + DPN_PORTCTRL,
        port.flow_mode.bits() | (port.data_mode.bits() << 2),
    ));
    writes.push(RegWrite::new(dpn_base(num) + DPN_BLOCKCTRL1, word_length));
    writes.push(RegWrite::new(banked(DPN_BLOCKCTRL2_B0), tp.block_group_count));
    writes.push(RegWrite::new(banked(DPN_SAMPLECTRL1_B0), (si & 0xff) as u8));
    writes.push(RegWrite::new(banked(DPN_SAMPLECTRL2_B0), ((si >> 8) & 0xff) as u8));
    writes.push(RegWrite::new(banked(DPN_OFFSETCTRL1_B0), tp.offset1));
    writes.push(RegWrite::new(banked(DPN_OFFSETCTRL2_B0), tp.offset2));
    writes.push(RegWrite::new(
        banked(DPN_HCTRL_B0),
        (tp.hstart << 4) | (tp.hstop & 0xf),
    ));
    writes.push(RegWrite::new(banked(DPN_BLOCKCTRL3_B0), tp.block_pack_mode.bits()));
    writes.push(RegWrite::new(banked(DPN_LANECTRL_B0), tp.lane_ctrl));
    writes
}
