//! Bank-switch protocol.
//!
//! The live configuration sits in the active bank while the engine writes
//! the next one into the other bank. A broadcast write to the frame-control
//! register of the inactive bank makes every device switch at the same
//! frame boundary.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::bus::BusState;
use crate::completion::Completion;
use crate::error::{SdwError, SdwResult};
use crate::frame;
use crate::host::{HostOps, Target};
use crate::params::{Bank, BusId, StreamTag};
use crate::regs;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SwitchState {
    #[default]
    Idle,
    /// Alternate bank written.
    Programmed,
    /// Frame-control write issued.
    Switching,
    /// `active_bank` flipped, cleanup pending.
    Switched,
}

fn expect_state(state: &BusState, want: SwitchState) -> SdwResult<()> {
    if state.switch_state == want {
        Ok(())
    } else {
        Err(SdwError::Busy("bank switch out of sequence"))
    }
}

/// Writes every active port's parameters into the inactive bank: Slave
/// ports through raw DPn writes first, then Master ports through the host.
/// Channel enables follow each stream's state; `disabling` has its channels
/// cleared even though it may no longer be active.
pub fn program_alternate_bank(
    state: &mut BusState,
    host: &dyn HostOps,
    disabling: Option<StreamTag>,
) -> SdwResult<()> {
    expect_state(state, SwitchState::Idle)?;
    let bus = state.id;
    let bank = state.params.next_bank();
    trace!("{bus}: programming bank {}", bank.index());

    for m_rt in &state.masters {
        let clear = disabling == Some(m_rt.stream);
        if !m_rt.is_active() && !clear {
            continue;
        }
        let enabled = m_rt.state.channels_enabled();
        for s_rt in &m_rt.slaves {
            let target = Target::Device(s_rt.dev);
            for port in &s_rt.ports {
                if m_rt.is_active() {
                    let writes =
                        regs::slave_port_writes(&port.port_params, &port.transport_params, bank);
                    for write in writes {
                        host.write(bus, target, write.addr, &[write.value])?;
                    }
                }
                let mask = if enabled { port.channel_mask } else { 0 };
                let write = regs::channel_enable(port.port_num, bank, mask);
                host.write(bus, target, write.addr, &[write.value])?;
            }
        }
    }

    for m_rt in &state.masters {
        let clear = disabling == Some(m_rt.stream);
        if !m_rt.is_active() && !clear {
            continue;
        }
        let enabled = m_rt.state.channels_enabled();
        for port in &m_rt.ports {
            if m_rt.is_active() {
                host.write_port_params(bus, &port.port_params, bank)?;
                host.write_port_transport_params(bus, &port.transport_params, bank)?;
            }
            host.enable_channels(bus, port.port_num, port.channel_mask, bank, enabled)?;
        }
    }

    state.switch_state = SwitchState::Programmed;
    Ok(())
}

/// Frame-control register address and value selecting the current frame
/// shape in `bank`.
pub fn frame_ctrl_write(state: &BusState, bank: Bank) -> SdwResult<regs::RegWrite> {
    let (row, col) = (state.params.row, state.params.col);
    let value = frame::frame_ctrl(row, col).ok_or(SdwError::InvalidFrameShape { row, col })?;
    Ok(regs::RegWrite {
        addr: regs::scp_framectrl(bank),
        value,
    })
}

/// A frame-control write that has been issued but not yet confirmed.
#[derive(Debug)]
pub struct PendingSwitch {
    pub bus: BusId,
    pub bank: Bank,
    completion: Option<Arc<Completion>>,
    timeout: Duration,
}

impl PendingSwitch {
    pub fn is_deferred(&self) -> bool {
        self.completion.is_some()
    }
}

/// The two ways a bus can carry out its bank switch.
pub trait BankSwitch {
    /// Issues the frame-control write for the inactive bank.
    fn begin(&self, state: &mut BusState, host: &dyn HostOps) -> SdwResult<PendingSwitch>;

    /// Confirms the switch and flips `active_bank`.
    fn finish(&self, state: &mut BusState, pending: PendingSwitch) -> SdwResult<()>;
}

fn issue(state: &mut BusState) -> SdwResult<(Bank, regs::RegWrite)> {
    expect_state(state, SwitchState::Programmed)?;
    let bank = state.params.next_bank();
    let write = frame_ctrl_write(state, bank)?;
    Ok((bank, write))
}

fn flip(state: &mut BusState, pending: PendingSwitch) {
    state.params.active_bank = pending.bank;
    state.switch_state = SwitchState::Switched;
    debug!("{}: active bank now {}", pending.bus, pending.bank.index());
}

/// Single-bus switch: the write is confirmed when it returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncSwitch;

impl BankSwitch for SyncSwitch {
    fn begin(&self, state: &mut BusState, host: &dyn HostOps) -> SdwResult<PendingSwitch> {
        let (bank, write) = issue(state)?;
        if let Err(err) = host.write(state.id, Target::Broadcast, write.addr, &[write.value]) {
            state.switch_state = SwitchState::Idle;
            return Err(err);
        }
        state.switch_state = SwitchState::Switching;
        Ok(PendingSwitch {
            bus: state.id,
            bank,
            completion: None,
            timeout: Duration::ZERO,
        })
    }

    fn finish(&self, state: &mut BusState, pending: PendingSwitch) -> SdwResult<()> {
        expect_state(state, SwitchState::Switching)?;
        flip(state, pending);
        Ok(())
    }
}

/// Multi-bus switch: every bus of the group issues its write before any
/// of them waits, so the devices switch together.
#[derive(Clone, Copy, Debug, Default)]
pub struct AggregatedSwitch;

impl BankSwitch for AggregatedSwitch {
    fn begin(&self, state: &mut BusState, host: &dyn HostOps) -> SdwResult<PendingSwitch> {
        let (bank, write) = issue(state)?;
        let completion = Arc::clone(&state.completion);
        completion.reinit();
        if let Err(err) = host.write_async(
            state.id,
            Target::Broadcast,
            write.addr,
            &[write.value],
            Arc::clone(&completion),
        ) {
            state.switch_state = SwitchState::Idle;
            return Err(err);
        }
        state.switch_state = SwitchState::Switching;
        Ok(PendingSwitch {
            bus: state.id,
            bank,
            completion: Some(completion),
            timeout: state.switch_timeout(),
        })
    }

    fn finish(&self, state: &mut BusState, pending: PendingSwitch) -> SdwResult<()> {
        wait_for_bank_switch(state, pending)
    }
}

/// Waits for an aggregated switch to be confirmed. On timeout the bank
/// stays as it was and the bus returns to idle.
pub fn wait_for_bank_switch(state: &mut BusState, pending: PendingSwitch) -> SdwResult<()> {
    expect_state(state, SwitchState::Switching)?;
    if let Some(completion) = &pending.completion {
        if !completion.wait_timeout(pending.timeout) {
            let timeout_ms = pending.timeout.as_millis() as u64;
            warn!("{}: bank switch timed out after {timeout_ms} ms", pending.bus);
            state.switch_state = SwitchState::Idle;
            return Err(SdwError::SwitchTimeout {
                bus: pending.bus,
                timeout_ms,
            });
        }
    }
    flip(state, pending);
    Ok(())
}

/// Issues and confirms a synchronous switch to the programmed bank.
pub fn switch_bank(state: &mut BusState, host: &dyn HostOps) -> SdwResult<()> {
    let pending = SyncSwitch.begin(state, host)?;
    SyncSwitch.finish(state, pending)
}

/// Clears `disabling`'s channel enables in the bank that just went
/// inactive, then returns the bus to idle.
pub fn post_switch(
    state: &mut BusState,
    host: &dyn HostOps,
    disabling: Option<StreamTag>,
) -> SdwResult<()> {
    expect_state(state, SwitchState::Switched)?;
    state.switch_state = SwitchState::Idle;
    let Some(tag) = disabling else {
        return Ok(());
    };
    let bus = state.id;
    let stale = state.params.next_bank();
    let Some(m_rt) = state.master(tag) else {
        return Ok(());
    };
    for s_rt in &m_rt.slaves {
        for port in &s_rt.ports {
            let write = regs::channel_enable(port.port_num, stale, 0);
            host.write(bus, Target::Device(s_rt.dev), write.addr, &[write.value])?;
        }
    }
    for port in &m_rt.ports {
        host.enable_channels(bus, port.port_num, port.channel_mask, stale, false)?;
    }
    Ok(())
}
