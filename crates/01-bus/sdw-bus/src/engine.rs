//! Stream transitions across one or more locked buses.
//!
//! Every transition re-plans each bus from scratch: mark the stream's
//! Master with its new state, total the active bandwidth, solve for a clock
//! and frame shape, lay out the ports, program the alternate bank, and
//! switch. Planning finishes on every bus before the first register write.

use log::{debug, warn};

use crate::bank::{self, AggregatedSwitch, BankSwitch, PendingSwitch, SwitchState, SyncSwitch};
use crate::bus::{Bus, BusState};
use crate::error::{SdwError, SdwResult};
use crate::params::{BusParams, StreamTag};
use crate::runtime::{MasterRuntime, StreamState};
use crate::solver;
use crate::transport;

/// A bus taken for a transition: its handle plus the state behind its lock.
pub struct Link<'a> {
    pub bus: &'a Bus,
    pub state: &'a mut BusState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Prepare,
    Enable,
    Disable,
    Deprepare,
    PrepareAndEnable,
    DisableAndDeprepare,
}

impl Transition {
    pub fn op(self) -> &'static str {
        match self {
            Transition::Prepare => "prepare",
            Transition::Enable => "enable",
            Transition::Disable => "disable",
            Transition::Deprepare => "deprepare",
            Transition::PrepareAndEnable => "prepare_and_enable",
            Transition::DisableAndDeprepare => "disable_and_deprepare",
        }
    }

    pub fn allowed_from(self, state: StreamState) -> bool {
        use StreamState::*;
        match self {
            Transition::Prepare | Transition::PrepareAndEnable => {
                matches!(state, Configured | Deprepared)
            }
            Transition::Enable => matches!(state, Prepared | Disabled),
            Transition::Disable | Transition::DisableAndDeprepare => state == Enabled,
            Transition::Deprepare => matches!(state, Prepared | Disabled),
        }
    }

    pub fn target(self) -> StreamState {
        match self {
            Transition::Prepare => StreamState::Prepared,
            Transition::Enable | Transition::PrepareAndEnable => StreamState::Enabled,
            Transition::Disable => StreamState::Disabled,
            Transition::Deprepare | Transition::DisableAndDeprepare => StreamState::Deprepared,
        }
    }

    /// Whether the transition turns channels off.
    pub fn disables(self) -> bool {
        matches!(self, Transition::Disable | Transition::DisableAndDeprepare)
    }
}

struct Snapshot {
    params: BusParams,
    masters: Vec<MasterRuntime>,
}

impl Snapshot {
    fn take(state: &BusState) -> SdwResult<Self> {
        let mut masters = Vec::new();
        masters.try_reserve_exact(state.masters.len())?;
        masters.extend(state.masters.iter().cloned());
        Ok(Self {
            params: state.params,
            masters,
        })
    }

    /// Puts back the allocations. `active_bank` keeps whatever the hardware
    /// ended up on.
    fn restore(self, state: &mut BusState) {
        let active_bank = state.params.active_bank;
        state.params = self.params;
        state.params.active_bank = active_bank;
        state.masters = self.masters;
        state.switch_state = SwitchState::Idle;
    }
}

fn check(link: &Link<'_>, tag: StreamTag, transition: Transition) -> SdwResult<()> {
    let state = &*link.state;
    if state.switch_state != SwitchState::Idle {
        return Err(SdwError::Busy("bank switch in progress"));
    }
    let m_rt = state.master(tag).ok_or(SdwError::UnknownStream(tag))?;
    if !transition.allowed_from(m_rt.state) {
        return Err(SdwError::InvalidState {
            tag,
            op: transition.op(),
            state: m_rt.state,
        });
    }
    Ok(())
}

/// Marks the stream, then solves and lays out the bus for every stream
/// that stays active.
fn plan(state: &mut BusState, tag: StreamTag, target: StreamState) -> SdwResult<()> {
    if let Some(m_rt) = state.master_mut(tag) {
        m_rt.state = target;
    }

    let bandwidth = state
        .masters
        .iter()
        .filter(|m| m.is_active())
        .map(|m| m.stream_params.bandwidth())
        .sum();
    state.params.bandwidth = bandwidth;

    if state.masters.iter().any(MasterRuntime::is_active) {
        let selection = solver::solve(
            state.id,
            &state.config,
            bandwidth,
            &state.masters,
            &state.slaves,
        )?;
        selection.apply(&mut state.params);
    }

    let (m_mode, s_mode) = (state.config.m_data_mode, state.config.s_data_mode);
    transport::compute_port_params(&mut state.masters, &mut state.params, m_mode, s_mode)?;
    Ok(())
}

fn switch_all(
    links: &mut [Link<'_>],
    disabling: Option<StreamTag>,
    switcher: &dyn BankSwitch,
) -> SdwResult<()> {
    for link in links.iter_mut() {
        bank::program_alternate_bank(link.state, link.bus.host(), disabling)?;
    }

    let mut pending: Vec<PendingSwitch> = Vec::new();
    pending.try_reserve_exact(links.len())?;
    let mut outcome = Ok(());
    for link in links.iter_mut() {
        match switcher.begin(link.state, link.bus.host()) {
            Ok(issued) => pending.push(issued),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }

    // Every bus that issued its write is waited on, even after a failure,
    // so `active_bank` follows the hardware and none is left switching.
    for (link, pending) in links.iter_mut().zip(pending) {
        if let Err(err) = switcher.finish(link.state, pending) {
            if outcome.is_ok() {
                outcome = Err(err);
            }
        }
    }
    outcome?;

    for link in links.iter_mut() {
        bank::post_switch(link.state, link.bus.host(), disabling)?;
    }
    Ok(())
}

/// Runs `transition` for `tag` over every link. Callers hold each bus lock,
/// taken in ascending bus order, for the whole call. On failure every bus
/// gets its previous allocations back.
pub fn apply(
    links: &mut [Link<'_>],
    tag: StreamTag,
    transition: Transition,
    aggregated: bool,
) -> SdwResult<()> {
    for link in links.iter() {
        check(link, tag, transition)?;
    }

    let mut snapshots = Vec::new();
    snapshots.try_reserve_exact(links.len())?;
    for link in links.iter() {
        snapshots.push(Snapshot::take(link.state)?);
    }

    let outcome = run(links, tag, transition, aggregated);
    if let Err(err) = &outcome {
        warn!("{tag}: {} failed: {err}", transition.op());
        for (link, snapshot) in links.iter_mut().zip(snapshots) {
            snapshot.restore(link.state);
        }
    }
    for link in links.iter() {
        link.bus.metrics().record(&outcome);
    }
    outcome
}

fn run(
    links: &mut [Link<'_>],
    tag: StreamTag,
    transition: Transition,
    aggregated: bool,
) -> SdwResult<()> {
    let target = transition.target();
    for link in links.iter_mut() {
        plan(link.state, tag, target)?;
        let params = link.state.params;
        debug!(
            "{}: {} {tag}: {} bit/s at {} Hz, frame {}x{}",
            link.state.id,
            transition.op(),
            params.bandwidth,
            params.curr_dr_clk_freq,
            params.row,
            params.col
        );
    }

    let disabling = transition.disables().then_some(tag);
    if aggregated {
        switch_all(links, disabling, &AggregatedSwitch)
    } else {
        switch_all(links, disabling, &SyncSwitch)
    }
}
