mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use sdw_bus::bank::{self, BankSwitch};
use sdw_bus::regs::{self, DPN_CHANNELEN_B0, DPN_HCTRL_B0};
use sdw_bus::{
    AggregatedSwitch, Bank, Bus, BusConfig, BusId, Endpoint, HostOps, SdwError, StreamState,
    SwitchState, Target,
};
use sdw_sim::{HostEvent, SimHost};

use common::{buses, init_logging, stream, system};

fn two_bus_stream() -> String {
    stream("x", 48_000, &[(0, 1, 1, 1), (1, 1, 1, 1)])
}

fn bare_bus(config: BusConfig) -> (Bus, Arc<SimHost>) {
    init_logging();
    let host = SimHost::new();
    let ops: Arc<dyn HostOps> = host.clone();
    let bus = Bus::new(BusId(0), config, ops).unwrap();
    host.attach(BusId(0), 1);
    (bus, host)
}

#[test]
fn sync_switches_alternate_banks() {
    let (bus, host) = bare_bus(BusConfig::default());
    for n in 1..=5u32 {
        let mut state = bus.lock();
        bank::program_alternate_bank(&mut state, &*host, None).unwrap();
        assert_eq!(state.switch_state(), SwitchState::Programmed);
        bank::switch_bank(&mut state, &*host).unwrap();
        bank::post_switch(&mut state, &*host, None).unwrap();
        assert_eq!(state.switch_state(), SwitchState::Idle);

        let expected = if n % 2 == 1 { Bank::B1 } else { Bank::B0 };
        assert_eq!(state.params().active_bank, expected);
        assert_eq!(host.hw_bank(BusId(0)), expected);
    }
    let frame_ctrl_writes = host
        .events()
        .iter()
        .filter(|ev| matches!(ev, HostEvent::Write { target: Target::Broadcast, .. }))
        .count();
    assert_eq!(frame_ctrl_writes, 5);
}

#[test]
fn switching_out_of_sequence_is_refused() {
    let (bus, host) = bare_bus(BusConfig::default());
    let mut state = bus.lock();
    let err = bank::switch_bank(&mut state, &*host).unwrap_err();
    assert!(matches!(err, SdwError::Busy(_)));
    assert_eq!(state.params().active_bank, Bank::B0);
}

#[test]
fn aggregated_wait_times_out_without_switching() {
    let (bus, host) = bare_bus(BusConfig::default());
    host.stall_async(BusId(0), true);

    let mut state = bus.lock();
    bank::program_alternate_bank(&mut state, &*host, None).unwrap();
    let pending = AggregatedSwitch.begin(&mut state, &*host).unwrap();
    assert!(pending.is_deferred());
    assert_eq!(state.params().active_bank, Bank::B0);

    let start = Instant::now();
    let err = bank::wait_for_bank_switch(&mut state, pending).unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err, SdwError::SwitchTimeout { bus: BusId(0), timeout_ms: 3 }));
    assert!(waited >= Duration::from_millis(3), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(1), "returned after {waited:?}");
    assert_eq!(state.params().active_bank, Bank::B0);
    assert_eq!(state.switch_state(), SwitchState::Idle);
    assert_eq!(host.hw_bank(BusId(0)), Bank::B0);
}

#[test]
fn aggregated_switch_completes_through_bus_thread() {
    let config = BusConfig {
        bank_switch_timeout_ms: 500,
        ..BusConfig::default()
    };
    let (bus, host) = bare_bus(config);
    let mut state = bus.lock();
    bank::program_alternate_bank(&mut state, &*host, None).unwrap();
    let pending = AggregatedSwitch.begin(&mut state, &*host).unwrap();
    bank::wait_for_bank_switch(&mut state, pending).unwrap();
    assert_eq!(state.params().active_bank, Bank::B1);
    assert_eq!(host.hw_bank(BusId(0)), Bank::B1);
    assert_eq!(host.device_reg(BusId(0), 1, regs::scp_framectrl(Bank::B1)), Some(0));
}

#[test]
fn slave_ports_are_programmed_before_master_ports() {
    let sys = system(&(buses(&[0], false) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    sys.core.prepare_and_enable(sys.tag("a").unwrap()).unwrap();

    let events = sys.host.events();
    let last_slave = events
        .iter()
        .rposition(|ev| matches!(ev, HostEvent::Write { target: Target::Device(_), .. }))
        .unwrap();
    let first_master = events.iter().position(HostEvent::is_master_port).unwrap();
    let frame_ctrl = events
        .iter()
        .position(|ev| matches!(ev, HostEvent::Write { target: Target::Broadcast, .. }))
        .unwrap();
    assert!(last_slave < first_master);
    assert!(first_master < frame_ctrl);
    assert!(events.iter().all(|ev| !matches!(ev, HostEvent::AsyncQueued { .. })));
}

#[test]
fn stream_across_two_buses_switches_both() {
    let sys = system(&(buses(&[0, 1], false) + &two_bus_stream()));
    let tag = sys.tag("x").unwrap();
    sys.core.prepare_and_enable(tag).unwrap();

    for id in [0, 1] {
        let bus = sys.bus(id).unwrap();
        assert_eq!(bus.params().active_bank, Bank::B1);
        assert_eq!(sys.host.hw_bank(BusId(id)), Bank::B1);
        assert_eq!(bus.switch_metrics().switches, 1);
    }

    let events = sys.host.events();
    let queued: Vec<BusId> = events
        .iter()
        .filter_map(|ev| match ev {
            HostEvent::AsyncQueued { bus, .. } => Some(*bus),
            _ => None,
        })
        .collect();
    assert_eq!(queued, vec![BusId(0), BusId(1)]);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Enabled);
}

#[test]
fn timeout_on_one_bus_restores_both() {
    let sys = system(&(buses(&[0, 1], false) + &two_bus_stream()));
    let tag = sys.tag("x").unwrap();
    let (bus0, bus1) = (sys.bus(0).unwrap(), sys.bus(1).unwrap());
    let before = bus1.params();
    sys.host.stall_async(BusId(1), true);

    let err = sys.core.prepare_and_enable(tag).unwrap_err();
    assert!(matches!(err, SdwError::SwitchTimeout { bus: BusId(1), timeout_ms: 200 }));
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Configured);

    assert_eq!(bus1.params(), before);
    assert_eq!(bus1.switch_metrics().timeouts, 1);
    assert_eq!(bus1.lock().switch_state(), SwitchState::Idle);
    // Bus 0 did switch; its bank says so even though the plan was undone.
    assert_eq!(bus0.params().active_bank, Bank::B1);
    assert_eq!(bus0.params().bandwidth, 0);
    assert_eq!(bus0.master(tag).unwrap().state, StreamState::Configured);

    sys.host.stall_async(BusId(1), false);
    sys.core.prepare_and_enable(tag).unwrap();
    assert_eq!(bus0.params().active_bank, Bank::B0);
    assert_eq!(sys.host.hw_bank(BusId(0)), Bank::B0);
    assert_eq!(bus1.params().active_bank, Bank::B1);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Enabled);
}

#[test]
fn multi_link_config_forces_aggregated_switch() {
    let sys = system(&(buses(&[0], true) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    sys.core.prepare_and_enable(sys.tag("a").unwrap()).unwrap();
    let queued = sys
        .host
        .events()
        .iter()
        .filter(|ev| matches!(ev, HostEvent::AsyncQueued { .. }))
        .count();
    assert_eq!(queued, 1);
    assert_eq!(sys.bus(0).unwrap().params().active_bank, Bank::B1);
}

#[test]
fn disable_clears_channels_in_both_banks() {
    let sys = system(&(buses(&[0], false) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    let tag = sys.tag("a").unwrap();
    sys.core.prepare_and_enable(tag).unwrap();
    sys.core.disable_and_deprepare(tag).unwrap();

    let bus = sys.bus(0).unwrap();
    assert_eq!(bus.params().active_bank, Bank::B0);
    assert_eq!(bus.params().bandwidth, 0);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Deprepared);

    let host = &sys.host;
    for bank in [Bank::B0, Bank::B1] {
        assert_eq!(host.master_port(BusId(0), 1, bank).unwrap().channel_mask, 0);
        let addr = regs::dpn_banked(1, bank, DPN_CHANNELEN_B0);
        assert_eq!(host.device_reg(BusId(0), 1, addr), Some(0), "bank {bank:?}");
    }
}

#[test]
fn disabled_stream_keeps_its_bandwidth() {
    let sys = system(&(buses(&[0], false) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    let tag = sys.tag("a").unwrap();
    sys.core.prepare_and_enable(tag).unwrap();
    sys.core.disable_stream(tag).unwrap();

    let bus = sys.bus(0).unwrap();
    let params = bus.params();
    assert_eq!(params.bandwidth, 1_536_000);
    let active = params.active_bank;
    assert_eq!(sys.host.master_port(BusId(0), 1, active).unwrap().channel_mask, 0);

    sys.core.enable_stream(tag).unwrap();
    let active = bus.params().active_bank;
    assert_eq!(sys.host.master_port(BusId(0), 1, active).unwrap().channel_mask, 0b11);
}

#[test]
fn host_failure_restores_previous_plan() {
    let sys = system(&(buses(&[0], false) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    let tag = sys.tag("a").unwrap();
    let bus = sys.bus(0).unwrap();
    let before = bus.params();
    let hctrl = regs::dpn_banked(1, Bank::B1, DPN_HCTRL_B0);
    sys.host.fail_writes_to(BusId(0), Some(hctrl));

    let err = sys.core.prepare_and_enable(tag).unwrap_err();
    assert!(matches!(err, SdwError::Host(_)));
    assert!(!err.is_computation());
    assert_eq!(bus.params(), before);
    assert_eq!(bus.master(tag).unwrap().state, StreamState::Configured);
    assert_eq!(bus.lock().switch_state(), SwitchState::Idle);
    assert_eq!(bus.switch_metrics().aborted, 1);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Configured);

    sys.host.fail_writes_to(BusId(0), None);
    sys.core.prepare_and_enable(tag).unwrap();
    assert_eq!(bus.params().active_bank, Bank::B1);
}

#[test]
fn release_replans_the_remaining_streams() {
    let text = buses(&[0], false)
        + &stream("a", 48_000, &[(0, 1, 1, 1)])
        + &stream("b", 16_000, &[(0, 2, 2, 2)]);
    let sys = system(&text);
    let (a, b) = (sys.tag("a").unwrap(), sys.tag("b").unwrap());
    sys.core.prepare_and_enable(a).unwrap();
    sys.core.prepare_and_enable(b).unwrap();
    let bus = sys.bus(0).unwrap();
    assert_eq!(bus.params().col, 4);

    sys.core.disable_and_deprepare(b).unwrap();
    let params = bus.params();
    assert_eq!((params.row, params.col), (48, 2));
    assert_eq!(params.bandwidth, 1_536_000);
    assert_eq!(params.stream_interval, 125);
    assert_eq!(params.system_interval, 48_000);

    let remaining = bus.master(a).unwrap().bus_runtime;
    assert_eq!((remaining.hstart, remaining.hstop), (1, 1));
    assert!(!bus.master(b).unwrap().ports[0].transport_params.valid);
}

#[test]
fn per_bus_entry_points_apply_and_release() {
    let sys = system(&(buses(&[0], false) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    let tag = sys.tag("a").unwrap();
    let bus = sys.bus(0).unwrap();

    let wrong_bus = sys.core.compute_and_apply(BusId(1), tag).unwrap_err();
    assert!(matches!(wrong_bus, SdwError::UnknownStream(_)));

    sys.core.compute_and_apply(BusId(0), tag).unwrap();
    assert_eq!(bus.master(tag).unwrap().state, StreamState::Enabled);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Enabled);
    assert_eq!(bus.params().bandwidth, 1_536_000);
    let err = sys.core.compute_and_apply(BusId(0), tag).unwrap_err();
    assert!(matches!(err, SdwError::InvalidState { .. }));

    // Live endpoints cannot be torn out from under the wire.
    let err = sys.core.release_stream(tag, BusId(0), Endpoint::Master).unwrap_err();
    assert!(matches!(err, SdwError::InvalidState { op: "release_stream", .. }));
    let active = bus.params().active_bank;
    assert_eq!(sys.host.master_port(BusId(0), 1, active).unwrap().channel_mask, 0b11);

    sys.core.release_and_apply(BusId(0), tag).unwrap();
    assert_eq!(bus.master(tag).unwrap().state, StreamState::Deprepared);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Deprepared);
    assert_eq!(bus.params().bandwidth, 0);
    // A transition refused up front never reaches the switch counters.
    assert_eq!(bus.switch_metrics().switches, 2);
    assert_eq!(bus.switch_metrics().aborted, 0);
    sys.core.release_stream(tag, BusId(0), Endpoint::Master).unwrap();
}

#[test]
fn per_bus_entry_points_refuse_a_stream_on_two_buses() {
    let sys = system(&(buses(&[0, 1], false) + &two_bus_stream()));
    let tag = sys.tag("x").unwrap();

    let err = sys.core.compute_and_apply(BusId(0), tag).unwrap_err();
    assert!(matches!(err, SdwError::InvalidConfig(_)));
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Configured);
    for id in [0, 1] {
        let bus = sys.bus(id).unwrap();
        assert_eq!(bus.params().bandwidth, 0);
        assert_eq!(bus.switch_metrics().switches, 0);
    }
}

#[test]
fn failed_switch_on_one_bus_keeps_the_other_on_its_live_bank() {
    let sys = system(&(buses(&[0, 1], false) + &two_bus_stream()));
    let tag = sys.tag("x").unwrap();
    let (bus0, bus1) = (sys.bus(0).unwrap(), sys.bus(1).unwrap());
    sys.host.fail_writes_to(BusId(1), Some(regs::scp_framectrl(Bank::B1)));

    let err = sys.core.prepare_and_enable(tag).unwrap_err();
    assert!(matches!(err, SdwError::Host(_)));
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Configured);
    for (id, bus) in [(0u32, &bus0), (1, &bus1)] {
        assert_eq!(bus.params().active_bank, sys.host.hw_bank(BusId(id)), "sdw{id}");
        assert_eq!(bus.lock().switch_state(), SwitchState::Idle);
        assert_eq!(bus.switch_metrics().aborted, 1);
    }
    assert_eq!(sys.host.hw_bank(BusId(0)), Bank::B1);
    assert_eq!(sys.host.hw_bank(BusId(1)), Bank::B0);

    sys.host.fail_writes_to(BusId(1), None);
    sys.core.prepare_and_enable(tag).unwrap();
    assert_eq!(bus0.params().active_bank, Bank::B0);
    assert_eq!(sys.host.hw_bank(BusId(0)), Bank::B0);
    assert_eq!(bus1.params().active_bank, Bank::B1);
    assert_eq!(sys.host.hw_bank(BusId(1)), Bank::B1);
    assert_eq!(sys.core.stream_state(tag).unwrap(), StreamState::Enabled);
}

#[test]
fn bus_bookkeeping_between_transitions() {
    let sys = system(&(buses(&[0], false) + &stream("a", 48_000, &[(0, 1, 1, 1)])));
    let tag = sys.tag("a").unwrap();
    sys.core.prepare_and_enable(tag).unwrap();
    let bus = sys.bus(0).unwrap();

    assert!(matches!(bus.remove_slave(1), Err(SdwError::Busy(_))));
    assert_eq!(bus.remove_slave(2).unwrap().name, "amp-r");

    let events = sys.host.take_events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|ev| ev.bus() == BusId(0)));
    assert!(sys.host.events().is_empty());

    bus.reset_system_interval();
    assert_eq!(bus.params().system_interval, 0);
    sys.core.disable_stream(tag).unwrap();
    assert_eq!(bus.params().system_interval, 48_000);
}
