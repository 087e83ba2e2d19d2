//! Rate grouping and transport-parameter layout.
//!
//! Streams sharing a sample rate form a group that occupies a contiguous
//! column range of the frame. Groups are placed from the last column
//! downwards in the order their rate was first seen; column 0 stays with the
//! control word.

use log::{error, trace};

use crate::error::{SdwError, SdwResult};
use crate::params::{BusParams, DataMode, Direction, FlowMode, PortParams, TransportParams};
use crate::runtime::{BusRuntime, MasterRuntime};

/// Block offsets start after the first bit of the column range.
const FIRST_BLOCK_OFFSET: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupParams {
    pub rate: u32,
    /// Bits available per sample period at the current clock.
    pub full_bw: u32,
    /// Bits per sample period the group's streams carry.
    pub payload_bw: u32,
    /// Columns allotted to the group.
    pub hwidth: u32,
}

/// Distinct rates of the active Masters, in first-seen order.
pub fn group_rates<'a, I>(masters: I) -> SdwResult<Vec<u32>>
where
    I: IntoIterator<Item = &'a MasterRuntime>,
{
    let mut rates: Vec<u32> = Vec::new();
    for m_rt in masters.into_iter().filter(|m| m.is_active()) {
        let rate = m_rt.stream_params.rate;
        if !rates.contains(&rate) {
            rates.try_reserve(1)?;
            rates.push(rate);
        }
    }
    Ok(rates)
}

/// Sizes each rate group for a `col`-column frame at `dr_freq`.
pub fn compute_group_params(
    masters: &[MasterRuntime],
    rates: &[u32],
    dr_freq: u32,
    col: u32,
) -> SdwResult<Vec<GroupParams>> {
    let mut groups = Vec::new();
    groups.try_reserve_exact(rates.len())?;
    for &rate in rates {
        let full_bw = dr_freq.checked_div(rate).unwrap_or(0);
        if full_bw == 0 {
            return Err(SdwError::InvalidInterval);
        }
        groups.push(GroupParams {
            rate,
            full_bw,
            ..GroupParams::default()
        });
    }

    for m_rt in masters.iter().filter(|m| m.is_active()) {
        let rate = m_rt.stream_params.rate;
        for group in groups.iter_mut().filter(|g| g.rate == rate) {
            group.payload_bw += m_rt.stream_params.payload_bits();
        }
    }

    let mut needed = 0u32;
    for group in &mut groups {
        let width =
            (u64::from(col) * u64::from(group.payload_bw)).div_ceil(u64::from(group.full_bw));
        group.hwidth = u32::try_from(width).unwrap_or(u32::MAX);
        needed = needed.saturating_add(group.hwidth);
    }

    let available = col.saturating_sub(1);
    if needed > available {
        return Err(SdwError::ColumnOverflow { needed, available });
    }
    Ok(groups)
}

/// Runs grouping, column assignment, offset layout, and interval
/// computation for every active Master on the bus.
pub fn compute_port_params(
    masters: &mut [MasterRuntime],
    params: &mut BusParams,
    m_data_mode: DataMode,
    s_data_mode: DataMode,
) -> SdwResult<Vec<GroupParams>> {
    for m_rt in masters.iter_mut().filter(|m| !m.is_active()) {
        clear_transport(m_rt);
    }

    let rates = group_rates(masters.iter())?;
    if rates.is_empty() {
        params.stream_interval = 0;
        return Ok(Vec::new());
    }

    let groups = match compute_group_params(masters, &rates, params.curr_dr_clk_freq, params.col) {
        Ok(groups) => groups,
        Err(err @ SdwError::ColumnOverflow { .. }) => {
            error!(
                "rate groups overflow {}x{} frame at {} Hz: {err}",
                params.row, params.col, params.curr_dr_clk_freq
            );
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    let mut hstop = params.col - 1;
    for group in &groups {
        let hstart = hstop + 1 - group.hwidth;
        let mut port_bo = FIRST_BLOCK_OFFSET;
        for m_rt in masters
            .iter_mut()
            .filter(|m| m.is_active() && m.stream_params.rate == group.rate)
        {
            let sample_int = params.curr_dr_clk_freq / group.rate;
            compute_master_ports(m_rt, sample_int, &mut port_bo, hstart, hstop, m_data_mode)?;
            compute_slave_ports(m_rt, sample_int, s_data_mode)?;
        }
        trace!(
            "group rate={} full_bw={} payload_bw={} columns {hstart}..={hstop}",
            group.rate,
            group.full_bw,
            group.payload_bw
        );
        hstop -= group.hwidth;
    }

    compute_intervals(masters, params)?;
    Ok(groups)
}

fn clear_transport(m_rt: &mut MasterRuntime) {
    m_rt.bus_runtime = BusRuntime::default();
    for port in m_rt.ports.iter_mut() {
        port.transport_params = TransportParams::default();
    }
    for port in m_rt.slaves.iter_mut().flat_map(|s| s.ports.iter_mut()) {
        port.transport_params = TransportParams::default();
    }
}

fn compute_master_ports(
    m_rt: &mut MasterRuntime,
    sample_int: u32,
    port_bo: &mut u32,
    hstart: u32,
    hstop: u32,
    data_mode: DataMode,
) -> SdwResult<()> {
    let bps = m_rt.stream_params.bps;
    m_rt.bus_runtime = BusRuntime {
        hstart,
        hstop,
        block_offset: *port_bo,
        sub_block_offset: 0,
    };
    for port in m_rt.ports.iter_mut() {
        port.transport_params =
            TransportParams::new(port.port_num, sample_int, *port_bo, hstart, hstop)?;
        port.port_params = PortParams {
            num: port.port_num,
            bps,
            flow_mode: FlowMode::Isochronous,
            data_mode,
        };
        *port_bo += bps * port.channel_count();
    }
    Ok(())
}

/// Slave ports share their Master's column range and start at the
/// Master's first-port offset.
fn compute_slave_ports(
    m_rt: &mut MasterRuntime,
    sample_int: u32,
    data_mode: DataMode,
) -> SdwResult<()> {
    let BusRuntime {
        hstart,
        hstop,
        block_offset,
        ..
    } = m_rt.bus_runtime;
    let bps = m_rt.stream_params.bps;
    let stream_ch = m_rt.stream_params.channel_count;
    let mirror_capable = m_rt.direction == Direction::Tx;

    let mut port_bo = block_offset;
    for s_rt in m_rt.slaves.iter_mut() {
        let mut slave_ch = 0;
        for port in s_rt.ports.iter_mut() {
            port.transport_params =
                TransportParams::new(port.port_num, sample_int, port_bo, hstart, hstop)?;
            port.port_params = PortParams {
                num: port.port_num,
                bps,
                flow_mode: FlowMode::Isochronous,
                data_mode,
            };
            port_bo += bps * port.channel_count();
            slave_ch += port.channel_count();
        }
        // A playback Slave consuming every channel mirrors the stream; the
        // next Slave starts over at the Master's offset.
        if mirror_capable && slave_ch == stream_ch {
            port_bo = block_offset;
        }
    }
    Ok(())
}

/// Recomputes the stream interval and fills the system interval if it has
/// been reset.
pub fn compute_intervals(masters: &[MasterRuntime], params: &mut BusParams) -> SdwResult<()> {
    let mut stream_interval = 0u64;
    for m_rt in masters.iter().filter(|m| m.is_active()) {
        let sample_int = params
            .curr_dr_clk_freq
            .checked_div(m_rt.stream_params.rate)
            .unwrap_or(0);
        let sample_int = u64::from(sample_int);
        stream_interval = if stream_interval == 0 {
            if sample_int == 0 {
                return Err(SdwError::InvalidInterval);
            }
            sample_int
        } else {
            lcm(stream_interval, sample_int)?
        };
    }
    params.stream_interval = stream_interval;

    if params.system_interval == 0 && stream_interval != 0 {
        let ratio = params
            .max_dr_clk_freq
            .checked_div(params.curr_dr_clk_freq)
            .ok_or(SdwError::InvalidInterval)?;
        let frame = u64::from(params.frame_interval());
        params.system_interval = lcm(stream_interval, frame)? * u64::from(ratio);
    }
    Ok(())
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

pub fn lcm(a: u64, b: u64) -> SdwResult<u64> {
    if a == 0 || b == 0 {
        return Err(SdwError::InvalidInterval);
    }
    Ok(a / gcd(a, b) * b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{BusConfig, BusId, Direction, StreamParams, StreamTag};
    use crate::runtime::{PortRuntime, SlaveRuntime, StreamState};
    use smallvec::smallvec;

    fn master(tag: u32, rate: u32, ch: u32, port: u8) -> MasterRuntime {
        let mut m_rt = MasterRuntime::new(
            BusId(0),
            StreamTag(tag),
            Direction::Tx,
            StreamParams {
                rate,
                channel_count: ch,
                bps: 16,
            },
        );
        m_rt.state = StreamState::Prepared;
        m_rt.ports.push(PortRuntime::new(port, ((1u16 << ch) - 1) as u8));
        m_rt
    }

    fn params_at(dr: u32, row: u32, col: u32) -> BusParams {
        let mut params = BusParams::from_config(&BusConfig::default());
        params.curr_dr_clk_freq = dr;
        params.row = row;
        params.col = col;
        params
    }

    #[test]
    fn lcm_rejects_zero() {
        assert_eq!(lcm(4, 6).unwrap(), 12);
        assert!(matches!(lcm(0, 6), Err(SdwError::InvalidInterval)));
    }

    #[test]
    fn rates_keep_discovery_order_and_skip_inactive() {
        let mut idle = master(3, 8_000, 1, 3);
        idle.state = StreamState::Deprepared;
        let masters = [
            master(1, 16_000, 2, 1),
            idle,
            master(2, 48_000, 2, 2),
            master(4, 16_000, 1, 4),
        ];
        assert_eq!(group_rates(masters.iter()).unwrap(), vec![16_000, 48_000]);
    }

    #[test]
    fn group_width_rounds_up() {
        let masters = [master(1, 48_000, 2, 1)];
        let groups = compute_group_params(&masters, &[48_000], 6_000_000, 4).unwrap();
        assert_eq!(
            groups,
            vec![GroupParams {
                rate: 48_000,
                full_bw: 125,
                payload_bw: 32,
                hwidth: 2,
            }]
        );
    }

    #[test]
    fn column_overflow_is_reported() {
        let masters = [master(1, 48_000, 2, 1), master(2, 48_000, 2, 2)];
        let err = compute_group_params(&masters, &[48_000], 6_000_000, 2).unwrap_err();
        assert!(matches!(
            err,
            SdwError::ColumnOverflow {
                needed: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn slave_ports_follow_master_offset() {
        let mut m_rt = master(1, 48_000, 2, 1);
        m_rt.slaves.push(SlaveRuntime {
            dev: 1,
            stream: StreamTag(1),
            direction: Direction::Rx,
            stream_params: m_rt.stream_params,
            ports: smallvec![PortRuntime::new(1, 0b01), PortRuntime::new(2, 0b10)],
        });
        let mut masters = [m_rt];
        let mut params = params_at(6_000_000, 48, 4);
        compute_port_params(&mut masters, &mut params, DataMode::Normal, DataMode::Normal).unwrap();

        let slave = &masters[0].slaves[0];
        assert_eq!(slave.ports[0].transport_params.block_offset(), 1);
        assert_eq!(slave.ports[1].transport_params.block_offset(), 17);
        assert_eq!(slave.ports[1].transport_params.hstart, 2);
        assert_eq!(slave.ports[1].transport_params.hstop, 3);
        assert_eq!(slave.ports[1].transport_params.sample_interval, 125);
    }

    #[test]
    fn mirrored_playback_slaves_restart_offset() {
        let mut m_rt = master(1, 48_000, 2, 1);
        for dev in [1, 2] {
            m_rt.slaves.push(SlaveRuntime {
                dev,
                stream: StreamTag(1),
                direction: Direction::Rx,
                stream_params: m_rt.stream_params,
                ports: smallvec![PortRuntime::new(1, 0b11)],
            });
        }
        let mut masters = [m_rt];
        let mut params = params_at(6_000_000, 48, 4);
        compute_port_params(&mut masters, &mut params, DataMode::Normal, DataMode::Normal).unwrap();
        let offsets: Vec<u32> = masters[0]
            .slaves
            .iter()
            .map(|s| s.ports[0].transport_params.block_offset())
            .collect();
        assert_eq!(offsets, vec![1, 1]);
    }

    #[test]
    fn intervals_use_lcm_and_cache_system_interval() {
        let mut masters = [master(1, 48_000, 2, 1), master(2, 16_000, 2, 2)];
        let mut params = params_at(6_000_000, 48, 4);
        params.max_dr_clk_freq = 24_000_000;
        compute_port_params(&mut masters, &mut params, DataMode::Normal, DataMode::Normal).unwrap();
        // lcm(125, 375) = 375; lcm(375, 192) = 24000; x4 clock ratio.
        assert_eq!(params.stream_interval, 375);
        assert_eq!(params.system_interval, 96_000);

        masters[1].state = StreamState::Deprepared;
        compute_port_params(&mut masters, &mut params, DataMode::Normal, DataMode::Normal).unwrap();
        assert_eq!(params.stream_interval, 125);
        assert_eq!(params.system_interval, 96_000);
        assert_eq!(masters[1].ports[0].transport_params, TransportParams::default());
    }
}
