//! Clock-gear and frame-shape search.

use std::collections::BTreeMap;

use log::{debug, trace};

use crate::error::{SdwError, SdwResult};
use crate::frame::{self, RowColPair, COLS};
use crate::params::{BusConfig, BusId, BusParams, DevNum, CLK_FREQ_MODULUS, DOUBLE_RATE_FACTOR};
use crate::runtime::MasterRuntime;
use crate::slave::SlaveDevice;
use crate::transport;

/// Clock and frame shape picked for a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub clk_div: u32,
    pub curr_dr_clk_freq: u32,
    pub row: u32,
    pub col: u32,
    pub frame_freq: u32,
}

impl Selection {
    /// Commits the selection. A change of clock or shape invalidates the
    /// cached system interval.
    pub fn apply(&self, params: &mut BusParams) {
        if params.curr_dr_clk_freq != self.curr_dr_clk_freq
            || params.row != self.row
            || params.col != self.col
        {
            params.system_interval = 0;
        }
        params.clk_div = self.clk_div;
        params.curr_dr_clk_freq = self.curr_dr_clk_freq;
        params.row = self.row;
        params.col = self.col;
        params.frame_freq = self.frame_freq;
    }
}

/// `(gear, double-rate clock)` pairs, slowest clock first. Equal clocks keep
/// their configured order.
pub fn gear_candidates(config: &BusConfig) -> Vec<(u32, u32)> {
    let max_dr = config.max_dr_clk_freq();
    let mut candidates: Vec<(u32, u32)> = config
        .clk_gears
        .iter()
        .filter(|&&gear| gear != 0)
        .map(|&gear| (gear, max_dr / gear))
        .collect();
    candidates.sort_by_key(|&(_, dr)| dr);
    candidates
}

/// First catalog shape with enough headroom for `bandwidth` at `freq` that
/// also satisfies `fits`.
pub fn select_row_col<F>(freq: u32, bandwidth: u64, mut fits: F) -> Option<RowColPair>
where
    F: FnMut(&RowColPair) -> bool,
{
    frame::catalog()
        .iter()
        .find(|pair| frame::headroom(freq, pair) >= bandwidth && fits(pair))
        .copied()
}

fn slaves_accept(
    masters: &[MasterRuntime],
    slaves: &BTreeMap<DevNum, SlaveDevice>,
    clk_freq: u32,
) -> bool {
    for m_rt in masters.iter().filter(|m| m.is_active()) {
        for s_rt in &m_rt.slaves {
            let Some(dev) = slaves.get(&s_rt.dev) else {
                debug!("slave {} has no capability record", s_rt.dev);
                return false;
            };
            for port in &s_rt.ports {
                let ok = dev
                    .audio_mode(s_rt.direction, port.port_num)
                    .is_some_and(|mode| mode.supports(clk_freq));
                if !ok {
                    trace!(
                        "slave {} port {} rejects {clk_freq} Hz",
                        s_rt.dev,
                        port.port_num
                    );
                    return false;
                }
            }
        }
    }
    true
}

/// Searches the configured gears for a clock every attached Slave accepts
/// and a frame shape that carries `bandwidth`.
pub fn solve(
    bus: BusId,
    config: &BusConfig,
    bandwidth: u64,
    masters: &[MasterRuntime],
    slaves: &BTreeMap<DevNum, SlaveDevice>,
) -> SdwResult<Selection> {
    if config.clk_gears.is_empty() {
        return Err(SdwError::InvalidConfig("no clock gears configured"));
    }

    let rates = transport::group_rates(masters.iter())?;
    let mut capable = false;

    for (gear, dr) in gear_candidates(config) {
        if u64::from(dr) <= bandwidth || dr % CLK_FREQ_MODULUS != 0 {
            trace!("{bus}: gear {gear} ({dr} Hz) cannot carry {bandwidth} bit/s");
            continue;
        }
        if !slaves_accept(masters, slaves, dr / DOUBLE_RATE_FACTOR) {
            debug!("{bus}: gear {gear} rejected by slave capabilities");
            continue;
        }
        capable = true;

        // Column demand depends only on the column count at a given clock.
        let mut col_fits = [false; COLS.len()];
        for (slot, &col) in col_fits.iter_mut().zip(COLS.iter()) {
            *slot = match transport::compute_group_params(masters, &rates, dr, col) {
                Ok(_) => true,
                Err(SdwError::ColumnOverflow { .. }) | Err(SdwError::InvalidInterval) => false,
                Err(err) => return Err(err),
            };
        }

        let shape = select_row_col(dr, bandwidth, |pair| {
            frame::try_col_index(pair.col).is_some_and(|idx| col_fits[usize::from(idx)])
        });
        if let Some(pair) = shape {
            let selection = Selection {
                clk_div: gear,
                curr_dr_clk_freq: dr,
                row: pair.row,
                col: pair.col,
                frame_freq: dr / pair.frame_interval(),
            };
            debug!(
                "{bus}: selected gear {gear} ({dr} Hz) frame {}x{} for {bandwidth} bit/s",
                pair.row, pair.col
            );
            return Ok(selection);
        }
        debug!("{bus}: no frame shape fits at gear {gear}");
    }

    if capable {
        Err(SdwError::BandwidthExhausted { bus, bandwidth })
    } else {
        Err(SdwError::CapabilityMismatch { bus })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Direction, StreamParams, StreamTag};
    use crate::runtime::{PortRuntime, SlaveRuntime, StreamState};
    use crate::slave::AudioModeProps;
    use smallvec::smallvec;

    fn stream(tag: u32, rate: u32) -> MasterRuntime {
        let params = StreamParams {
            rate,
            channel_count: 2,
            bps: 16,
        };
        let mut m_rt = MasterRuntime::new(BusId(0), StreamTag(tag), Direction::Tx, params);
        m_rt.state = StreamState::Prepared;
        m_rt.ports.push(PortRuntime::new(1, 0b11));
        m_rt.slaves.push(SlaveRuntime {
            dev: 1,
            stream: StreamTag(tag),
            direction: Direction::Rx,
            stream_params: params,
            ports: smallvec![PortRuntime::new(1, 0b11)],
        });
        m_rt
    }

    fn amp(mode: AudioModeProps) -> BTreeMap<DevNum, SlaveDevice> {
        let mut slaves = BTreeMap::new();
        slaves.insert(1, SlaveDevice::new(1, "amp").with_port(1, Direction::Rx, mode));
        slaves
    }

    fn bandwidth(masters: &[MasterRuntime]) -> u64 {
        masters.iter().map(|m| m.stream_params.bandwidth()).sum()
    }

    #[test]
    fn candidates_run_slowest_first() {
        let config = BusConfig::default();
        assert_eq!(
            gear_candidates(&config),
            vec![(4, 6_000_000), (2, 12_000_000), (1, 24_000_000)]
        );
    }

    #[test]
    fn zero_gears_is_a_configuration_error() {
        let config = BusConfig {
            clk_gears: Vec::new(),
            ..BusConfig::default()
        };
        let err = solve(BusId(0), &config, 0, &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SdwError::InvalidConfig(_)));
    }

    #[test]
    fn modulus_and_bandwidth_filter_gears() {
        // 2 * 12 MHz / 7 is not a multiple of 3 kHz.
        let config = BusConfig {
            clk_gears: vec![7, 1],
            ..BusConfig::default()
        };
        let masters = [stream(1, 48_000)];
        let slaves = amp(AudioModeProps::default());
        let sel = solve(BusId(0), &config, bandwidth(&masters), &masters, &slaves).unwrap();
        assert_eq!(sel.clk_div, 1);
    }

    #[test]
    fn capability_mismatch_when_no_gear_is_accepted() {
        let mode = AudioModeProps {
            freqs: vec![4_800_000],
            ..AudioModeProps::default()
        };
        let masters = [stream(1, 48_000)];
        let err = solve(
            BusId(2),
            &BusConfig::default(),
            bandwidth(&masters),
            &masters,
            &amp(mode),
        )
        .unwrap_err();
        assert!(matches!(err, SdwError::CapabilityMismatch { bus: BusId(2) }));
    }

    #[test]
    fn bandwidth_exhausted_when_no_shape_fits() {
        let config = BusConfig {
            clk_gears: vec![4],
            ..BusConfig::default()
        };
        let params = StreamParams {
            rate: 192_000,
            channel_count: 8,
            bps: 32,
        };
        let mut m_rt = MasterRuntime::new(BusId(0), StreamTag(1), Direction::Tx, params);
        m_rt.state = StreamState::Prepared;
        let masters = [m_rt];
        let err = solve(BusId(0), &config, 5_000_000, &masters, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SdwError::BandwidthExhausted { .. }));
    }

    #[test]
    fn selection_reset_system_interval_on_change() {
        let mut params = BusParams {
            curr_dr_clk_freq: 6_000_000,
            row: 48,
            col: 4,
            system_interval: 96_000,
            ..BusParams::default()
        };
        let same = Selection {
            clk_div: 4,
            curr_dr_clk_freq: 6_000_000,
            row: 48,
            col: 4,
            frame_freq: 31_250,
        };
        same.apply(&mut params);
        assert_eq!(params.system_interval, 96_000);
        Selection { col: 6, ..same }.apply(&mut params);
        assert_eq!(params.system_interval, 0);
    }
}
