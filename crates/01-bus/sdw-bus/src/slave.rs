//! Slave capability records consulted by the clock solver.

use serde::{Deserialize, Serialize};

use crate::params::{DevNum, Direction};

/// Bus clocks a data port can run at. An enumerated list wins over the
/// range when it is non-empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioModeProps {
    pub freqs: Vec<u32>,
    pub min_freq: u32,
    pub max_freq: u32,
}

impl Default for AudioModeProps {
    fn default() -> Self {
        Self {
            freqs: Vec::new(),
            min_freq: 0,
            max_freq: u32::MAX,
        }
    }
}

impl AudioModeProps {
    pub fn supports(&self, clk_freq: u32) -> bool {
        if self.freqs.is_empty() {
            (self.min_freq..=self.max_freq).contains(&clk_freq)
        } else {
            self.freqs.contains(&clk_freq)
        }
    }
}

/// Properties of one data port in one direction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpnProps {
    pub num: u8,
    pub direction: Direction,
    #[serde(default)]
    pub audio_mode: AudioModeProps,
}

/// A Slave device attached to a bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveDevice {
    pub dev_num: DevNum,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ports: Vec<DpnProps>,
}

impl SlaveDevice {
    pub fn new(dev_num: DevNum, name: impl Into<String>) -> Self {
        Self {
            dev_num,
            name: name.into(),
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, num: u8, direction: Direction, audio_mode: AudioModeProps) -> Self {
        self.ports.push(DpnProps {
            num,
            direction,
            audio_mode,
        });
        self
    }

    pub fn port(&self, direction: Direction, num: u8) -> Option<&DpnProps> {
        self.ports
            .iter()
            .find(|p| p.direction == direction && p.num == num)
    }

    pub fn audio_mode(&self, direction: Direction, num: u8) -> Option<&AudioModeProps> {
        self.port(direction, num).map(|p| &p.audio_mode)
    }
}
