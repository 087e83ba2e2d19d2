#![allow(dead_code)]

use std::fmt::Write;

use sdw_sim::{SimHost, System, Topology};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// One 12 MHz bus per id with a playback amp (device 1, DP1 rx) and a
/// second amp (device 2, DP2 rx) accepting any bus clock.
pub fn buses(ids: &[u32], multi_link: bool) -> String {
    let mut out = String::new();
    for id in ids {
        writeln!(
            out,
            r#"
[[bus]]
id = {id}
max_clk_freq = 12000000
clk_gears = [1, 2, 4]
bank_switch_timeout_ms = 200
multi_link = {multi_link}

[[bus.slave]]
dev_num = 1
name = "amp-l"
ports = [{{ num = 1, direction = "rx" }}, {{ num = 3, direction = "rx" }}]

[[bus.slave]]
dev_num = 2
name = "amp-r"
ports = [{{ num = 2, direction = "rx" }}]
"#
        )
        .unwrap();
    }
    out
}

/// A 2-channel 16-bit playback stream from Master port `m_port` to Slave
/// `dev` port `s_port` on every listed bus.
pub fn stream(name: &str, rate: u32, legs: &[(u32, u8, u8, u8)]) -> String {
    let mut out = String::new();
    writeln!(
        out,
        r#"
[[stream]]
name = "{name}"
rate = {rate}
channels = 2
bps = 16
"#
    )
    .unwrap();
    for &(bus, m_port, dev, s_port) in legs {
        writeln!(
            out,
            r#"
[[stream.endpoint]]
bus = {bus}
direction = "tx"
ports = [{{ num = {m_port}, ch_mask = 3 }}]

[[stream.endpoint]]
bus = {bus}
dev = {dev}
direction = "rx"
ports = [{{ num = {s_port}, ch_mask = 3 }}]
"#
        )
        .unwrap();
    }
    out
}

pub fn system(text: &str) -> System {
    init_logging();
    Topology::from_toml_str(text)
        .and_then(|topo| topo.build(SimHost::new()))
        .expect("topology builds")
}
