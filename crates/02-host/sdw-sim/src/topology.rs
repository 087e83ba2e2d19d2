//! TOML description of a SoundWire system: buses with their Slaves, and
//! the streams configured across them.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sdw_bus::{
    Bus, BusConfig, BusId, DevNum, Direction, Endpoint, HostOps, PortConfig, SdwCore,
    SlaveDevice, StreamConfig, StreamParams, StreamTag, StreamType,
};
use serde::Deserialize;

use crate::host::SimHost;

#[derive(Clone, Debug, Deserialize)]
pub struct Topology {
    #[serde(default, rename = "bus")]
    pub buses: Vec<BusSpec>,
    #[serde(default, rename = "stream")]
    pub streams: Vec<StreamSpec>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BusSpec {
    pub id: u32,
    #[serde(flatten)]
    pub config: BusConfig,
    #[serde(default, rename = "slave")]
    pub slaves: Vec<SlaveDevice>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub rate: u32,
    pub channels: u32,
    pub bps: u32,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointSpec>,
}

impl StreamSpec {
    pub fn params(&self) -> StreamParams {
        StreamParams {
            rate: self.rate,
            channel_count: self.channels,
            bps: self.bps,
        }
    }
}

/// One endpoint of a stream. Without `dev` it is the bus Master.
#[derive(Clone, Debug, Deserialize)]
pub struct EndpointSpec {
    pub bus: u32,
    #[serde(default)]
    pub dev: Option<DevNum>,
    pub direction: Direction,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

impl EndpointSpec {
    fn endpoint(&self) -> Endpoint {
        self.dev.map_or(Endpoint::Master, Endpoint::Slave)
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PortSpec {
    pub num: u8,
    pub ch_mask: u8,
}

impl Topology {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse topology")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?;
        Self::from_toml_str(&text).with_context(|| format!("in {path:?}"))
    }

    /// Registers every bus and configures every stream. Nothing is
    /// prepared yet.
    pub fn build(&self, host: Arc<SimHost>) -> Result<System> {
        let core = SdwCore::new();
        for spec in &self.buses {
            let id = BusId(spec.id);
            let ops: Arc<dyn HostOps> = host.clone();
            let bus = Bus::new(id, spec.config.clone(), ops)
                .with_context(|| format!("invalid configuration for {id}"))?;
            for slave in &spec.slaves {
                host.attach(id, slave.dev_num);
                bus.add_slave(slave.clone())
                    .with_context(|| format!("{id}: cannot attach slave {}", slave.dev_num))?;
            }
            core.add_bus(bus)?;
        }

        let mut streams = Vec::with_capacity(self.streams.len());
        for spec in &self.streams {
            let tag = core.alloc_stream_tag(Some(&spec.name))?;
            configure(&core, tag, spec).with_context(|| format!("stream {:?}", spec.name))?;
            streams.push((spec.name.clone(), tag));
        }

        Ok(System {
            core,
            host,
            streams,
        })
    }
}

fn configure(core: &SdwCore, tag: StreamTag, spec: &StreamSpec) -> Result<()> {
    // Slaves hang off their bus Master, so Masters go first.
    let mut endpoints: Vec<&EndpointSpec> = spec.endpoints.iter().collect();
    endpoints.sort_by_key(|ep| ep.dev.is_some());

    for ep in endpoints {
        let bus = BusId(ep.bus);
        let endpoint = ep.endpoint();
        let config = StreamConfig {
            params: spec.params(),
            direction: ep.direction,
            stream_type: spec.stream_type,
        };
        core.config_stream(tag, bus, endpoint, config)
            .with_context(|| format!("{bus}: {endpoint:?}"))?;
        for port in &ep.ports {
            let port = PortConfig {
                num: port.num,
                ch_mask: port.ch_mask,
            };
            core.config_port(tag, bus, endpoint, port)
                .with_context(|| format!("{bus}: {endpoint:?} port {}", port.num))?;
        }
    }
    Ok(())
}

/// A configured system running against the simulated host.
pub struct System {
    pub core: SdwCore,
    pub host: Arc<SimHost>,
    pub streams: Vec<(String, StreamTag)>,
}

impl System {
    pub fn tag(&self, name: &str) -> Option<StreamTag> {
        self.streams
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, tag)| tag)
    }

    pub fn bus(&self, id: u32) -> Result<Arc<Bus>> {
        Ok(self.core.bus(BusId(id))?)
    }
}
