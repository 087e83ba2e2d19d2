//! Stream manager: stream tags, endpoint configuration, and the
//! transitions that drive the engine over every bus of a stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, MutexGuard, RwLock};
use smallvec::SmallVec;

use crate::bus::{Bus, BusState};
use crate::engine::{self, Link, Transition};
use crate::error::{SdwError, SdwResult};
use crate::params::{
    BusId, DevNum, Direction, StreamParams, StreamTag, StreamType, MAX_DATA_PORT, MIN_DATA_PORT,
};
use crate::runtime::{
    MasterRuntime, PortList, PortRuntime, SlaveRuntime, StreamRuntime, StreamState,
};

pub const MAX_STREAM_TAGS: usize = 100;

/// Largest channel count a single stream may carry.
pub const MAX_CHANNELS: u32 = 8;

/// Largest sample width in bits.
pub const MAX_BPS: u32 = 64;

/// Which side of a bus an endpoint sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Master,
    Slave(DevNum),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub params: StreamParams,
    pub direction: Direction,
    pub stream_type: StreamType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortConfig {
    pub num: u8,
    pub ch_mask: u8,
}

struct StreamEntry {
    name: Option<String>,
    refs: u32,
    stream: Arc<Mutex<StreamRuntime>>,
}

/// Slot `n` holds stream tag `n`.
#[derive(Default)]
struct StreamTable {
    entries: Vec<Option<StreamEntry>>,
}

impl StreamTable {
    fn get(&self, tag: StreamTag) -> SdwResult<&StreamEntry> {
        self.entries
            .get(tag.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(SdwError::UnknownStream(tag))
    }

    fn named(&mut self, name: &str) -> Option<(StreamTag, &mut StreamEntry)> {
        self.entries
            .iter_mut()
            .enumerate()
            .find_map(|(idx, slot)| match slot {
                Some(entry) if entry.name.as_deref() == Some(name) => {
                    Some((StreamTag(idx as u32), entry))
                }
                _ => None,
            })
    }

    fn free_slot(&mut self) -> SdwResult<usize> {
        if let Some(idx) = self.entries.iter().position(Option::is_none) {
            return Ok(idx);
        }
        if self.entries.len() >= MAX_STREAM_TAGS {
            return Err(SdwError::Busy("stream tag table full"));
        }
        self.entries.try_reserve(1)?;
        self.entries.push(None);
        Ok(self.entries.len() - 1)
    }
}

/// Owns the buses and the stream-tag table.
#[derive(Default)]
pub struct SdwCore {
    buses: RwLock<BTreeMap<BusId, Arc<Bus>>>,
    streams: Mutex<StreamTable>,
}

impl SdwCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bus(&self, bus: Bus) -> SdwResult<Arc<Bus>> {
        let mut buses = self.buses.write();
        if buses.contains_key(&bus.id()) {
            return Err(SdwError::Busy("bus id already registered"));
        }
        let bus = Arc::new(bus);
        info!("registered bus {}", bus.id());
        buses.insert(bus.id(), Arc::clone(&bus));
        Ok(bus)
    }

    /// Unregisters a bus that carries no stream.
    pub fn remove_bus(&self, id: BusId) -> SdwResult<Arc<Bus>> {
        let mut buses = self.buses.write();
        let bus = buses.get(&id).ok_or(SdwError::UnknownBus(id))?;
        if !bus.lock().masters().is_empty() {
            return Err(SdwError::Busy("bus still carries streams"));
        }
        buses.remove(&id).ok_or(SdwError::UnknownBus(id))
    }

    pub fn bus(&self, id: BusId) -> SdwResult<Arc<Bus>> {
        self.buses
            .read()
            .get(&id)
            .cloned()
            .ok_or(SdwError::UnknownBus(id))
    }

    pub fn bus_ids(&self) -> Vec<BusId> {
        self.buses.read().keys().copied().collect()
    }

    /// Allocates a stream tag. Named allocations are shared: asking for an
    /// existing name returns its tag and takes another reference.
    pub fn alloc_stream_tag(&self, name: Option<&str>) -> SdwResult<StreamTag> {
        let mut table = self.streams.lock();
        if let Some(name) = name {
            if let Some((tag, entry)) = table.named(name) {
                entry.refs += 1;
                debug!("stream {tag} ({name}) now has {} users", entry.refs);
                return Ok(tag);
            }
        }
        let idx = table.free_slot()?;
        let tag = StreamTag(idx as u32);
        let name = name.map(str::to_owned);
        table.entries[idx] = Some(StreamEntry {
            stream: Arc::new(Mutex::new(StreamRuntime::new(tag, name.clone()))),
            name,
            refs: 1,
        });
        debug!("allocated stream {tag}");
        Ok(tag)
    }

    /// Drops one reference. The last reference frees the tag, which
    /// requires every endpoint to have been released.
    pub fn release_stream_tag(&self, tag: StreamTag) -> SdwResult<()> {
        let mut table = self.streams.lock();
        let entry = table
            .entries
            .get_mut(tag.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(SdwError::UnknownStream(tag))?;
        if entry.refs > 1 {
            entry.refs -= 1;
            return Ok(());
        }
        if !entry.stream.lock().masters.is_empty() {
            return Err(SdwError::Busy("stream still has configured endpoints"));
        }
        table.entries[tag.0 as usize] = None;
        debug!("freed stream {tag}");
        Ok(())
    }

    fn handle(&self, tag: StreamTag) -> SdwResult<Arc<Mutex<StreamRuntime>>> {
        let table = self.streams.lock();
        Ok(Arc::clone(&table.get(tag)?.stream))
    }

    pub fn stream(&self, tag: StreamTag) -> SdwResult<StreamRuntime> {
        Ok(self.handle(tag)?.lock().clone())
    }

    pub fn stream_state(&self, tag: StreamTag) -> SdwResult<StreamState> {
        Ok(self.handle(tag)?.lock().state)
    }

    /// Adds the Master or a Slave of `bus` to the stream.
    pub fn config_stream(
        &self,
        tag: StreamTag,
        bus_id: BusId,
        endpoint: Endpoint,
        config: StreamConfig,
    ) -> SdwResult<()> {
        validate_stream_params(&config.params)?;
        let handle = self.handle(tag)?;
        let mut stream = handle.lock();
        if !matches!(
            stream.state,
            StreamState::Allocated | StreamState::Configured | StreamState::Deprepared
        ) {
            return Err(SdwError::InvalidState {
                tag,
                op: "config_stream",
                state: stream.state,
            });
        }
        let bus = self.bus(bus_id)?;
        let mut state = bus.lock();

        let configured = !stream.masters.is_empty();
        if configured
            && (stream.params.rate != config.params.rate || stream.params.bps != config.params.bps)
        {
            return Err(SdwError::InvalidConfig(
                "endpoint rate or sample width differs from the stream",
            ));
        }

        match endpoint {
            Endpoint::Master => {
                if state.master(tag).is_some() {
                    return Ok(());
                }
                state.masters.try_reserve(1)?;
                state.masters.push(MasterRuntime::new(
                    bus_id,
                    tag,
                    config.direction,
                    config.params,
                ));
                stream.masters.push(bus_id);
            }
            Endpoint::Slave(dev) => {
                if state.slave(dev).is_none() {
                    return Err(SdwError::UnknownSlave { bus: bus_id, dev });
                }
                let m_rt = state.master_mut(tag).ok_or(SdwError::InvalidConfig(
                    "slave configured before its bus master",
                ))?;
                if m_rt.slave(dev).is_some() {
                    return Err(SdwError::Busy("slave already part of the stream"));
                }
                m_rt.slaves.push(SlaveRuntime {
                    dev,
                    stream: tag,
                    direction: config.direction,
                    stream_params: config.params,
                    ports: SmallVec::new(),
                });
                stream.slaves.push((bus_id, dev));
            }
        }

        if !configured {
            stream.params = config.params;
            stream.stream_type = config.stream_type;
        }
        stream.count_endpoint(config.direction);
        stream.state = StreamState::Configured;
        debug!("{bus_id}: configured {endpoint:?} for stream {tag}");
        Ok(())
    }

    /// Attaches a data port to a configured endpoint.
    pub fn config_port(
        &self,
        tag: StreamTag,
        bus_id: BusId,
        endpoint: Endpoint,
        port: PortConfig,
    ) -> SdwResult<()> {
        let PortConfig { num, ch_mask } = port;
        if !(MIN_DATA_PORT..=MAX_DATA_PORT).contains(&num) {
            return Err(SdwError::InvalidPort {
                port: num,
                reason: "not a data port",
            });
        }
        if ch_mask == 0 {
            return Err(SdwError::InvalidPort {
                port: num,
                reason: "empty channel mask",
            });
        }
        let handle = self.handle(tag)?;
        let stream = handle.lock();
        if stream.state != StreamState::Configured {
            return Err(SdwError::InvalidState {
                tag,
                op: "config_port",
                state: stream.state,
            });
        }
        if ch_mask.count_ones() > stream.params.channel_count {
            return Err(SdwError::InvalidPort {
                port: num,
                reason: "more channels than the stream carries",
            });
        }
        let bus = self.bus(bus_id)?;
        let mut state = bus.lock();

        let ports = match endpoint {
            Endpoint::Master => {
                &mut state
                    .master_mut(tag)
                    .ok_or(SdwError::UnknownStream(tag))?
                    .ports
            }
            Endpoint::Slave(dev) => slave_ports(&mut state, tag, dev, num)?,
        };
        if ports.iter().any(|p| p.port_num == num) {
            return Err(SdwError::InvalidPort {
                port: num,
                reason: "already configured",
            });
        }
        ports.push(PortRuntime::new(num, ch_mask));
        Ok(())
    }

    /// Removes an endpoint. A Master takes its Slaves on the same bus with
    /// it.
    pub fn release_stream(
        &self,
        tag: StreamTag,
        bus_id: BusId,
        endpoint: Endpoint,
    ) -> SdwResult<()> {
        let handle = self.handle(tag)?;
        let mut stream = handle.lock();
        if !matches!(
            stream.state,
            StreamState::Allocated | StreamState::Configured | StreamState::Deprepared
        ) {
            return Err(SdwError::InvalidState {
                tag,
                op: "release_stream",
                state: stream.state,
            });
        }
        let bus = self.bus(bus_id)?;
        let mut state = bus.lock();

        match endpoint {
            Endpoint::Slave(dev) => {
                let m_rt = state.master_mut(tag).ok_or(SdwError::UnknownStream(tag))?;
                let idx = m_rt
                    .slaves
                    .iter()
                    .position(|s| s.dev == dev)
                    .ok_or(SdwError::UnknownSlave { bus: bus_id, dev })?;
                let s_rt = m_rt.slaves.remove(idx);
                stream.slaves.retain(|&mut (b, d)| (b, d) != (bus_id, dev));
                stream.uncount_endpoint(s_rt.direction);
            }
            Endpoint::Master => {
                let idx = state
                    .masters
                    .iter()
                    .position(|m| m.stream == tag)
                    .ok_or(SdwError::UnknownStream(tag))?;
                let m_rt = state.masters.remove(idx);
                for s_rt in &m_rt.slaves {
                    stream.uncount_endpoint(s_rt.direction);
                }
                stream.uncount_endpoint(m_rt.direction);
                stream.slaves.retain(|&mut (b, _)| b != bus_id);
                stream.masters.retain(|&mut b| b != bus_id);
            }
        }

        if stream.masters.is_empty() {
            stream.state = StreamState::Allocated;
        }
        debug!("{bus_id}: released {endpoint:?} from stream {tag}");
        Ok(())
    }

    pub fn prepare_stream(&self, tag: StreamTag) -> SdwResult<()> {
        self.transition(tag, Transition::Prepare)
    }

    pub fn enable_stream(&self, tag: StreamTag) -> SdwResult<()> {
        self.transition(tag, Transition::Enable)
    }

    pub fn disable_stream(&self, tag: StreamTag) -> SdwResult<()> {
        self.transition(tag, Transition::Disable)
    }

    pub fn deprepare_stream(&self, tag: StreamTag) -> SdwResult<()> {
        self.transition(tag, Transition::Deprepare)
    }

    pub fn prepare_and_enable(&self, tag: StreamTag) -> SdwResult<()> {
        self.transition(tag, Transition::PrepareAndEnable)
    }

    pub fn disable_and_deprepare(&self, tag: StreamTag) -> SdwResult<()> {
        self.transition(tag, Transition::DisableAndDeprepare)
    }

    /// Prepares and enables a stream that lives on `bus_id` alone.
    pub fn compute_and_apply(&self, bus_id: BusId, tag: StreamTag) -> SdwResult<()> {
        self.run_transition(tag, Transition::PrepareAndEnable, Some(bus_id))
    }

    /// Disables and deprepares a stream that lives on `bus_id` alone,
    /// re-planning the streams that remain there.
    pub fn release_and_apply(&self, bus_id: BusId, tag: StreamTag) -> SdwResult<()> {
        self.run_transition(tag, Transition::DisableAndDeprepare, Some(bus_id))
    }

    fn transition(&self, tag: StreamTag, transition: Transition) -> SdwResult<()> {
        self.run_transition(tag, transition, None)
    }

    /// Holds the stream lock and every bus lock, ascending by bus id, for
    /// the whole transition including any aggregated wait. With `only`, the
    /// stream must span exactly that bus.
    fn run_transition(
        &self,
        tag: StreamTag,
        transition: Transition,
        only: Option<BusId>,
    ) -> SdwResult<()> {
        let handle = self.handle(tag)?;
        let mut stream = handle.lock();
        if !transition.allowed_from(stream.state) {
            return Err(SdwError::InvalidState {
                tag,
                op: transition.op(),
                state: stream.state,
            });
        }

        let order = stream.bus_order();
        if order.is_empty() {
            return Err(SdwError::InvalidConfig("stream spans no bus"));
        }
        if let Some(id) = only {
            if order.len() > 1 {
                return Err(SdwError::InvalidConfig("stream spans several buses"));
            }
            if order[0] != id {
                return Err(SdwError::UnknownStream(tag));
            }
        }
        let buses = order
            .iter()
            .map(|&id| self.bus(id))
            .collect::<SdwResult<SmallVec<[Arc<Bus>; 2]>>>()?;
        let mut guards: SmallVec<[MutexGuard<'_, BusState>; 2]> =
            buses.iter().map(|bus| bus.lock()).collect();
        let aggregated = guards.len() > 1 || guards.iter().any(|g| g.config().multi_link);

        let mut links: SmallVec<[Link<'_>; 2]> = buses
            .iter()
            .zip(guards.iter_mut())
            .map(|(bus, guard)| Link {
                bus: bus.as_ref(),
                state: &mut **guard,
            })
            .collect();
        engine::apply(&mut links, tag, transition, aggregated)?;

        stream.state = transition.target();
        info!("stream {tag}: {} done on {} bus(es)", transition.op(), order.len());
        Ok(())
    }
}

fn validate_stream_params(params: &StreamParams) -> SdwResult<()> {
    if params.rate == 0 {
        return Err(SdwError::InvalidConfig("sample rate must be non-zero"));
    }
    if !(1..=MAX_CHANNELS).contains(&params.channel_count) {
        return Err(SdwError::InvalidConfig("channel count out of range"));
    }
    if !(1..=MAX_BPS).contains(&params.bps) {
        return Err(SdwError::InvalidConfig("sample width out of range"));
    }
    Ok(())
}

/// Port list of a Slave runtime, checked against what the device says it
/// offers in the runtime's direction.
fn slave_ports<'s>(
    state: &'s mut BusState,
    tag: StreamTag,
    dev: DevNum,
    num: u8,
) -> SdwResult<&'s mut PortList> {
    let bus = state.id();
    let direction = state
        .master(tag)
        .ok_or(SdwError::UnknownStream(tag))?
        .slave(dev)
        .ok_or(SdwError::UnknownSlave { bus, dev })?
        .direction;
    let described = state
        .slave(dev)
        .ok_or(SdwError::UnknownSlave { bus, dev })?
        .port(direction, num)
        .is_some();
    if !described {
        return Err(SdwError::InvalidPort {
            port: num,
            reason: "not described by the slave device",
        });
    }
    let s_rt = state
        .master_mut(tag)
        .and_then(|m| m.slave_mut(dev))
        .ok_or(SdwError::UnknownSlave { bus, dev })?;
    Ok(&mut s_rt.ports)
}
