use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::bank::SwitchState;
use crate::completion::Completion;
use crate::error::{SdwError, SdwResult};
use crate::host::HostOps;
use crate::params::{BusConfig, BusId, BusParams, DevNum, StreamTag};
use crate::runtime::MasterRuntime;
use crate::slave::SlaveDevice;

/// Everything guarded by the bus lock.
pub struct BusState {
    pub(crate) id: BusId,
    pub(crate) config: BusConfig,
    pub(crate) params: BusParams,
    pub(crate) masters: Vec<MasterRuntime>,
    pub(crate) slaves: BTreeMap<DevNum, SlaveDevice>,
    pub(crate) switch_state: SwitchState,
    pub(crate) completion: Arc<Completion>,
}

impl BusState {
    pub(crate) fn new(id: BusId, config: BusConfig) -> Self {
        let params = BusParams::from_config(&config);
        Self {
            id,
            config,
            params,
            masters: Vec::new(),
            slaves: BTreeMap::new(),
            switch_state: SwitchState::Idle,
            completion: Arc::new(Completion::new()),
        }
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub fn params(&self) -> &BusParams {
        &self.params
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn masters(&self) -> &[MasterRuntime] {
        &self.masters
    }

    pub fn switch_state(&self) -> SwitchState {
        self.switch_state
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.config.bank_switch_timeout_ms)
    }

    pub fn master(&self, tag: StreamTag) -> Option<&MasterRuntime> {
        self.masters.iter().find(|m| m.stream == tag)
    }

    pub(crate) fn master_mut(&mut self, tag: StreamTag) -> Option<&mut MasterRuntime> {
        self.masters.iter_mut().find(|m| m.stream == tag)
    }

    pub fn slave(&self, dev: DevNum) -> Option<&SlaveDevice> {
        self.slaves.get(&dev)
    }

    fn slave_in_use(&self, dev: DevNum) -> bool {
        self.masters.iter().any(|m| m.slave(dev).is_some())
    }
}

/// Bank-switch counters, readable without taking the bus lock.
#[derive(Default)]
pub(crate) struct SwitchMetrics {
    switches: AtomicU32,
    timeouts: AtomicU32,
    aborted: AtomicU32,
}

impl SwitchMetrics {
    pub(crate) fn record(&self, outcome: &SdwResult<()>) {
        let counter = match outcome {
            Ok(()) => &self.switches,
            Err(SdwError::SwitchTimeout { .. }) => &self.timeouts,
            Err(_) => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SwitchMetricsSnapshot {
        SwitchMetricsSnapshot {
            switches: self.switches.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchMetricsSnapshot {
    /// Bank switches that completed.
    pub switches: u32,
    /// Aggregated switches whose confirmation never arrived.
    pub timeouts: u32,
    /// Transitions abandoned for any other reason.
    pub aborted: u32,
}

/// One SoundWire link and the Master that drives it.
pub struct Bus {
    id: BusId,
    host: Arc<dyn HostOps>,
    state: Mutex<BusState>,
    metrics: SwitchMetrics,
}

impl Bus {
    pub fn new(id: BusId, config: BusConfig, host: Arc<dyn HostOps>) -> SdwResult<Self> {
        config.validate()?;
        Ok(Self {
            id,
            host,
            state: Mutex::new(BusState::new(id, config)),
            metrics: SwitchMetrics::default(),
        })
    }

    pub fn id(&self) -> BusId {
        self.id
    }

    pub(crate) fn host(&self) -> &dyn HostOps {
        self.host.as_ref()
    }

    pub(crate) fn metrics(&self) -> &SwitchMetrics {
        &self.metrics
    }

    /// Takes the bus lock.
    pub fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock()
    }

    pub fn params(&self) -> BusParams {
        self.state.lock().params
    }

    pub fn switch_metrics(&self) -> SwitchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Copy of the Master runtime carrying `tag`, if any.
    pub fn master(&self, tag: StreamTag) -> Option<MasterRuntime> {
        self.state.lock().master(tag).cloned()
    }

    pub fn add_slave(&self, slave: SlaveDevice) -> SdwResult<()> {
        let mut state = self.state.lock();
        if state.slaves.contains_key(&slave.dev_num) {
            return Err(SdwError::Busy("slave device number already attached"));
        }
        debug!("{}: attach slave {} ({})", self.id, slave.dev_num, slave.name);
        state.slaves.insert(slave.dev_num, slave);
        Ok(())
    }

    pub fn remove_slave(&self, dev: DevNum) -> SdwResult<SlaveDevice> {
        let mut state = self.state.lock();
        if state.slave_in_use(dev) {
            return Err(SdwError::Busy("slave still part of a stream"));
        }
        state
            .slaves
            .remove(&dev)
            .ok_or(SdwError::UnknownSlave { bus: self.id, dev })
    }

    /// Clears the cached system interval so the next pass recomputes it.
    pub fn reset_system_interval(&self) {
        self.state.lock().params.system_interval = 0;
    }
}
