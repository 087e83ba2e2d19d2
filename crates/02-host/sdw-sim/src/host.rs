//! Simulated host controller backed by banked register files.
//!
//! Synchronous writes land immediately. Asynchronous writes are queued to a
//! bus thread that applies them and signals their completion, unless the
//! bus has been stalled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use log::{trace, warn};
use parking_lot::Mutex;
use sdw_bus::regs;
use sdw_bus::{
    Bank, BusId, Completion, DevNum, HostOps, PortParams, SdwError, SdwResult, Target,
    TransportParams,
};

/// Register state of one Master data port in one bank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterPortRegs {
    pub port_params: Option<PortParams>,
    pub transport: Option<TransportParams>,
    pub channel_mask: u8,
}

/// Everything the simulated controller did, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    PortParams { bus: BusId, port: u8, bank: Bank },
    TransportParams { bus: BusId, port: u8, bank: Bank },
    Channels { bus: BusId, port: u8, bank: Bank, mask: u8, enable: bool },
    Write { bus: BusId, target: Target, addr: u32, value: u8 },
    AsyncQueued { bus: BusId, addr: u32 },
    AsyncDropped { bus: BusId, addr: u32 },
}

impl HostEvent {
    pub fn bus(&self) -> BusId {
        match *self {
            HostEvent::PortParams { bus, .. }
            | HostEvent::TransportParams { bus, .. }
            | HostEvent::Channels { bus, .. }
            | HostEvent::Write { bus, .. }
            | HostEvent::AsyncQueued { bus, .. }
            | HostEvent::AsyncDropped { bus, .. } => bus,
        }
    }

    /// Whether the event touched a Master port.
    pub fn is_master_port(&self) -> bool {
        matches!(
            self,
            HostEvent::PortParams { .. }
                | HostEvent::TransportParams { .. }
                | HostEvent::Channels { .. }
        )
    }
}

#[derive(Default)]
struct BusRegs {
    devices: BTreeMap<DevNum, BTreeMap<u32, u8>>,
    master_ports: BTreeMap<(u8, Bank), MasterPortRegs>,
    hw_bank: Bank,
    stall_async: bool,
    fail_addr: Option<u32>,
    fail_master: bool,
}

impl BusRegs {
    fn write(&mut self, target: Target, addr: u32, value: u8) {
        match target {
            Target::Device(dev) => {
                self.devices.entry(dev).or_default().insert(addr, value);
            }
            Target::Broadcast => {
                for file in self.devices.values_mut() {
                    file.insert(addr, value);
                }
                if addr == regs::scp_framectrl(Bank::B0) {
                    self.hw_bank = Bank::B0;
                } else if addr == regs::scp_framectrl(Bank::B1) {
                    self.hw_bank = Bank::B1;
                }
            }
        }
    }
}

#[derive(Default)]
struct SimState {
    buses: BTreeMap<BusId, BusRegs>,
    events: Vec<HostEvent>,
}

impl SimState {
    fn bus(&mut self, bus: BusId) -> &mut BusRegs {
        self.buses.entry(bus).or_default()
    }

    fn check_write(&mut self, bus: BusId, addr: u32) -> SdwResult<()> {
        if self.bus(bus).fail_addr == Some(addr) {
            warn!("{bus}: injected failure writing {addr:#x}");
            return Err(SdwError::host(format!("{bus}: write to {addr:#x} failed")));
        }
        Ok(())
    }

    fn check_master(&mut self, bus: BusId) -> SdwResult<()> {
        if self.bus(bus).fail_master {
            return Err(SdwError::host(format!("{bus}: master port programming failed")));
        }
        Ok(())
    }

    fn write(&mut self, bus: BusId, target: Target, addr: u32, data: &[u8]) {
        for (offset, &value) in (0u32..).zip(data) {
            self.bus(bus).write(target, addr + offset, value);
            self.events.push(HostEvent::Write {
                bus,
                target,
                addr: addr + offset,
                value,
            });
        }
    }
}

struct Job {
    bus: BusId,
    target: Target,
    addr: u32,
    data: Vec<u8>,
    done: Arc<Completion>,
}

/// Host controller simulation shared by every bus of a system.
pub struct SimHost {
    state: Arc<Mutex<SimState>>,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SimHost {
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Mutex::new(SimState::default()));
        let (tx, rx) = unbounded::<Job>();
        let shared = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("sdw-sim-bus".into())
            .spawn(move || {
                for job in rx.iter() {
                    let mut state = shared.lock();
                    if state.bus(job.bus).stall_async {
                        trace!("{}: dropping queued write to {:#x}", job.bus, job.addr);
                        state.events.push(HostEvent::AsyncDropped {
                            bus: job.bus,
                            addr: job.addr,
                        });
                        continue;
                    }
                    state.write(job.bus, job.target, job.addr, &job.data);
                    drop(state);
                    job.done.complete();
                }
            })
            .ok();
        if worker.is_none() {
            warn!("failed to start simulated bus thread; async writes complete inline");
        }
        Arc::new(Self {
            state,
            tx: worker.as_ref().map(|_| tx),
            worker,
        })
    }

    /// Stops delivering asynchronous writes on `bus`; their completions
    /// never fire.
    pub fn stall_async(&self, bus: BusId, stall: bool) {
        self.state.lock().bus(bus).stall_async = stall;
    }

    /// Makes every write to `addr` on `bus` fail.
    pub fn fail_writes_to(&self, bus: BusId, addr: Option<u32>) {
        self.state.lock().bus(bus).fail_addr = addr;
    }

    /// Makes Master port programming on `bus` fail.
    pub fn fail_master_ports(&self, bus: BusId, fail: bool) {
        self.state.lock().bus(bus).fail_master = fail;
    }

    /// Registers a device so broadcasts reach it before its first write.
    pub fn attach(&self, bus: BusId, dev: DevNum) {
        self.state.lock().bus(bus).devices.entry(dev).or_default();
    }

    pub fn device_reg(&self, bus: BusId, dev: DevNum, addr: u32) -> Option<u8> {
        let state = self.state.lock();
        state.buses.get(&bus)?.devices.get(&dev)?.get(&addr).copied()
    }

    pub fn master_port(&self, bus: BusId, port: u8, bank: Bank) -> Option<MasterPortRegs> {
        let state = self.state.lock();
        state.buses.get(&bus)?.master_ports.get(&(port, bank)).cloned()
    }

    /// Bank the devices on `bus` are running from.
    pub fn hw_bank(&self, bus: BusId) -> Bank {
        self.state
            .lock()
            .buses
            .get(&bus)
            .map(|regs| regs.hw_bank)
            .unwrap_or_default()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.state.lock().events.clone()
    }

    pub fn take_events(&self) -> Vec<HostEvent> {
        std::mem::take(&mut self.state.lock().events)
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("simulated bus thread panicked");
            }
        }
    }
}

impl HostOps for SimHost {
    fn write_port_params(&self, bus: BusId, params: &PortParams, bank: Bank) -> SdwResult<()> {
        let mut state = self.state.lock();
        state.check_master(bus)?;
        let port = params.num;
        let regs = state.bus(bus).master_ports.entry((port, bank)).or_default();
        regs.port_params = Some(*params);
        state.events.push(HostEvent::PortParams { bus, port, bank });
        Ok(())
    }

    fn write_port_transport_params(
        &self,
        bus: BusId,
        params: &TransportParams,
        bank: Bank,
    ) -> SdwResult<()> {
        let mut state = self.state.lock();
        state.check_master(bus)?;
        let port = params.port_num;
        let regs = state.bus(bus).master_ports.entry((port, bank)).or_default();
        regs.transport = Some(*params);
        state.events.push(HostEvent::TransportParams { bus, port, bank });
        Ok(())
    }

    fn enable_channels(
        &self,
        bus: BusId,
        port: u8,
        mask: u8,
        bank: Bank,
        enable: bool,
    ) -> SdwResult<()> {
        let mut state = self.state.lock();
        state.check_master(bus)?;
        let regs = state.bus(bus).master_ports.entry((port, bank)).or_default();
        if enable {
            regs.channel_mask = mask;
        } else {
            regs.channel_mask &= !mask;
        }
        state.events.push(HostEvent::Channels {
            bus,
            port,
            bank,
            mask,
            enable,
        });
        Ok(())
    }

    fn write(&self, bus: BusId, target: Target, addr: u32, data: &[u8]) -> SdwResult<()> {
        let mut state = self.state.lock();
        state.check_write(bus, addr)?;
        trace!("{bus}: dev {} write {addr:#x} <- {data:02x?}", target.dev_num());
        state.write(bus, target, addr, data);
        Ok(())
    }

    fn write_async(
        &self,
        bus: BusId,
        target: Target,
        addr: u32,
        data: &[u8],
        done: Arc<Completion>,
    ) -> SdwResult<()> {
        {
            let mut state = self.state.lock();
            state.check_write(bus, addr)?;
            state.events.push(HostEvent::AsyncQueued { bus, addr });
        }
        let job = Job {
            bus,
            target,
            addr,
            data: data.to_vec(),
            done,
        };
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .map_err(|_| SdwError::host("simulated bus thread gone")),
            None => {
                self.state.lock().write(job.bus, job.target, job.addr, &job.data);
                job.done.complete();
                Ok(())
            }
        }
    }
}
