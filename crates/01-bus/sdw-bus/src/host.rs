//! Host-controller callbacks the engine drives while programming a bank.

use std::sync::Arc;

use crate::completion::Completion;
use crate::error::SdwResult;
use crate::params::{Bank, BusId, DevNum, PortParams, TransportParams, BROADCAST_DEV_NUM};

/// Destination of a raw bus write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Device(DevNum),
    Broadcast,
}

impl Target {
    pub fn dev_num(self) -> DevNum {
        match self {
            Target::Device(dev) => dev,
            Target::Broadcast => BROADCAST_DEV_NUM,
        }
    }
}

/// Register I/O supplied by the bus Master's controller driver.
pub trait HostOps: Send + Sync {
    /// Programs bank-independent parameters of a Master port.
    fn write_port_params(&self, bus: BusId, params: &PortParams, bank: Bank) -> SdwResult<()>;

    /// Programs the banked transport parameters of a Master port.
    fn write_port_transport_params(
        &self,
        bus: BusId,
        params: &TransportParams,
        bank: Bank,
    ) -> SdwResult<()>;

    /// Sets or clears a Master port's channel enables in `bank`.
    fn enable_channels(
        &self,
        bus: BusId,
        port: u8,
        mask: u8,
        bank: Bank,
        enable: bool,
    ) -> SdwResult<()>;

    /// Synchronous register write on the bus.
    fn write(&self, bus: BusId, target: Target, addr: u32, data: &[u8]) -> SdwResult<()>;

    /// Queues a register write and signals `done` once it is on the wire.
    /// Controllers without deferred writes complete inline.
    fn write_async(
        &self,
        bus: BusId,
        target: Target,
        addr: u32,
        data: &[u8],
        done: Arc<Completion>,
    ) -> SdwResult<()> {
        self.write(bus, target, addr, data)?;
        done.complete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_uses_the_reserved_device_number() {
        assert_eq!(Target::Device(4).dev_num(), 4);
        assert_eq!(Target::Broadcast.dev_num(), BROADCAST_DEV_NUM);
    }
}
