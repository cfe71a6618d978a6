//! Shared setup for the loopback integration tests.

#![allow(dead_code)]

use modem_ipc::config::IpcConfig;
use modem_ipc::instance::Instance;
use modem_ipc::memory::{BufferPools, PoolClass, PoolLayout};
use modem_ipc::sim::{Coprocessor, LoopbackBus};

/// DMA region size used by the tests.
pub const DMA_LEN: usize = 4 << 20;

/// A host instance wired to a simulated modem.
pub struct Harness {
    pub ipc: Instance,
    pub modem: Coprocessor,
    pub bus: LoopbackBus,
}

/// Pools small enough for [`DMA_LEN`].
pub fn small_layout() -> PoolLayout {
    PoolLayout::empty()
        .with_class(PoolClass::Msg2K, 2048, 160)
        .with_class(PoolClass::Msg16K, 16 * 1024, 8)
        .with_class(PoolClass::Ptr128K, 128 * 1024, 16)
        .with_class(PoolClass::SharedDescriptor, 24, 64)
}

pub fn harness() -> Harness {
    harness_with(IpcConfig::default(), &small_layout())
}

pub fn harness_with(config: IpcConfig, layout: &PoolLayout) -> Harness {
    let bus = LoopbackBus::new(DMA_LEN).unwrap();
    let modem = Coprocessor::attach(&bus).unwrap();
    let ipc = host_instance(&bus, config, layout).unwrap();
    Harness { ipc, modem, bus }
}

pub fn host_instance(
    bus: &LoopbackBus,
    config: IpcConfig,
    layout: &PoolLayout,
) -> modem_ipc::Result<Instance> {
    let dma = bus.host_dma()?;
    let pools = BufferPools::carve(&dma, layout)?;
    Instance::init_with(&config, pools, dma, bus.devices())
}
