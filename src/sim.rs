//! Loopback bus and simulated modem.
//!
//! [`LoopbackBus`] stands in for the PCIe driver: it backs the control, data
//! and DMA regions with memfds at fixed fake physical addresses and
//! implements both device traits over them. [`Coprocessor`] maps the same
//! memfds through its own windows and plays the modem side of the protocol,
//! so every shared structure crosses two independent mappings exactly as it
//! does across the link.
//!
//! ```rust,ignore
//! use modem_ipc::sim::{Coprocessor, LoopbackBus};
//!
//! let bus = LoopbackBus::new(4 << 20)?;
//! let modem = Coprocessor::attach(&bus)?;
//! let dma = bus.host_dma()?;
//! let pools = BufferPools::carve(&dma, &PoolLayout::default())?;
//! let ipc = Instance::init_with(&IpcConfig::default(), pools, dma, bus.devices())?;
//! ```

use crate::channel::{ChannelKind, RingKind};
use crate::config::{HIF_VERSION, MAX_INSTANCES};
use crate::device::{ControlDevice, Devices, MemoryDevice};
use crate::error::{Error, Result};
use crate::layout::{
    ChannelBlock, HostInterface, InstanceBlock, IpcMetadata, ReadyFlags, SharedBufferDescriptor,
};
use crate::memory::{
    DmaRegion, MappedRegion, MemRange, MemorySegment, SharedMemorySegment, SystemMap, Translator,
    VirtAddr,
};
use crate::role::{Operation, Side};
use rustix::fd::{BorrowedFd, OwnedFd};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

/// Fake physical address of the control region.
pub const CONTROL_PHYS: u64 = 0x1000_0000;

/// Fake physical address of the modem data region.
pub const DATA_PHYS: u64 = 0x2000_0000;

/// Fake host physical address of the DMA region.
pub const DMA_HOST_PHYS: u64 = 0x8000_0000;

/// Modem-side address of the DMA region.
pub const DMA_MODEM_PHYS: u32 = 0xC000_0000;

/// Where the modem places the metadata block inside the data region.
pub const METADATA_OFFSET: u32 = 0x1000;

/// MSI value assigned to channel `n` is `MSI_BASE + n`.
pub const MSI_BASE: u32 = 0x100;

const PAGE: usize = 4096;

fn io_error(request: &'static str, msg: impl Into<String>) -> Error {
    Error::Ioctl {
        request,
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.into()),
    }
}

struct BusInner {
    control: SharedMemorySegment,
    data: SharedMemorySegment,
    dma: SharedMemorySegment,
    events: Mutex<HashMap<u32, (OwnedFd, u32)>>,
}

/// Memfd-backed stand-in for the driver and the PCIe window.
///
/// Cheap to clone; clones share the same memory.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    /// Create a bus with a DMA region of `dma_len` bytes.
    pub fn new(dma_len: usize) -> Result<Self> {
        let control_len = std::mem::size_of::<HostInterface>().next_multiple_of(PAGE);
        let data_len = (METADATA_OFFSET as usize + IpcMetadata::SIZE).next_multiple_of(PAGE);
        let dma_len = dma_len.next_multiple_of(PAGE);
        Ok(Self {
            inner: Arc::new(BusInner {
                control: SharedMemorySegment::new("loopback-control", control_len)?,
                data: SharedMemorySegment::new("loopback-data", data_len)?,
                dma: SharedMemorySegment::new("loopback-dma", dma_len)?,
                events: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Device pair for [`Instance::init_with`](crate::instance::Instance::init_with).
    pub fn devices(&self) -> Devices {
        Devices {
            control: Box::new(self.clone()),
            memory: Box::new(self.clone()),
        }
    }

    /// A fresh host mapping of the DMA region.
    pub fn host_dma(&self) -> Result<DmaRegion> {
        let dma = &self.inner.dma;
        DmaRegion::from_segment(dma.map_window(0, dma.len())?, DMA_HOST_PHYS)
    }

    /// Control region range.
    pub fn control_range(&self) -> MemRange {
        MemRange {
            host_phys: CONTROL_PHYS,
            modem_phys: CONTROL_PHYS as u32,
            size: self.inner.control.len() as u32,
        }
    }

    /// Data region range.
    pub fn data_range(&self) -> MemRange {
        MemRange {
            host_phys: DATA_PHYS,
            modem_phys: DATA_PHYS as u32,
            size: self.inner.data.len() as u32,
        }
    }

    /// Size of the DMA region.
    pub fn dma_len(&self) -> usize {
        self.inner.dma.len()
    }

    fn events(&self) -> MutexGuard<'_, HashMap<u32, (OwnedFd, u32)>> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Is an event registered for `channel`?
    pub fn is_event_registered(&self, channel: u32) -> bool {
        self.events().contains_key(&channel)
    }

    /// Raise the MSI of `channel`, as the driver would on a modem interrupt.
    ///
    /// Returns false when no event is registered.
    pub fn raise(&self, channel: u32) -> Result<bool> {
        let events = self.events();
        let Some((fd, _)) = events.get(&channel) else {
            return Ok(false);
        };
        rustix::io::write(fd, &1u64.to_ne_bytes())?;
        Ok(true)
    }

    fn window(&self, range: &MemRange) -> Result<SharedMemorySegment> {
        let regions = [
            (CONTROL_PHYS, &self.inner.control),
            (DATA_PHYS, &self.inner.data),
            (DMA_HOST_PHYS, &self.inner.dma),
        ];
        for (base, segment) in regions {
            if range.host_phys >= base && range.host_phys - base < segment.len() as u64 {
                let offset = (range.host_phys - base) as usize;
                return segment.map_window(offset, range.size as usize);
            }
        }
        Err(Error::Map(format!(
            "no loopback region at {:#x}",
            range.host_phys
        )))
    }
}

impl ControlDevice for LoopbackBus {
    fn system_map(&self, dma: MemRange) -> Result<SystemMap> {
        if dma.host_phys != DMA_HOST_PHYS || dma.size as usize != self.dma_len() {
            return Err(io_error(
                "GET_SYS_MAP",
                format!(
                    "DMA range {:#x}+{:#x} is not the loopback region",
                    dma.host_phys, dma.size
                ),
            ));
        }
        Ok(SystemMap {
            modem_registers: MemRange::default(),
            data: self.data_range(),
            control: self.control_range(),
            dma: MemRange {
                modem_phys: DMA_MODEM_PHYS,
                ..dma
            },
        })
    }

    fn register_event(&self, channel: u32, event: BorrowedFd<'_>) -> Result<u32> {
        let fd = rustix::io::fcntl_dupfd_cloexec(event, 0)?;
        let msi = MSI_BASE + channel;
        self.events().insert(channel, (fd, msi));
        Ok(msi)
    }

    fn deregister_event(&self, channel: u32, _event: BorrowedFd<'_>) -> Result<()> {
        match self.events().remove(&channel) {
            Some(_) => Ok(()),
            None => Err(io_error(
                "CHANNEL_DEREGISTER",
                format!("channel {channel} has no event"),
            )),
        }
    }
}

impl MemoryDevice for LoopbackBus {
    fn map(&self, range: &MemRange) -> Result<Box<dyn MemorySegment>> {
        Ok(Box::new(self.window(range)?))
    }
}

impl std::fmt::Debug for LoopbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBus")
            .field("control", &self.control_range())
            .field("data", &self.data_range())
            .field("dma_len", &self.dma_len())
            .finish()
    }
}

/// The modem end of a [`LoopbackBus`].
pub struct Coprocessor {
    bus: LoopbackBus,
    control: MappedRegion,
    data: MappedRegion,
    translator: Translator,
}

impl Coprocessor {
    /// Map the bus regions and publish where the metadata lives, without
    /// initialising any instance.
    pub fn new(bus: &LoopbackBus) -> Result<Self> {
        let control_range = bus.control_range();
        let data_range = bus.data_range();
        let control = MappedRegion::new(control_range, Box::new(bus.window(&control_range)?))?;
        let data = MappedRegion::new(data_range, Box::new(bus.window(&data_range)?))?;
        let dma_seg = bus.inner.dma.map_window(0, bus.dma_len())?;
        let dma = DmaRegion::from_segment(dma_seg, DMA_HOST_PHYS)?;
        let translator = Translator::new(&dma, DMA_MODEM_PHYS, data.host_virt());

        let modem = Self {
            bus: bus.clone(),
            control,
            data,
            translator,
        };
        let hif = modem.hif()?;
        hif.version.store(HIF_VERSION, Ordering::Relaxed);
        hif.ipc_regs
            .ipc_mdata_size
            .store(IpcMetadata::SIZE as u32, Ordering::Relaxed);
        hif.ipc_regs
            .ipc_mdata_offset
            .store(METADATA_OFFSET, Ordering::Release);
        Ok(modem)
    }

    /// Map the bus and initialise every instance.
    pub fn attach(bus: &LoopbackBus) -> Result<Self> {
        let modem = Self::new(bus)?;
        for id in 0..MAX_INSTANCES {
            modem.initialize_instance(id)?;
        }
        Ok(modem)
    }

    /// The host interface block.
    pub fn hif(&self) -> Result<&HostInterface> {
        self.control.locate(0)
    }

    fn metadata(&self) -> Result<&IpcMetadata> {
        self.data.locate(METADATA_OFFSET as usize)
    }

    fn instance(&self, id: u32) -> Result<&InstanceBlock> {
        self.metadata()?
            .instance(id)
            .ok_or_else(|| Error::InstanceInvalid(format!("instance {id} out of range")))
    }

    fn channel(&self, instance: u32, id: u32) -> Result<&ChannelBlock> {
        let block = self.instance(instance)?;
        if !block.is_configured(id) {
            return Err(Error::ChannelInvalid(format!("channel {id} not configured")));
        }
        block
            .channel(id)
            .ok_or_else(|| Error::ChannelInvalid(format!("channel {id} out of range")))
    }

    /// Mark instance `id` initialised.
    pub fn initialize_instance(&self, id: u32) -> Result<()> {
        self.instance(id)?.initialized.store(1, Ordering::Release);
        Ok(())
    }

    /// Report a metadata size other than the real one.
    pub fn report_metadata_size(&self, size: u32) -> Result<()> {
        self.hif()?
            .ipc_regs
            .ipc_mdata_size
            .store(size, Ordering::Release);
        Ok(())
    }

    /// Signal that the modem application is up.
    pub fn set_ready(&self) -> Result<()> {
        self.hif()?
            .set_modem_ready(ReadyFlags::IPC_LIB | ReadyFlags::IPC_APP);
        Ok(())
    }

    /// Has the host signalled `flags`?
    pub fn host_ready(&self) -> Result<ReadyFlags> {
        Ok(self.hif()?.host_ready())
    }

    fn slot_addr(&self, modem_ptr: u32) -> Result<VirtAddr> {
        self.translator.dma_offset_to_host_virtual(modem_ptr)
    }

    fn notify(&self, id: u32, block: &ChannelBlock) -> Result<()> {
        if block.msi_valid.load(Ordering::Acquire) != 0 {
            self.bus.raise(id)?;
        }
        Ok(())
    }

    /// Produce `payload` on message channel `id` for the host to receive.
    pub fn send(&self, instance: u32, id: u32, payload: &[u8]) -> Result<()> {
        Operation::SendMsg.check(Side::Coprocessor)?;
        let block = self.channel(instance, id)?;
        let ring = &block.msg_ring;
        let md = &ring.md;
        if payload.is_empty() || payload.len() > md.msg_size() as usize {
            return Err(Error::InputInvalid(format!(
                "payload of {} bytes outside 1..={}",
                payload.len(),
                md.msg_size()
            )));
        }
        if md.is_full() {
            return Err(Error::ChannelFull(id));
        }
        let slot = ring.slot(md.producer_index())?;
        self.translator
            .write(self.slot_addr(slot.load().modem_ptr)?, payload)?;
        slot.set_len(payload.len() as u32);
        md.advance_producer();

        if let Some(stats) = self.hif()?.modem_stats.channel(id) {
            stats.record_sent(payload.len() as u32);
        }
        self.notify(id, block)
    }

    /// Consume the next message the host produced on channel `id`.
    pub fn recv(&self, instance: u32, id: u32) -> Result<Vec<u8>> {
        Operation::RecvMsg.check(Side::Coprocessor)?;
        let ring = &self.channel(instance, id)?.msg_ring;
        let md = &ring.md;
        if md.is_empty() {
            return Err(Error::ChannelEmpty(id));
        }
        let desc = ring.slot(md.consumer_index())?.load();
        let mut out = vec![0u8; desc.len.min(md.msg_size()) as usize];
        self.translator
            .read(self.slot_addr(desc.modem_ptr)?, &mut out)?;
        md.advance_consumer();

        if let Some(stats) = self.hif()?.modem_stats.channel(id) {
            stats.record_received(out.len() as u32);
        }
        Ok(out)
    }

    /// Take a free buffer off pointer channel `id`, fill it with `payload`
    /// and publish its descriptor. Returns the buffer's cookie.
    ///
    /// Fails with [`Error::ChannelEmpty`] when the free list is empty.
    pub fn send_ptr(&self, instance: u32, id: u32, payload: &[u8]) -> Result<u32> {
        Operation::SendPtr.check(Side::Coprocessor)?;
        let block = self.channel(instance, id)?;
        if ChannelKind::from_wire(block.ch_type.load(Ordering::Acquire)) != Some(ChannelKind::Pointer)
        {
            return Err(Error::ChannelInvalid(format!("channel {id} is not a pointer channel")));
        }
        let free = &block.bl_ring;
        let ring = &block.msg_ring;
        if free.md.is_empty() {
            return Err(Error::ChannelEmpty(id));
        }
        if ring.md.is_full() {
            return Err(Error::ChannelFull(id));
        }

        let mut desc = free.slot(free.md.consumer_index())?.load();
        if payload.len() > desc.buf_size as usize {
            return Err(Error::InputInvalid(format!(
                "payload of {} bytes exceeds {}-byte buffer",
                payload.len(),
                desc.buf_size
            )));
        }
        let buffer = self.translator.coprocessor_physical_to_host_virtual(desc.mod_phys)?;
        self.translator.write(buffer, payload)?;
        free.md.advance_consumer();

        desc.data_size = payload.len() as u32;
        let slot = ring.slot(ring.md.producer_index())?;
        self.translator
            .write(self.slot_addr(slot.load().modem_ptr)?, &desc.to_bytes())?;
        slot.set_len(SharedBufferDescriptor::SIZE as u32);
        ring.md.advance_producer();

        if let Some(stats) = self.hif()?.modem_stats.channel(id) {
            stats.record_sent(payload.len() as u32);
        }
        self.notify(id, block)?;
        Ok(desc.cookie)
    }

    /// Buffers waiting on the free list of pointer channel `id`.
    pub fn free_buffers(&self, instance: u32, id: u32) -> Result<u32> {
        Ok(self.channel(instance, id)?.bl_ring.md.occupancy())
    }

    /// Put both counters of an empty ring at `value`, for wraparound runs.
    pub fn seed_counters(&self, instance: u32, id: u32, ring: RingKind, value: u32) -> Result<()> {
        let block = self.channel(instance, id)?;
        let md = match ring {
            RingKind::Message => &block.msg_ring.md,
            RingKind::BufferList => &block.bl_ring.md,
        };
        if !md.is_empty() {
            return Err(Error::InputInvalid(format!("ring of channel {id} not empty")));
        }
        md.seed(md.ring_size(), md.msg_size(), value, value);
        Ok(())
    }

    /// The modem's translator, for inspecting buffers.
    pub fn translator(&self) -> &Translator {
        &self.translator
    }
}

impl std::fmt::Debug for Coprocessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coprocessor")
            .field("control", &self.control)
            .field("data", &self.data)
            .field("translator", &self.translator)
            .finish()
    }
}
