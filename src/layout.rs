//! Structures shared with the modem, as laid out in memory.
//!
//! Both sides compile the same layout; nothing is negotiated at run time
//! beyond the metadata size check at initialisation. All integers are 32-bit
//! in host byte order.
//!
//! ```text
//!   control region                 data region
//!   ┌────────────────────┐         ┌───────────────────────────────────┐
//!   │ HostInterface      │         │ ...                               │
//!   │  version           │  offset │ IpcMetadata                       │
//!   │  host/mod ready    │ ──────> │  InstanceBlock[MAX_INSTANCES]     │
//!   │  ipc_regs          │         │   initialized, cfgmask            │
//!   │  host/modem stats  │         │   ChannelBlock[CHANNELS_MAX]      │
//!   └────────────────────┘         │    msg ring: md + SharedSlot[16]  │
//!                                  │    bl ring:  md + BufferSlot[16]  │
//!                                  └───────────────────────────────────┘
//! ```
//!
//! Shared structures hold only atomics and are viewed in place through
//! [`MappedRegion::locate`](crate::memory::MappedRegion::locate). Their
//! plain twins ([`SlotDescriptor`], [`SharedBufferDescriptor`]) are what the
//! rest of the crate passes around.

use crate::config::{CFGMASK_WORDS, CHANNELS_MAX, MAX_DEPTH, MAX_INSTANCES};
use crate::error::{Error, Result};
use crate::memory::{SharedLayout, VirtAddr};
use crate::ring::RingMetadata;
use crate::stats::StatsBlock;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

// =============================================================================
// Descriptors
// =============================================================================

/// Message-ring slot: where the slot's buffer lives and how full it is.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotDescriptor {
    /// Offset of the slot buffer from the start of the DMA region.
    pub modem_ptr: u32,
    /// Low half of the buffer's host virtual address.
    pub host_virt_l: u32,
    /// High half of the buffer's host virtual address.
    pub host_virt_h: u32,
    /// Bytes written by the last producer.
    pub len: u32,
}

impl SlotDescriptor {
    /// Wire size in bytes.
    pub const SIZE: usize = 16;

    /// Host virtual address of the slot buffer.
    pub fn host_virt(&self) -> VirtAddr {
        VirtAddr::from_wire(self.host_virt_h, self.host_virt_l)
    }
}

/// Pointer-channel buffer descriptor (`ipc_sh_buf_t` on the wire).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedBufferDescriptor {
    /// Modem physical address of the buffer.
    pub mod_phys: u32,
    /// Low half of the host virtual address.
    pub host_virt_l: u32,
    /// High half of the host virtual address.
    pub host_virt_h: u32,
    /// Capacity of the buffer.
    pub buf_size: u32,
    /// Valid bytes in the buffer.
    pub data_size: u32,
    /// Opaque value carried for the producer.
    pub cookie: u32,
}

impl SharedBufferDescriptor {
    /// Wire size in bytes.
    pub const SIZE: usize = 24;

    /// Host virtual address of the buffer.
    pub fn host_virt(&self) -> VirtAddr {
        VirtAddr::from_wire(self.host_virt_h, self.host_virt_l)
    }

    /// Serialise in host byte order.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.mod_phys,
            self.host_virt_l,
            self.host_virt_h,
            self.buf_size,
            self.data_size,
            self.cookie,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_ne_bytes());
        }
        out
    }

    /// Parse from host byte order.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut fields = bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]));
        let mut next = || fields.next().unwrap_or_default();
        Self {
            mod_phys: next(),
            host_virt_l: next(),
            host_virt_h: next(),
            buf_size: next(),
            data_size: next(),
            cookie: next(),
        }
    }
}

const _: () = assert!(std::mem::size_of::<SlotDescriptor>() == SlotDescriptor::SIZE);
const _: () =
    assert!(std::mem::size_of::<SharedBufferDescriptor>() == SharedBufferDescriptor::SIZE);

/// A [`SlotDescriptor`] in shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedSlot {
    modem_ptr: AtomicU32,
    host_virt_l: AtomicU32,
    host_virt_h: AtomicU32,
    len: AtomicU32,
}

impl SharedSlot {
    /// Read the descriptor.
    ///
    /// Ordering comes from the ring counters; field loads are relaxed.
    pub fn load(&self) -> SlotDescriptor {
        SlotDescriptor {
            modem_ptr: self.modem_ptr.load(Ordering::Relaxed),
            host_virt_l: self.host_virt_l.load(Ordering::Relaxed),
            host_virt_h: self.host_virt_h.load(Ordering::Relaxed),
            len: self.len.load(Ordering::Relaxed),
        }
    }

    /// Write the descriptor.
    pub fn store(&self, desc: &SlotDescriptor) {
        self.modem_ptr.store(desc.modem_ptr, Ordering::Relaxed);
        self.host_virt_l.store(desc.host_virt_l, Ordering::Relaxed);
        self.host_virt_h.store(desc.host_virt_h, Ordering::Relaxed);
        self.len.store(desc.len, Ordering::Relaxed);
    }

    /// Record the payload length.
    pub fn set_len(&self, len: u32) {
        self.len.store(len, Ordering::Relaxed);
    }
}

/// A [`SharedBufferDescriptor`] in shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedBufferSlot {
    mod_phys: AtomicU32,
    host_virt_l: AtomicU32,
    host_virt_h: AtomicU32,
    buf_size: AtomicU32,
    data_size: AtomicU32,
    cookie: AtomicU32,
}

impl SharedBufferSlot {
    /// Read the descriptor.
    pub fn load(&self) -> SharedBufferDescriptor {
        SharedBufferDescriptor {
            mod_phys: self.mod_phys.load(Ordering::Relaxed),
            host_virt_l: self.host_virt_l.load(Ordering::Relaxed),
            host_virt_h: self.host_virt_h.load(Ordering::Relaxed),
            buf_size: self.buf_size.load(Ordering::Relaxed),
            data_size: self.data_size.load(Ordering::Relaxed),
            cookie: self.cookie.load(Ordering::Relaxed),
        }
    }

    /// Write the descriptor.
    pub fn store(&self, desc: &SharedBufferDescriptor) {
        self.mod_phys.store(desc.mod_phys, Ordering::Relaxed);
        self.host_virt_l.store(desc.host_virt_l, Ordering::Relaxed);
        self.host_virt_h.store(desc.host_virt_h, Ordering::Relaxed);
        self.buf_size.store(desc.buf_size, Ordering::Relaxed);
        self.data_size.store(desc.data_size, Ordering::Relaxed);
        self.cookie.store(desc.cookie, Ordering::Relaxed);
    }
}

// =============================================================================
// Rings
// =============================================================================

const DEPTH: usize = MAX_DEPTH as usize;

/// Ring of message slots.
#[repr(C)]
#[derive(Debug, Default)]
pub struct MessageRing {
    /// Ring metadata.
    pub md: RingMetadata,
    /// Slot descriptors; only the first `ring_size` are used.
    pub slots: [SharedSlot; DEPTH],
}

/// Free-list ring of pointer-channel buffers.
#[repr(C)]
#[derive(Debug, Default)]
pub struct BufferListRing {
    /// Ring metadata.
    pub md: RingMetadata,
    /// Buffer descriptors; only the first `ring_size` are used.
    pub slots: [SharedBufferSlot; DEPTH],
}

fn slot_at<T>(slots: &[T], index: u32, ring_size: u32) -> Result<&T> {
    if index >= ring_size {
        return Err(Error::MemoryInvalid(format!(
            "ring index {index} outside ring of {ring_size}"
        )));
    }
    slots
        .get(index as usize)
        .ok_or_else(|| Error::MemoryInvalid(format!("ring index {index} beyond {DEPTH} slots")))
}

impl MessageRing {
    /// Slot at `index`, checked against the configured ring size.
    pub fn slot(&self, index: u32) -> Result<&SharedSlot> {
        slot_at(&self.slots, index, self.md.ring_size())
    }
}

impl BufferListRing {
    /// Slot at `index`, checked against the configured ring size.
    pub fn slot(&self, index: u32) -> Result<&SharedBufferSlot> {
        slot_at(&self.slots, index, self.md.ring_size())
    }
}

// =============================================================================
// Channel, instance and metadata blocks
// =============================================================================

/// Wire value of `ch_type` for message channels.
pub const CH_TYPE_MESSAGE: u32 = 1;
/// Wire value of `ch_type` for pointer channels.
pub const CH_TYPE_POINTER: u32 = 2;

/// Per-channel shared block.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ChannelBlock {
    /// Channel id.
    pub ch_id: AtomicU32,
    /// [`CH_TYPE_MESSAGE`] or [`CH_TYPE_POINTER`].
    pub ch_type: AtomicU32,
    /// Non-zero once the free-list ring is stocked.
    pub bl_initialized: AtomicU32,
    /// MSI value the modem raises for this channel.
    pub msi_value: AtomicU32,
    /// Non-zero when `msi_value` is meaningful.
    pub msi_valid: AtomicU32,
    /// Message (or descriptor) ring.
    pub msg_ring: MessageRing,
    /// Free-list ring, pointer channels only.
    pub bl_ring: BufferListRing,
}

/// One instance's share of the metadata block.
#[repr(C)]
#[derive(Debug)]
pub struct InstanceBlock {
    /// Set by the modem once the block is valid.
    pub initialized: AtomicU32,
    /// One bit per configured channel.
    pub cfgmask: [AtomicU32; CFGMASK_WORDS],
    /// Channel blocks.
    pub channels: [ChannelBlock; CHANNELS_MAX as usize],
}

impl InstanceBlock {
    /// Has the modem initialised this instance?
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) != 0
    }

    /// Channel block `id`.
    pub fn channel(&self, id: u32) -> Option<&ChannelBlock> {
        self.channels.get(id as usize)
    }

    /// Is the configuration bit of `id` set?
    pub fn is_configured(&self, id: u32) -> bool {
        self.cfgmask
            .get((id / 32) as usize)
            .is_some_and(|word| word.load(Ordering::Acquire) & (1 << (id % 32)) != 0)
    }

    /// Set the configuration bit of `id`.
    pub fn set_configured(&self, id: u32) {
        if let Some(word) = self.cfgmask.get((id / 32) as usize) {
            word.fetch_or(1 << (id % 32), Ordering::AcqRel);
        }
    }

    /// Copy of the configuration bitmask.
    pub fn configured_mask(&self) -> [u32; CFGMASK_WORDS] {
        std::array::from_fn(|i| self.cfgmask[i].load(Ordering::Acquire))
    }
}

/// The metadata block the modem places in its data region.
#[repr(C)]
#[derive(Debug)]
pub struct IpcMetadata {
    /// Per-instance blocks.
    pub instances: [InstanceBlock; MAX_INSTANCES as usize],
}

impl IpcMetadata {
    /// Size the modem must report in `ipc_mdata_size`.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Instance block `id`.
    pub fn instance(&self, id: u32) -> Option<&InstanceBlock> {
        self.instances.get(id as usize)
    }
}

// =============================================================================
// Host interface (control region)
// =============================================================================

bitflags! {
    /// Readiness bits in `host_ready` / `mod_ready`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadyFlags: u32 {
        /// The IPC library finished initialisation.
        const IPC_LIB = 1 << 0;
        /// The application finished configuring its channels.
        const IPC_APP = 1 << 1;
    }
}

/// Location of the metadata block inside the data region.
#[repr(C)]
#[derive(Debug, Default)]
pub struct IpcRegisters {
    /// Offset from the start of the data region.
    pub ipc_mdata_offset: AtomicU32,
    /// Size of the block as built by the modem.
    pub ipc_mdata_size: AtomicU32,
}

/// The host interface block at the start of the control region.
#[repr(C)]
#[derive(Debug)]
pub struct HostInterface {
    /// Interface version, written by the modem.
    pub version: AtomicU32,
    /// [`ReadyFlags`] set by the host.
    pub host_ready: AtomicU32,
    /// [`ReadyFlags`] set by the modem.
    pub mod_ready: AtomicU32,
    /// Metadata location.
    pub ipc_regs: IpcRegisters,
    /// Counters maintained by the host.
    pub host_stats: StatsBlock,
    /// Counters maintained by the modem.
    pub modem_stats: StatsBlock,
}

impl HostInterface {
    /// Set host readiness bits.
    pub fn set_host_ready(&self, flags: ReadyFlags) {
        self.host_ready.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Host readiness bits.
    pub fn host_ready(&self) -> ReadyFlags {
        ReadyFlags::from_bits_truncate(self.host_ready.load(Ordering::Acquire))
    }

    /// Set modem readiness bits.
    pub fn set_modem_ready(&self, flags: ReadyFlags) {
        self.mod_ready.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Modem readiness bits.
    pub fn modem_ready(&self) -> ReadyFlags {
        ReadyFlags::from_bits_truncate(self.mod_ready.load(Ordering::Acquire))
    }
}

// SAFETY (all below): repr(C), composed only of atomics.
unsafe impl SharedLayout for SharedSlot {}
unsafe impl SharedLayout for SharedBufferSlot {}
unsafe impl SharedLayout for MessageRing {}
unsafe impl SharedLayout for BufferListRing {}
unsafe impl SharedLayout for ChannelBlock {}
unsafe impl SharedLayout for InstanceBlock {}
unsafe impl SharedLayout for IpcMetadata {}
unsafe impl SharedLayout for HostInterface {}

const _: () = assert!(std::mem::size_of::<SharedSlot>() == SlotDescriptor::SIZE);
const _: () = assert!(std::mem::size_of::<SharedBufferSlot>() == SharedBufferDescriptor::SIZE);
const _: () = assert!(std::mem::size_of::<MessageRing>() == 24 + DEPTH * 16);
const _: () = assert!(std::mem::size_of::<BufferListRing>() == 24 + DEPTH * 24);
const _: () = assert!(
    std::mem::size_of::<ChannelBlock>()
        == 5 * 4 + std::mem::size_of::<MessageRing>() + std::mem::size_of::<BufferListRing>()
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_bytes_native_order() {
        let desc = SharedBufferDescriptor {
            mod_phys: 0xC000_1000,
            host_virt_l: 0xdead_beef,
            host_virt_h: 0x7fff,
            buf_size: 131072,
            data_size: 512,
            cookie: 42,
        };
        let bytes = desc.to_bytes();
        assert_eq!(&bytes[0..4], &0xC000_1000u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &42u32.to_ne_bytes());
        assert_eq!(SharedBufferDescriptor::from_bytes(&bytes), desc);
        assert_eq!(desc.host_virt(), VirtAddr::new(0x7fff_dead_beef));
    }

    #[test]
    fn test_shared_slot_load_store() {
        let slot = SharedSlot::default();
        let desc = SlotDescriptor {
            modem_ptr: 0x800,
            host_virt_l: 1,
            host_virt_h: 2,
            len: 0,
        };
        slot.store(&desc);
        slot.set_len(77);
        assert_eq!(slot.load(), SlotDescriptor { len: 77, ..desc });
        assert_eq!(slot.load().host_virt(), VirtAddr::new((2 << 32) | 1));
    }

    #[test]
    fn test_slot_index_checked_against_ring_size() {
        let ring = MessageRing::default();
        ring.md.reset(4, 64);
        assert!(ring.slot(3).is_ok());
        assert!(matches!(ring.slot(4), Err(Error::MemoryInvalid(_))));

        ring.md.reset(64, 64);
        assert!(ring.slot(20).is_err());
    }

    #[test]
    fn test_ready_flags() {
        let flags = ReadyFlags::IPC_LIB | ReadyFlags::IPC_APP;
        assert_eq!(flags.bits(), 3);
        assert!(ReadyFlags::from_bits_truncate(0xff).contains(ReadyFlags::IPC_APP));
    }
}
