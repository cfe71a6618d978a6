//! Channel disciplines and the send/receive algorithms.
//!
//! A channel is a [`ChannelBlock`] in shared memory plus the host's
//! bookkeeping in [`Instance`](crate::instance::Instance). Two disciplines
//! exist:
//!
//! - **Message**: every slot of the message ring owns a pre-placed DMA
//!   buffer. `send` copies the payload into the buffer at `pi`, `recv`
//!   copies out of the buffer at `ci`.
//! - **Pointer**: the message ring carries [`SharedBufferDescriptor`]s
//!   naming large buffers, and a second free-list ring hands the buffers
//!   back to the producer once drained. No payload is copied.
//!
//! ```text
//!   pointer channel buffer ownership
//!
//!   pool ──stock──> free list ──modem takes──> modem fills
//!                      ^                           │ descriptor ring
//!                      │                           v
//!                      └──── put_buf <──── SharedBuffer (host)
//! ```
//!
//! The functions here assume the instance already checked the channel id,
//! its configuration and its discipline.

use crate::error::{Error, Result};
use crate::layout::{
    BufferListRing, CH_TYPE_MESSAGE, CH_TYPE_POINTER, ChannelBlock, MessageRing,
    SharedBufferDescriptor, SlotDescriptor,
};
use crate::memory::{BufferPool, Translator, VirtAddr};
use crate::ring::RingMetadata;
use std::fmt;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Buffer-exchange discipline of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Payload copied into pre-placed slot buffers.
    Message,
    /// Buffers handed over by descriptor.
    Pointer,
}

impl ChannelKind {
    /// Value of `ch_type` in the channel block.
    pub const fn wire(self) -> u32 {
        match self {
            ChannelKind::Message => CH_TYPE_MESSAGE,
            ChannelKind::Pointer => CH_TYPE_POINTER,
        }
    }

    /// Parse `ch_type`.
    pub const fn from_wire(value: u32) -> Option<Self> {
        match value {
            CH_TYPE_MESSAGE => Some(ChannelKind::Message),
            CH_TYPE_POINTER => Some(ChannelKind::Pointer),
            _ => None,
        }
    }
}

/// Selects one of a channel's rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingKind {
    /// The message (or descriptor) ring.
    Message,
    /// The free-list ring of a pointer channel.
    BufferList,
}

/// A pointer-channel buffer owned by the host.
///
/// Obtained from `recv_ptr` and given back exactly once with `put_buf`.
/// The type is neither `Clone` nor `Copy`, so a buffer cannot be returned
/// twice.
#[must_use = "a received buffer must be returned with put_buf"]
#[derive(Debug, PartialEq, Eq)]
pub struct SharedBuffer {
    channel: u32,
    desc: SharedBufferDescriptor,
}

impl SharedBuffer {
    /// Wrap a descriptor.
    ///
    /// # Safety
    ///
    /// The caller asserts it owns the buffer named by `desc` and that no
    /// other `SharedBuffer` for it exists.
    pub unsafe fn from_descriptor(channel: u32, desc: SharedBufferDescriptor) -> Self {
        Self { channel, desc }
    }

    /// Channel the buffer was received on.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// The descriptor as read from the ring.
    pub fn descriptor(&self) -> &SharedBufferDescriptor {
        &self.desc
    }

    /// Host virtual address of the payload.
    pub fn addr(&self) -> VirtAddr {
        self.desc.host_virt()
    }

    /// Modem physical address of the payload.
    pub fn modem_phys(&self) -> u32 {
        self.desc.mod_phys
    }

    /// Valid payload bytes.
    pub fn len(&self) -> usize {
        self.desc.data_size as usize
    }

    /// True when the producer sent no payload.
    pub fn is_empty(&self) -> bool {
        self.desc.data_size == 0
    }

    /// Capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.desc.buf_size as usize
    }

    /// Producer cookie.
    pub fn cookie(&self) -> u32 {
        self.desc.cookie
    }
}

/// `put_buf` failed; the buffer is handed back so it is not lost.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PutBufError {
    /// Why the buffer was refused.
    pub error: Error,
    /// The buffer, still owned by the caller.
    pub buffer: SharedBuffer,
}

impl From<PutBufError> for Error {
    fn from(err: PutBufError) -> Self {
        err.error
    }
}

/// A message visible in place, not yet released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    channel: u32,
    addr: VirtAddr,
    len: u32,
}

impl PendingMessage {
    /// Channel the message sits on.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Host virtual address of the payload.
    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Never true for a message handed out by `recv_ptr_noncopy`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn trace_ring(channel: u32, op: &'static str, md: &RingMetadata) {
    let s = md.snapshot();
    debug!(channel, op, pi = s.pi, ci = s.ci, pc = s.pc, cc = s.cc);
}

/// One channel block seen through an instance's translator.
pub(crate) struct ChannelView<'a> {
    pub id: u32,
    pub block: &'a ChannelBlock,
    pub translator: &'a Translator,
}

impl fmt::Debug for ChannelView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelView")
            .field("id", &self.id)
            .field("msg_ring", &self.block.msg_ring.md.snapshot())
            .field("bl_ring", &self.block.bl_ring.md.snapshot())
            .finish()
    }
}

impl ChannelView<'_> {
    fn msg_ring(&self) -> &MessageRing {
        &self.block.msg_ring
    }

    fn bl_ring(&self) -> &BufferListRing {
        &self.block.bl_ring
    }

    /// Address of a slot's buffer, cross-checked against its DMA offset.
    fn slot_buffer(&self, desc: &SlotDescriptor, len: usize) -> Result<VirtAddr> {
        let va = desc.host_virt();
        let offset = self
            .translator
            .host_virtual_to_dma_offset(va)
            .map_err(|_| Error::MemoryInvalid(format!("slot buffer {va} outside DMA region")))?;
        if offset != desc.modem_ptr {
            return Err(Error::MemoryInvalid(format!(
                "slot buffer {va} at offset {offset:#x}, descriptor says {:#x}",
                desc.modem_ptr
            )));
        }
        if !self.translator.contains(va, len) {
            return Err(Error::MemoryInvalid(format!("slot buffer {va}+{len:#x} overruns DMA region")));
        }
        Ok(va)
    }

    /// Read and validate the slot at `ci` without consuming it.
    ///
    /// A slot with an impossible length or address is discarded so the
    /// ring does not wedge on it.
    fn head(&self) -> Result<(VirtAddr, u32)> {
        let ring = self.msg_ring();
        let md = &ring.md;
        if md.is_empty() {
            return Err(Error::ChannelEmpty(self.id));
        }
        let desc = ring.slot(md.consumer_index())?.load();
        let msg_size = md.msg_size();

        if desc.len == 0 || desc.len > msg_size {
            md.advance_consumer();
            trace_ring(self.id, "discard", md);
            return Err(Error::InputInvalid(format!(
                "slot length {} outside 1..={msg_size} on channel {}",
                desc.len, self.id
            )));
        }
        match self.slot_buffer(&desc, desc.len as usize) {
            Ok(va) => Ok((va, desc.len)),
            Err(err) => {
                md.advance_consumer();
                trace_ring(self.id, "discard", md);
                Err(err)
            }
        }
    }

    /// Copy `payload` into the slot at `pi` and publish it.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let ring = self.msg_ring();
        let md = &ring.md;
        let msg_size = md.msg_size() as usize;
        if payload.is_empty() || payload.len() > msg_size {
            return Err(Error::InputInvalid(format!(
                "payload of {} bytes outside 1..={msg_size}",
                payload.len()
            )));
        }
        if md.is_full() {
            return Err(Error::ChannelFull(self.id));
        }

        let slot = ring.slot(md.producer_index())?;
        let va = self.slot_buffer(&slot.load(), payload.len())?;
        self.translator.write(va, payload)?;
        slot.set_len(payload.len() as u32);
        md.advance_producer();

        trace_ring(self.id, "send", md);
        Ok(())
    }

    /// Copy the message at `ci` into `out` and release the slot.
    pub fn recv(&self, out: &mut [u8]) -> Result<usize> {
        let (va, len) = self.head()?;
        let len = len as usize;
        if out.len() < len {
            return Err(Error::InputInvalid(format!(
                "buffer of {} bytes too small for {len}-byte message",
                out.len()
            )));
        }
        self.translator.read(va, &mut out[..len])?;
        let md = &self.msg_ring().md;
        md.advance_consumer();

        trace_ring(self.id, "recv", md);
        Ok(len)
    }

    /// Take the descriptor at `ci` and release the slot.
    ///
    /// A descriptor naming memory outside the DMA region is discarded with
    /// `InputInvalid`. One whose payload overruns its buffer is discarded the
    /// same way, but the buffer itself goes back on the free list.
    pub fn recv_ptr(&self) -> Result<SharedBuffer> {
        let (va, len) = self.head()?;
        let md = &self.msg_ring().md;

        let mut raw = [0u8; SharedBufferDescriptor::SIZE];
        if (len as usize) < raw.len() {
            md.advance_consumer();
            return Err(Error::InputInvalid(format!(
                "descriptor slot holds {len} bytes, need {}",
                raw.len()
            )));
        }
        self.translator.read(va, &mut raw)?;
        md.advance_consumer();
        trace_ring(self.id, "recv_ptr", md);

        let desc = SharedBufferDescriptor::from_bytes(&raw);
        let addr = desc.host_virt();
        if !self.translator.contains(addr, desc.buf_size.max(1) as usize) {
            return Err(Error::InputInvalid(format!(
                "descriptor names {addr}+{:#x} outside DMA region",
                desc.buf_size
            )));
        }
        if self.translator.host_virtual_to_coprocessor_physical(addr)? != desc.mod_phys {
            return Err(Error::MemoryInvalid(format!(
                "descriptor for {addr} carries modem address {:#x}",
                desc.mod_phys
            )));
        }

        let buffer = SharedBuffer {
            channel: self.id,
            desc,
        };
        if desc.data_size > desc.buf_size {
            if let Err(refused) = self.put_buf(buffer) {
                warn!(channel = self.id, %addr, err = %refused.error, "buffer lost");
            }
            return Err(Error::InputInvalid(format!(
                "descriptor for {addr} carries {} bytes in a {}-byte buffer",
                desc.data_size, desc.buf_size
            )));
        }
        Ok(buffer)
    }

    /// Location of the message at `ci`, left in place.
    pub fn peek(&self) -> Result<PendingMessage> {
        let (addr, len) = self.head()?;
        Ok(PendingMessage {
            channel: self.id,
            addr,
            len,
        })
    }

    /// Release the slot at `ci`; returns the length it held.
    pub fn mark_consumed(&self) -> Result<u32> {
        let ring = self.msg_ring();
        let md = &ring.md;
        if md.is_empty() {
            return Err(Error::ChannelEmpty(self.id));
        }
        let len = ring.slot(md.consumer_index())?.load().len;
        md.advance_consumer();
        trace_ring(self.id, "mark_consumed", md);
        Ok(len)
    }

    /// Return a buffer to the free-list ring.
    pub fn put_buf(&self, buffer: SharedBuffer) -> std::result::Result<(), PutBufError> {
        let refuse = |error, buffer| Err(PutBufError { error, buffer });

        if buffer.channel() != self.id {
            return refuse(
                Error::InputInvalid(format!(
                    "buffer from channel {} returned to channel {}",
                    buffer.channel(),
                    self.id
                )),
                buffer,
            );
        }
        let addr = buffer.addr();
        let len = buffer.capacity().max(1);
        if !self.translator.contains(addr, len) {
            return refuse(
                Error::InputInvalid(format!("buffer {addr}+{len:#x} outside DMA region")),
                buffer,
            );
        }
        let mod_phys = match self.translator.host_virtual_to_coprocessor_physical(addr) {
            Ok(phys) => phys,
            Err(error) => return refuse(error, buffer),
        };

        let ring = self.bl_ring();
        let md = &ring.md;
        if md.is_full() {
            return refuse(Error::BufferListFull(self.id), buffer);
        }
        let slot = match ring.slot(md.producer_index()) {
            Ok(slot) => slot,
            Err(error) => return refuse(error, buffer),
        };

        slot.store(&SharedBufferDescriptor {
            mod_phys,
            data_size: 0,
            ..buffer.desc
        });
        md.advance_producer();

        trace_ring(self.id, "put_buf", md);
        Ok(())
    }

    /// Write the channel header and reset both rings.
    fn reset(&self, kind: ChannelKind, msg_ring_size: u32, depth: u32, bl_msg_size: u32) {
        let block = self.block;
        block.ch_id.store(self.id, Ordering::Relaxed);
        block.ch_type.store(kind.wire(), Ordering::Relaxed);
        block.bl_initialized.store(0, Ordering::Relaxed);
        block.msg_ring.md.reset(depth, msg_ring_size);
        match kind {
            ChannelKind::Message => block.bl_ring.md.reset(0, 0),
            ChannelKind::Pointer => block.bl_ring.md.reset(depth, bl_msg_size),
        }
    }

    /// Place one pool buffer behind every message-ring slot.
    ///
    /// On failure every buffer taken so far is returned to `pool`.
    fn stock_slots(&self, pool: &dyn BufferPool, depth: u32) -> Result<Vec<VirtAddr>> {
        let ring = self.msg_ring();
        let mut taken = Vec::with_capacity(depth as usize);
        let result = (|| -> Result<()> {
            for index in 0..depth {
                let va = pool.alloc().ok_or_else(|| {
                    Error::HostBufferAllocFail(format!(
                        "no {}-byte buffer for slot {index} of channel {}",
                        pool.element_size(),
                        self.id
                    ))
                })?;
                taken.push(va);
                let modem_ptr = self.translator.host_virtual_to_dma_offset(va)?;
                let (host_virt_h, host_virt_l) = va.to_wire();
                ring.slot(index)?.store(&SlotDescriptor {
                    modem_ptr,
                    host_virt_l,
                    host_virt_h,
                    len: 0,
                });
            }
            Ok(())
        })();
        match result {
            Ok(()) => Ok(taken),
            Err(err) => {
                release(pool, &taken);
                Err(err)
            }
        }
    }

    /// Fill the free-list ring with pool buffers and mark it stocked.
    fn stock_free_list(&self, pool: &dyn BufferPool, depth: u32) -> Result<Vec<VirtAddr>> {
        let ring = self.bl_ring();
        let mut taken = Vec::with_capacity(depth as usize);
        let result = (|| -> Result<()> {
            for index in 0..depth {
                let va = pool.alloc().ok_or_else(|| {
                    Error::HostBufferAllocFail(format!(
                        "no {}-byte buffer for free list of channel {}",
                        pool.element_size(),
                        self.id
                    ))
                })?;
                taken.push(va);
                let (host_virt_h, host_virt_l) = va.to_wire();
                ring.slot(index)?.store(&SharedBufferDescriptor {
                    mod_phys: self.translator.host_virtual_to_coprocessor_physical(va)?,
                    host_virt_l,
                    host_virt_h,
                    buf_size: pool.element_size(),
                    data_size: 0,
                    cookie: index,
                });
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                ring.md.reset_stocked(depth, ring.md.msg_size());
                self.block.bl_initialized.store(1, Ordering::Release);
                Ok(taken)
            }
            Err(err) => {
                release(pool, &taken);
                Err(err)
            }
        }
    }

    /// Set up a message channel: every slot gets a `pool` buffer.
    pub fn configure_message(
        &self,
        pool: &dyn BufferPool,
        depth: u32,
        msg_size: u32,
    ) -> Result<Vec<VirtAddr>> {
        self.reset(ChannelKind::Message, msg_size, depth, 0);
        self.stock_slots(pool, depth)
    }

    /// Set up a pointer channel: descriptor buffers behind the message
    /// slots, and a stocked free list.
    ///
    /// Returns the buffers taken from each pool.
    pub fn configure_pointer(
        &self,
        descriptors: &dyn BufferPool,
        buffers: &dyn BufferPool,
        depth: u32,
        msg_size: u32,
    ) -> Result<(Vec<VirtAddr>, Vec<VirtAddr>)> {
        self.reset(
            ChannelKind::Pointer,
            SharedBufferDescriptor::SIZE as u32,
            depth,
            msg_size,
        );
        let slots = self.stock_slots(descriptors, depth)?;
        match self.stock_free_list(buffers, depth) {
            Ok(free) => Ok((slots, free)),
            Err(err) => {
                release(descriptors, &slots);
                Err(err)
            }
        }
    }
}

/// Give buffers back to their pool, ignoring ones it refuses.
pub(crate) fn release(pool: &dyn BufferPool, buffers: &[VirtAddr]) {
    for &va in buffers {
        if let Err(err) = pool.free(va) {
            tracing::warn!(%va, %err, "pool refused buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::InstanceBlock;
    use crate::memory::{
        DmaRegion, MappedRegion, MemRange, SharedMemorySegment, SlabPool,
    };

    const MODEM_PHYS: u32 = 0xC000_0000;

    struct Fixture {
        _data: MappedRegion,
        block_region: MappedRegion,
        translator: Translator,
        msg_pool: SlabPool,
        desc_pool: SlabPool,
        buf_pool: SlabPool,
    }

    impl Fixture {
        fn new() -> Self {
            let dma_seg = SharedMemorySegment::new("test-channel-dma", 1 << 20).unwrap();
            let dma = DmaRegion::from_segment(dma_seg, 0x8000_0000).unwrap();
            let size = std::mem::size_of::<InstanceBlock>().next_multiple_of(4096);
            let seg = SharedMemorySegment::new("test-channel-md", size).unwrap();
            let range = MemRange {
                host_phys: 0x2000_0000,
                modem_phys: 0x2000_0000,
                size: size as u32,
            };
            let block_region = MappedRegion::new(range, Box::new(seg)).unwrap();
            let data_seg = SharedMemorySegment::new("test-channel-data", 4096).unwrap();
            let data = MappedRegion::new(
                MemRange {
                    size: 4096,
                    ..range
                },
                Box::new(data_seg),
            )
            .unwrap();
            Self {
                translator: Translator::new(&dma, MODEM_PHYS, data.host_virt()),
                _data: data,
                block_region,
                msg_pool: SlabPool::new(&dma, 0, 2048, 16).unwrap(),
                desc_pool: SlabPool::new(&dma, 0x10000, 64, 16).unwrap(),
                buf_pool: SlabPool::new(&dma, 0x20000, 0x8000, 16).unwrap(),
            }
        }

        fn view(&self, id: u32) -> ChannelView<'_> {
            let instance: &InstanceBlock = self.block_region.locate(0).unwrap();
            ChannelView {
                id,
                block: instance.channel(id).unwrap(),
                translator: &self.translator,
            }
        }
    }

    #[test]
    fn test_loopback_on_one_ring() {
        let fx = Fixture::new();
        let ch = fx.view(3);
        ch.configure_message(&fx.msg_pool, 4, 2048).unwrap();

        ch.send(b"first").unwrap();
        ch.send(&[7u8; 2048]).unwrap();

        let mut out = [0u8; 2048];
        assert_eq!(ch.recv(&mut out).unwrap(), 5);
        assert_eq!(&out[..5], b"first");
        assert_eq!(ch.recv(&mut out).unwrap(), 2048);
        assert!(out.iter().all(|&b| b == 7));
        assert!(matches!(ch.recv(&mut out), Err(Error::ChannelEmpty(3))));
    }

    #[test]
    fn test_send_validates_length() {
        let fx = Fixture::new();
        let ch = fx.view(0);
        ch.configure_message(&fx.msg_pool, 2, 128).unwrap();

        assert!(matches!(ch.send(&[]), Err(Error::InputInvalid(_))));
        assert!(matches!(ch.send(&[0; 129]), Err(Error::InputInvalid(_))));
        assert!(ch.block.msg_ring.md.is_empty());
    }

    #[test]
    fn test_recv_short_buffer_keeps_message() {
        let fx = Fixture::new();
        let ch = fx.view(1);
        ch.configure_message(&fx.msg_pool, 2, 256).unwrap();
        ch.send(&[1u8; 100]).unwrap();

        let mut small = [0u8; 10];
        assert!(matches!(ch.recv(&mut small), Err(Error::InputInvalid(_))));
        let mut big = [0u8; 256];
        assert_eq!(ch.recv(&mut big).unwrap(), 100);
    }

    #[test]
    fn test_corrupt_length_discarded() {
        let fx = Fixture::new();
        let ch = fx.view(2);
        ch.configure_message(&fx.msg_pool, 4, 256).unwrap();
        ch.send(b"ok").unwrap();
        ch.block.msg_ring.slots[0].set_len(4096);
        ch.send(b"next").unwrap();

        let mut out = [0u8; 256];
        assert!(matches!(ch.recv(&mut out), Err(Error::InputInvalid(_))));
        assert_eq!(ch.recv(&mut out).unwrap(), 4);
        assert_eq!(&out[..4], b"next");
    }

    #[test]
    fn test_stocking_failure_releases_buffers() {
        let fx = Fixture::new();
        let held: Vec<_> = (0..14).map(|_| fx.msg_pool.alloc().unwrap()).collect();
        let ch = fx.view(4);

        let err = ch.configure_message(&fx.msg_pool, 4, 2048).unwrap_err();
        assert!(matches!(err, Error::HostBufferAllocFail(_)));
        assert_eq!(fx.msg_pool.available(), 2);
        release(&fx.msg_pool, &held);
    }

    #[test]
    fn test_pointer_configuration_stocks_free_list() {
        let fx = Fixture::new();
        let ch = fx.view(5);
        let (slots, free) = ch
            .configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000)
            .unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(free.len(), 4);

        let bl = &ch.block.bl_ring;
        assert!(bl.md.is_full());
        assert_eq!(ch.block.bl_initialized.load(Ordering::Acquire), 1);
        assert_eq!(ch.block.ch_type.load(Ordering::Acquire), CH_TYPE_POINTER);
        let first = bl.slots[0].load();
        assert_eq!(first.host_virt(), free[0]);
        assert_eq!(first.buf_size, 0x8000);
        assert_eq!(
            fx.translator.coprocessor_physical_to_host_virtual(first.mod_phys).unwrap(),
            free[0]
        );
    }

    #[test]
    fn test_put_buf_outside_region_hands_buffer_back() {
        let fx = Fixture::new();
        let ch = fx.view(6);
        ch.configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000).unwrap();
        // drain one free-list entry so the ring has room
        ch.block.bl_ring.md.advance_consumer();
        let before = ch.block.bl_ring.md.snapshot();

        let bogus = SharedBufferDescriptor {
            host_virt_l: 0x1000,
            buf_size: 0x8000,
            ..Default::default()
        };
        let buffer = unsafe { SharedBuffer::from_descriptor(6, bogus) };
        let err = ch.put_buf(buffer).unwrap_err();
        assert!(matches!(err.error, Error::InputInvalid(_)));
        assert_eq!(err.buffer.descriptor(), &bogus);
        assert_eq!(ch.block.bl_ring.md.snapshot(), before);
    }

    /// Publish `desc` on the descriptor ring as the modem would.
    fn publish_descriptor(ch: &ChannelView<'_>, desc: &SharedBufferDescriptor) {
        let ring = &ch.block.msg_ring;
        let slot = ring.slot(ring.md.producer_index()).unwrap();
        ch.translator
            .write(slot.load().host_virt(), &desc.to_bytes())
            .unwrap();
        slot.set_len(SharedBufferDescriptor::SIZE as u32);
        ring.md.advance_producer();
    }

    /// Take the next buffer off the free list as the modem would.
    fn take_free(ch: &ChannelView<'_>) -> SharedBufferDescriptor {
        let bl = &ch.block.bl_ring;
        let desc = bl.slot(bl.md.consumer_index()).unwrap().load();
        bl.md.advance_consumer();
        desc
    }

    #[test]
    fn test_recv_ptr_descriptor_outside_region_discarded() {
        let fx = Fixture::new();
        let ch = fx.view(7);
        ch.configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000).unwrap();

        publish_descriptor(
            &ch,
            &SharedBufferDescriptor {
                host_virt_l: 0x1000,
                buf_size: 0x8000,
                ..Default::default()
            },
        );
        assert!(matches!(ch.recv_ptr(), Err(Error::InputInvalid(_))));
        assert!(ch.block.msg_ring.md.is_empty());

        let mut good = take_free(&ch);
        good.data_size = 5;
        publish_descriptor(&ch, &good);
        let buffer = ch.recv_ptr().unwrap();
        assert_eq!(buffer.addr(), good.host_virt());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_recv_ptr_modem_address_mismatch() {
        let fx = Fixture::new();
        let ch = fx.view(8);
        ch.configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000).unwrap();

        let mut desc = take_free(&ch);
        desc.mod_phys += 0x100;
        desc.data_size = 1;
        publish_descriptor(&ch, &desc);
        assert!(matches!(ch.recv_ptr(), Err(Error::MemoryInvalid(_))));
        assert!(ch.block.msg_ring.md.is_empty());
    }

    #[test]
    fn test_recv_ptr_overrun_recycles_buffer() {
        let fx = Fixture::new();
        let ch = fx.view(9);
        ch.configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000).unwrap();

        let mut desc = take_free(&ch);
        assert_eq!(ch.block.bl_ring.md.occupancy(), 3);
        desc.data_size = desc.buf_size + 1;
        publish_descriptor(&ch, &desc);

        assert!(matches!(ch.recv_ptr(), Err(Error::InputInvalid(_))));
        assert!(ch.block.msg_ring.md.is_empty());

        let bl = &ch.block.bl_ring;
        assert_eq!(bl.md.occupancy(), 4);
        let last = bl.md.producer_index().checked_sub(1).unwrap_or(3);
        let recycled = bl.slot(last).unwrap().load();
        assert_eq!(recycled.host_virt(), desc.host_virt());
        assert_eq!(recycled.data_size, 0);
    }

    #[test]
    fn test_put_buf_on_wrong_channel_refused() {
        let fx = Fixture::new();
        let a = fx.view(10);
        let b = fx.view(11);
        a.configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000).unwrap();
        b.configure_pointer(&fx.desc_pool, &fx.buf_pool, 4, 0x8000).unwrap();

        let mut desc = take_free(&a);
        desc.data_size = 10;
        publish_descriptor(&a, &desc);
        let buffer = a.recv_ptr().unwrap();
        take_free(&b);
        let b_before = b.block.bl_ring.md.snapshot();

        let err = b.put_buf(buffer).unwrap_err();
        assert!(matches!(err.error, Error::InputInvalid(_)));
        assert_eq!(err.buffer.channel(), 10);
        assert_eq!(b.block.bl_ring.md.snapshot(), b_before);

        a.put_buf(err.buffer).unwrap();
        assert!(a.block.bl_ring.md.is_full());
    }

    #[test]
    fn test_channel_kind_wire() {
        assert_eq!(ChannelKind::from_wire(1), Some(ChannelKind::Message));
        assert_eq!(ChannelKind::from_wire(ChannelKind::Pointer.wire()), Some(ChannelKind::Pointer));
        assert_eq!(ChannelKind::from_wire(0), None);
    }
}
