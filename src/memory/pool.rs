//! Fixed-size buffer pools backing the rings.
//!
//! Channel configuration takes ring buffers from a [`BufferPool`] per size
//! class. Any pool implementation works as long as it hands out addresses
//! inside the DMA region; [`SlabPool`] is the built-in one, carving equal
//! elements out of a window of the region.
//!
//! ```text
//!   DMA region
//!   ┌──────────────┬───────────────┬────────────────────┬─────────┐
//!   │ Msg2K × n    │ Msg16K × n    │ Ptr128K × n        │ SH × n  │
//!   └──────────────┴───────────────┴────────────────────┴─────────┘
//!   one AtomicU64 bit per element: 0 = free, 1 = taken
//! ```

use super::{DmaRegion, MemorySegment, VirtAddr};
use crate::config::{
    POOL_2K_COUNT, POOL_16K_COUNT, POOL_128K_COUNT, POOL_SH_BUF_COUNT, SIZE_2K, SIZE_16K,
    SIZE_128K,
};
use crate::error::{Error, Result};
use crate::layout::SharedBufferDescriptor;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Start of every carved pool is aligned to this many bytes.
const POOL_ALIGN: usize = 64;

/// A pool of equally sized buffers in the DMA region.
pub trait BufferPool: Send + Sync {
    /// Take a buffer, or `None` when the pool is exhausted.
    fn alloc(&self) -> Option<VirtAddr>;

    /// Return a buffer previously handed out by `alloc`.
    fn free(&self, addr: VirtAddr) -> Result<()>;

    /// Size of every element in bytes.
    fn element_size(&self) -> u32;

    /// Number of elements currently free.
    fn available(&self) -> usize;
}

/// Size class of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolClass {
    /// 2 KiB message slot buffers.
    Msg2K,
    /// 16 KiB message slot buffers.
    Msg16K,
    /// 128 KiB pointer-channel buffers, stocked in the free-list ring.
    Ptr128K,
    /// Descriptor-sized buffers backing pointer-channel message slots.
    SharedDescriptor,
    /// Spare class for application use.
    Aux,
}

impl PoolClass {
    /// Every class, in slot order.
    pub const ALL: [PoolClass; 5] = [
        PoolClass::Msg2K,
        PoolClass::Msg16K,
        PoolClass::Ptr128K,
        PoolClass::SharedDescriptor,
        PoolClass::Aux,
    ];

    /// Element size used when a layout does not say otherwise.
    pub const fn default_element_size(self) -> u32 {
        match self {
            PoolClass::Msg2K | PoolClass::Aux => SIZE_2K,
            PoolClass::Msg16K => SIZE_16K,
            PoolClass::Ptr128K => SIZE_128K,
            PoolClass::SharedDescriptor => SharedBufferDescriptor::SIZE as u32,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// How to carve pools out of a DMA region, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    entries: Vec<(PoolClass, u32, usize)>,
}

impl Default for PoolLayout {
    fn default() -> Self {
        Self::empty()
            .with_class(PoolClass::Msg2K, SIZE_2K, POOL_2K_COUNT)
            .with_class(PoolClass::Msg16K, SIZE_16K, POOL_16K_COUNT)
            .with_class(PoolClass::Ptr128K, SIZE_128K, POOL_128K_COUNT)
            .with_class(
                PoolClass::SharedDescriptor,
                PoolClass::SharedDescriptor.default_element_size(),
                POOL_SH_BUF_COUNT,
            )
    }
}

impl PoolLayout {
    /// A layout with no pools.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add (or replace) the pool for `class`.
    pub fn with_class(mut self, class: PoolClass, element_size: u32, count: usize) -> Self {
        self.entries.retain(|(c, _, _)| *c != class);
        self.entries.push((class, element_size, count));
        self
    }

    /// Bytes of DMA region the layout needs.
    pub fn required_len(&self) -> usize {
        self.entries.iter().fold(0, |offset, &(_, size, count)| {
            offset.next_multiple_of(POOL_ALIGN) + size as usize * count
        })
    }

    /// Iterate `(class, element_size, count)`.
    pub fn entries(&self) -> impl Iterator<Item = (PoolClass, u32, usize)> + '_ {
        self.entries.iter().copied()
    }
}

/// The pools of one instance, keyed by size class.
#[derive(Clone, Default)]
pub struct BufferPools {
    pools: [Option<Arc<dyn BufferPool>>; 5],
}

impl BufferPools {
    /// No pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `pool` for `class`.
    pub fn with(mut self, class: PoolClass, pool: Arc<dyn BufferPool>) -> Self {
        self.pools[class.index()] = Some(pool);
        self
    }

    /// Carve slab pools for every entry of `layout` out of `dma`.
    pub fn carve(dma: &DmaRegion, layout: &PoolLayout) -> Result<Self> {
        let needed = layout.required_len();
        if needed > dma.len() {
            return Err(Error::HostBufferAllocFail(format!(
                "pool layout needs {needed:#x} bytes, DMA region has {:#x}",
                dma.len()
            )));
        }

        let mut pools = Self::new();
        let mut offset = 0usize;
        for (class, size, count) in layout.entries() {
            offset = offset.next_multiple_of(POOL_ALIGN);
            if count > 0 {
                let pool = SlabPool::new(dma, offset, size, count)?;
                tracing::debug!(?class, element_size = size, count, offset, "carved pool");
                pools = pools.with(class, Arc::new(pool));
            }
            offset += size as usize * count;
        }
        Ok(pools)
    }

    /// The pool for `class`, if installed.
    pub fn get(&self, class: PoolClass) -> Option<&Arc<dyn BufferPool>> {
        self.pools[class.index()].as_ref()
    }

    /// The message pool with the smallest elements that still hold `msg_size`.
    pub fn best_fit(&self, msg_size: u32) -> Option<(PoolClass, &Arc<dyn BufferPool>)> {
        [PoolClass::Msg2K, PoolClass::Msg16K]
            .into_iter()
            .filter_map(|class| self.get(class).map(|pool| (class, pool)))
            .filter(|(_, pool)| pool.element_size() >= msg_size)
            .min_by_key(|(_, pool)| pool.element_size())
    }
}

impl fmt::Debug for BufferPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for class in PoolClass::ALL {
            if let Some(pool) = self.get(class) {
                map.entry(&class, &(pool.element_size(), pool.available()));
            }
        }
        map.finish()
    }
}

/// Equal-sized elements carved from a window of the DMA region.
///
/// Allocation is lock-free: one bit per element in a row of atomic words.
pub struct SlabPool {
    /// Keeps the DMA memory mapped.
    segment: Arc<dyn MemorySegment>,
    base: u64,
    element_size: u32,
    count: usize,
    words: Box<[AtomicU64]>,
    free: AtomicUsize,
}

impl SlabPool {
    /// Carve `count` elements of `element_size` bytes at `offset` into `dma`.
    pub fn new(dma: &DmaRegion, offset: usize, element_size: u32, count: usize) -> Result<Self> {
        if element_size == 0 || count == 0 {
            return Err(Error::HostBufferAllocFail(
                "pool needs a non-zero element size and count".into(),
            ));
        }
        let end = (element_size as usize)
            .checked_mul(count)
            .and_then(|len| len.checked_add(offset));
        if end.is_none_or(|end| end > dma.len()) {
            return Err(Error::HostBufferAllocFail(format!(
                "{count} x {element_size} bytes at {offset:#x} exceed DMA region"
            )));
        }

        let words = (0..count.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();

        Ok(Self {
            segment: Arc::clone(dma.segment()),
            base: dma.host_virt().get() + offset as u64,
            element_size,
            count,
            words,
            free: AtomicUsize::new(count),
        })
    }

    /// Total number of elements.
    pub fn capacity(&self) -> usize {
        self.count
    }

    fn index_of(&self, addr: VirtAddr) -> Result<usize> {
        let invalid = || Error::InputInvalid(format!("{addr} is not an element of this pool"));
        let offset = addr.get().checked_sub(self.base).ok_or_else(invalid)?;
        if offset % u64::from(self.element_size) != 0 {
            return Err(invalid());
        }
        let index = (offset / u64::from(self.element_size)) as usize;
        if index >= self.count {
            return Err(invalid());
        }
        Ok(index)
    }
}

impl BufferPool for SlabPool {
    fn alloc(&self) -> Option<VirtAddr> {
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            loop {
                let bit = (!current).trailing_zeros() as usize;
                let index = word_idx * 64 + bit;
                if bit == 64 || index >= self.count {
                    break;
                }
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.free.fetch_sub(1, Ordering::Relaxed);
                        let offset = index as u64 * u64::from(self.element_size);
                        return Some(VirtAddr::new(self.base + offset));
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    fn free(&self, addr: VirtAddr) -> Result<()> {
        let index = self.index_of(addr)?;
        let mask = 1u64 << (index % 64);
        let previous = self.words[index / 64].fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return Err(Error::InputInvalid(format!("{addr} freed twice")));
        }
        self.free.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn element_size(&self) -> u32 {
        self.element_size
    }

    fn available(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SlabPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabPool")
            .field("base", &VirtAddr::new(self.base))
            .field("element_size", &self.element_size)
            .field("count", &self.count)
            .field("available", &self.available())
            .field("memory_type", &self.segment.memory_type())
            .finish()
    }
}
