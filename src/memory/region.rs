//! The regions shared with the modem and typed access into them.

use super::{MemorySegment, Translator, VirtAddr};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// One physical memory range as exchanged with the driver.
///
/// The driver fills `modem_phys` for the DMA range handed to it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemRange {
    /// Host physical start.
    pub host_phys: u64,
    /// Start as seen from the modem.
    pub modem_phys: u32,
    /// Size in bytes.
    pub size: u32,
}

/// The region map returned by the control device.
///
/// Field order is fixed by the driver interface.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemMap {
    /// Modem configuration registers (unused by the IPC layer).
    pub modem_registers: MemRange,
    /// Modem data region, holds the IPC metadata.
    pub data: MemRange,
    /// Control region, holds the host interface block.
    pub control: MemRange,
    /// DMA region backing the buffer pools.
    pub dma: MemRange,
}

const _: () = assert!(std::mem::size_of::<MemRange>() == 16);
const _: () = assert!(std::mem::size_of::<SystemMap>() == 64);

/// Marker for structures that may be viewed in place inside a shared region.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, accept every bit pattern, and contain
/// only fields that tolerate concurrent mutation by the peer (atomics, or
/// arrays and structs of such types).
pub unsafe trait SharedLayout: Sync {}

/// A region of modem memory mapped into this process.
pub struct MappedRegion {
    range: MemRange,
    segment: Box<dyn MemorySegment>,
}

impl MappedRegion {
    /// Wrap a mapping of `range`.
    pub fn new(range: MemRange, segment: Box<dyn MemorySegment>) -> Result<Self> {
        if segment.len() < range.size as usize {
            return Err(Error::Map(format!(
                "mapping of {:#x} bytes shorter than region of {:#x}",
                segment.len(),
                range.size
            )));
        }
        Ok(Self { range, segment })
    }

    /// The physical range this region maps.
    pub fn range(&self) -> MemRange {
        self.range
    }

    /// Host virtual address of the first byte.
    pub fn host_virt(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.segment.as_ptr())
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.range.size as usize
    }

    /// Returns true for a zero-sized region.
    pub fn is_empty(&self) -> bool {
        self.range.size == 0
    }

    /// View the `T` at `offset` bytes into the region.
    ///
    /// Fails with [`Error::MemoryInvalid`] if `T` would extend past the end
    /// of the region or the address is misaligned for `T`.
    pub fn locate<T: SharedLayout>(&self, offset: usize) -> Result<&T> {
        let size = std::mem::size_of::<T>();
        if offset.checked_add(size).is_none_or(|end| end > self.len()) {
            return Err(Error::MemoryInvalid(format!(
                "{} bytes at offset {offset:#x} exceed region of {:#x} bytes",
                size,
                self.len()
            )));
        }

        // SAFETY: offset + size is within the mapping checked above.
        let ptr = unsafe { self.segment.as_ptr().add(offset) };
        if (ptr as usize) % std::mem::align_of::<T>() != 0 {
            return Err(Error::MemoryInvalid(format!(
                "offset {offset:#x} misaligned for {}",
                std::any::type_name::<T>()
            )));
        }

        // SAFETY: in bounds, aligned, and `SharedLayout` guarantees any bit
        // pattern is valid and all mutation goes through interior mutability.
        // The borrow is tied to `self`, which owns the mapping.
        Ok(unsafe { &*ptr.cast::<T>() })
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("range", &self.range)
            .field("host_virt", &self.host_virt())
            .finish()
    }
}

/// The DMA-capable memory supplied by the application (hugepages on target).
#[derive(Clone)]
pub struct DmaRegion {
    segment: Arc<dyn MemorySegment>,
    host_phys: u64,
}

impl DmaRegion {
    /// Describe `segment`, whose first byte sits at host physical `host_phys`.
    ///
    /// The region size must fit the 32-bit wire format.
    pub fn new(segment: Arc<dyn MemorySegment>, host_phys: u64) -> Result<Self> {
        if segment.is_empty() || u32::try_from(segment.len()).is_err() {
            return Err(Error::InputInvalid(format!(
                "DMA region of {:#x} bytes not representable",
                segment.len()
            )));
        }
        Ok(Self { segment, host_phys })
    }

    /// Convenience for an owned segment.
    pub fn from_segment(segment: impl MemorySegment + 'static, host_phys: u64) -> Result<Self> {
        Self::new(Arc::new(segment), host_phys)
    }

    /// The backing segment.
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }

    /// Host virtual base.
    pub fn host_virt(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.segment.as_ptr())
    }

    /// Host physical base.
    pub fn host_phys(&self) -> u64 {
        self.host_phys
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.segment.len()
    }

    /// Always false; empty regions are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }

    /// The range announced to the driver; the modem side is filled in by it.
    pub fn mem_range(&self) -> MemRange {
        MemRange {
            host_phys: self.host_phys,
            modem_phys: 0,
            size: self.segment.len() as u32,
        }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("host_virt", &self.host_virt())
            .field("host_phys", &format_args!("{:#x}", self.host_phys))
            .field("len", &self.len())
            .finish()
    }
}

/// All regions of one instance, built once at initialisation.
pub struct RegionMap {
    system: SystemMap,
    control: MappedRegion,
    data: MappedRegion,
    translator: Translator,
}

impl RegionMap {
    /// Assemble the map. `system.dma.modem_phys` is the modem's view of `dma`.
    pub fn new(
        system: SystemMap,
        control: MappedRegion,
        data: MappedRegion,
        dma: &DmaRegion,
    ) -> Result<Self> {
        if system.dma.size as usize != dma.len() {
            return Err(Error::Map(format!(
                "driver reports DMA region of {:#x} bytes, supplied {:#x}",
                system.dma.size,
                dma.len()
            )));
        }
        let translator = Translator::new(dma, system.dma.modem_phys, data.host_virt());
        Ok(Self {
            system,
            control,
            data,
            translator,
        })
    }

    /// The driver's system map.
    pub fn system(&self) -> &SystemMap {
        &self.system
    }

    /// Control region (host interface block).
    pub fn control(&self) -> &MappedRegion {
        &self.control
    }

    /// Modem data region (IPC metadata).
    pub fn data(&self) -> &MappedRegion {
        &self.data
    }

    /// Address translator for this instance.
    pub fn translator(&self) -> &Translator {
        &self.translator
    }
}

impl fmt::Debug for RegionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionMap")
            .field("control", &self.control)
            .field("data", &self.data)
            .field("translator", &self.translator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemorySegment;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[repr(C)]
    struct Pair {
        a: AtomicU32,
        b: AtomicU32,
    }

    unsafe impl SharedLayout for Pair {}

    fn region(size: usize) -> MappedRegion {
        let segment = SharedMemorySegment::new("test-region", size).unwrap();
        let range = MemRange {
            host_phys: 0x1000_0000,
            modem_phys: 0x1000_0000,
            size: size as u32,
        };
        MappedRegion::new(range, Box::new(segment)).unwrap()
    }

    #[test]
    fn test_locate_views_memory_in_place() {
        let region = region(4096);
        let pair: &Pair = region.locate(64).unwrap();
        pair.b.store(9, Ordering::Release);

        let again: &Pair = region.locate(64).unwrap();
        assert_eq!(again.b.load(Ordering::Acquire), 9);
        assert_eq!(again.a.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_locate_rejects_out_of_bounds_and_misaligned() {
        let region = region(4096);
        assert!(matches!(region.locate::<Pair>(4090), Err(Error::MemoryInvalid(_))));
        assert!(matches!(region.locate::<Pair>(usize::MAX), Err(Error::MemoryInvalid(_))));
        assert!(matches!(region.locate::<Pair>(2), Err(Error::MemoryInvalid(_))));
    }

    #[test]
    fn test_region_shorter_than_range_rejected() {
        let segment = SharedMemorySegment::new("test-region-short", 4096).unwrap();
        let range = MemRange {
            host_phys: 0,
            modem_phys: 0,
            size: 8192,
        };
        assert!(MappedRegion::new(range, Box::new(segment)).is_err());
    }

    #[test]
    fn test_dma_range_announced_to_driver() {
        let segment = SharedMemorySegment::new("test-dma", 8192).unwrap();
        let dma = DmaRegion::from_segment(segment, 0x8000_0000).unwrap();
        let range = dma.mem_range();
        assert_eq!(range.host_phys, 0x8000_0000);
        assert_eq!(range.size, 8192);
        assert_eq!(range.modem_phys, 0);
    }
}
