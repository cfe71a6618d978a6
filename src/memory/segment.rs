//! Memory segment trait and types.

/// Kind of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Physical memory mapped through a device node (`/dev/mem`).
    ///
    /// This is how the host sees the modem's control and data regions on
    /// real hardware.
    Device,
    /// Anonymous shared memory (memfd_create + mmap).
    ///
    /// Used by the loopback bus and as a stand-in for hugepage DMA memory.
    SharedMemory,
    /// Hugepage memory supplied by the application (DMA region).
    HugePages,
}

/// Trait for memory segment backends.
///
/// A segment is a contiguous, mapped range of memory. The IPC regions and
/// the DMA region are all segments; the rest of the crate only ever sees
/// them through this trait.
///
/// # Safety
///
/// Implementations must ensure that:
/// - `as_ptr()..as_ptr() + len()` stays mapped for the lifetime of the segment
/// - The memory is readable and writable
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Host virtual address of the first byte.
    fn base_address(&self) -> u64 {
        self.as_ptr() as u64
    }
}
