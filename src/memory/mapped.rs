//! Page-aligned mappings of physical ranges through a device file.
//!
//! Region start addresses reported by the driver are not page aligned, so a
//! mapping covers the enclosing pages and the segment exposes only the
//! requested range.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::AsFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A shared mapping of `[phys, phys + len)` of a device file.
pub struct DeviceMapping {
    /// Start of the page-aligned mapping.
    map_ptr: NonNull<u8>,
    /// Length of the page-aligned mapping.
    map_len: usize,
    /// Distance from `map_ptr` to the requested start.
    align: usize,
    /// Requested length.
    len: usize,
    memory_type: MemoryType,
}

impl DeviceMapping {
    /// Map `len` bytes at file offset `phys` of `fd`.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty range or if `mmap` fails.
    pub fn new<Fd: AsFd>(fd: Fd, phys: u64, len: usize, memory_type: MemoryType) -> Result<Self> {
        if len == 0 {
            return Err(Error::Map(format!("empty region at {phys:#x}")));
        }

        let page = rustix::param::page_size() as u64;
        let align = (phys % page) as usize;
        let map_len = align + len;

        // SAFETY: new shared mapping at a kernel-chosen address; nothing else
        // aliases it until we hand out the segment.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                phys - align as u64,
            )
        }
        .map_err(|e| Error::Map(format!("{len:#x} bytes at {phys:#x}: {e}")))?;

        let map_ptr =
            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Map("mmap returned null".into()))?;

        tracing::debug!(phys = format_args!("{phys:#x}"), len, align, "mapped device region");

        Ok(Self {
            map_ptr,
            map_len,
            align,
            len,
            memory_type,
        })
    }
}

impl MemorySegment for DeviceMapping {
    fn as_ptr(&self) -> *const u8 {
        // SAFETY: align < page size <= map_len
        unsafe { self.map_ptr.as_ptr().add(self.align) }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        // SAFETY: as above
        unsafe { self.map_ptr.as_ptr().add(self.align) }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }
}

impl Drop for DeviceMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.map_ptr.as_ptr().cast(), self.map_len);
        }
    }
}

// SAFETY: plain shared memory, see SharedMemorySegment.
unsafe impl Send for DeviceMapping {}
unsafe impl Sync for DeviceMapping {}
