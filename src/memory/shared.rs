//! Shared memory segment using Linux memfd.
//!
//! The loopback bus backs the modem's regions with memfds so that the host
//! instance and the simulated modem map the same physical pages through
//! independent mappings, exactly like the two sides of the PCIe window.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// A memory segment backed by Linux memfd (anonymous shared memory).
///
/// Further views of the same memory are created with [`map_window`], which
/// maps a sub-range of the memfd at a separate address.
///
/// # Example
///
/// ```rust,ignore
/// use modem_ipc::memory::{SharedMemorySegment, MemorySegment};
///
/// let segment = SharedMemorySegment::new("modem-peb", 1024 * 1024)?;
/// let view = segment.map_window(4096, 8192)?;
/// ```
///
/// [`map_window`]: SharedMemorySegment::map_window
pub struct SharedMemorySegment {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment.
    len: usize,
    /// Optional name (for debugging).
    name: Option<String>,
}

impl SharedMemorySegment {
    /// Create a new shared memory segment.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name for the segment (visible in `/proc/self/fd/`).
    /// * `size` - Size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Map("size must be greater than 0".into()));
        }

        let cname = CString::new(name).map_err(|e| Error::Map(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let ptr = map_shared(&fd, 0, size)?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: Some(name.to_string()),
        })
    }

    /// Map `len` bytes starting at `offset` of the same memfd as a new segment.
    ///
    /// `offset` must be page aligned; writes through either mapping are
    /// visible through the other.
    pub fn map_window(&self, offset: usize, len: usize) -> Result<Self> {
        if len == 0 || offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::Map(format!(
                "window {offset:#x}+{len:#x} outside segment of {:#x} bytes",
                self.len
            )));
        }

        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        let ptr = map_shared(&fd, offset as u64, len)?;

        Ok(Self {
            fd,
            ptr,
            len,
            name: self.name.clone(),
        })
    }

    /// Get the debug name of this segment.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

fn map_shared(fd: &OwnedFd, offset: u64, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: fresh shared mapping of a memfd we own; the kernel picks the address.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            offset,
        )?
    };

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Map("mmap returned null".into()))
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::SharedMemory
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping is plain shared memory with no thread-local state;
// concurrent access discipline is the caller's (ring protocol) business.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_memory_creation() {
        let segment = SharedMemorySegment::new("test-segment", 4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.memory_type(), MemoryType::SharedMemory);
        assert_eq!(segment.name(), Some("test-segment"));
    }

    #[test]
    fn test_shared_memory_zero_size_fails() {
        assert!(SharedMemorySegment::new("test", 0).is_err());
    }

    #[test]
    fn test_window_sees_parent_writes() {
        let segment = SharedMemorySegment::new("test-window", 3 * 4096).unwrap();
        let window = segment.map_window(4096, 4096).unwrap();

        unsafe {
            *segment.as_mut_ptr().add(4096 + 10) = 77;
            assert_eq!(*window.as_ptr().add(10), 77);

            *window.as_mut_ptr().add(20) = 88;
            assert_eq!(*segment.as_ptr().add(4096 + 20), 88);
        }
        assert_ne!(segment.base_address() + 4096, window.base_address());
    }

    #[test]
    fn test_window_out_of_range_fails() {
        let segment = SharedMemorySegment::new("test-window-oob", 4096).unwrap();
        assert!(segment.map_window(0, 8192).is_err());
        assert!(segment.map_window(4096, 1).is_err());
        assert!(segment.map_window(0, 0).is_err());
    }
}
