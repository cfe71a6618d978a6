//! Devices the instance talks to: the IPC control device and the physical
//! memory device.
//!
//! Both are traits so the instance can run against the real driver
//! ([`GulControlDevice`], [`DevMem`]) or the loopback bus in [`crate::sim`].

use crate::config::IpcConfig;
use crate::error::{Error, Result};
use crate::memory::{DeviceMapping, MemRange, MemorySegment, MemoryType, SystemMap};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Control requests understood by the IPC driver.
pub trait ControlDevice: Send + Sync {
    /// Hand the DMA range to the driver and receive the system map.
    fn system_map(&self, dma: MemRange) -> Result<SystemMap>;

    /// Bind `event` to `channel`; returns the MSI value the modem will raise.
    fn register_event(&self, channel: u32, event: BorrowedFd<'_>) -> Result<u32>;

    /// Undo [`register_event`](Self::register_event).
    fn deregister_event(&self, channel: u32, event: BorrowedFd<'_>) -> Result<()>;
}

/// Maps physical ranges into the process.
pub trait MemoryDevice: Send + Sync {
    /// Map `range.size` bytes at `range.host_phys`.
    fn map(&self, range: &MemRange) -> Result<Box<dyn MemorySegment>>;
}

/// The device pair an instance is built on.
pub struct Devices {
    /// Control device.
    pub control: Box<dyn ControlDevice>,
    /// Memory device.
    pub memory: Box<dyn MemoryDevice>,
}

impl Devices {
    /// Open the devices named in `config`.
    pub fn open(config: &IpcConfig) -> Result<Self> {
        Ok(Self {
            control: Box::new(GulControlDevice::open(&config.control_device)?),
            memory: Box::new(DevMem::open(&config.memory_device)?),
        })
    }
}

// Request numbers from the driver's uapi header (magic 'R', pointer-sized
// argument).

/// IOCTL_GUL_IPC_GET_SYS_MAP: _IOW('R', 1, void *)
const IOCTL_GET_SYS_MAP: libc::c_ulong = 0x4008_5201;

/// IOCTL_GUL_IPC_CHANNEL_REGISTER: _IOWR('R', 4, void *)
const IOCTL_CHANNEL_REGISTER: libc::c_ulong = 0xc008_5204;

/// IOCTL_GUL_IPC_CHANNEL_DEREGISTER: _IOWR('R', 5, void *)
const IOCTL_CHANNEL_DEREGISTER: libc::c_ulong = 0xc008_5205;

/// Argument of the register/deregister requests.
#[repr(C)]
#[derive(Debug, Default)]
struct EventRegistration {
    /// Event file descriptor.
    efd: u32,
    /// Channel id.
    ipc_channel_num: u32,
    /// OUTPUT: MSI value assigned by the driver.
    msi_value: u32,
}

/// The IPC control device node (`/dev/gulipcgul0`).
#[derive(Debug)]
pub struct GulControlDevice {
    file: File,
    path: PathBuf,
}

impl GulControlDevice {
    /// Open the device node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::DeviceOpen {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "opened control device");
        Ok(Self { file, path })
    }

    /// Path of the device node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn event_request(
        &self,
        request: libc::c_ulong,
        name: &'static str,
        channel: u32,
        event: BorrowedFd<'_>,
    ) -> Result<EventRegistration> {
        let mut args = EventRegistration {
            efd: event.as_raw_fd() as u32,
            ipc_channel_num: channel,
            msi_value: 0,
        };
        // SAFETY: the request takes a pointer to an `ipc_eventfd_t`, which
        // `EventRegistration` mirrors; the fd is open for the whole call.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request, &mut args) };
        if ret < 0 {
            return Err(Error::Ioctl {
                request: name,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(args)
    }
}

impl ControlDevice for GulControlDevice {
    fn system_map(&self, dma: MemRange) -> Result<SystemMap> {
        let mut map = SystemMap {
            dma,
            ..SystemMap::default()
        };
        // SAFETY: the driver reads `dma` and fills the other ranges of a
        // `sys_map_t`, which `SystemMap` mirrors field for field.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), IOCTL_GET_SYS_MAP, &mut map) };
        if ret < 0 {
            return Err(Error::Ioctl {
                request: "GET_SYS_MAP",
                source: std::io::Error::last_os_error(),
            });
        }
        tracing::debug!(?map, "system map");
        Ok(map)
    }

    fn register_event(&self, channel: u32, event: BorrowedFd<'_>) -> Result<u32> {
        let args =
            self.event_request(IOCTL_CHANNEL_REGISTER, "CHANNEL_REGISTER", channel, event)?;
        Ok(args.msi_value)
    }

    fn deregister_event(&self, channel: u32, event: BorrowedFd<'_>) -> Result<()> {
        self.event_request(IOCTL_CHANNEL_DEREGISTER, "CHANNEL_DEREGISTER", channel, event)?;
        Ok(())
    }
}

/// Physical memory through `/dev/mem`.
#[derive(Debug)]
pub struct DevMem {
    fd: OwnedFd,
}

impl DevMem {
    /// Open the memory device for synchronous read/write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::SYNC | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|errno| Error::DeviceOpen {
            path: path.to_path_buf(),
            source: errno.into(),
        })?;
        Ok(Self { fd })
    }
}

impl MemoryDevice for DevMem {
    fn map(&self, range: &MemRange) -> Result<Box<dyn MemorySegment>> {
        let mapping = DeviceMapping::new(
            self.fd.as_fd(),
            range.host_phys,
            range.size as usize,
            MemoryType::Device,
        )?;
        Ok(Box::new(mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn ioc(dir: u64, ty: u8, nr: u8, size: u64) -> u64 {
        (dir << 30) | (size << 16) | ((ty as u64) << 8) | nr as u64
    }

    #[test]
    fn test_request_numbers() {
        let ptr = std::mem::size_of::<*const u8>() as u64;
        assert_eq!(IOCTL_GET_SYS_MAP as u64, ioc(1, b'R', 1, ptr));
        assert_eq!(IOCTL_CHANNEL_REGISTER as u64, ioc(3, b'R', 4, ptr));
        assert_eq!(IOCTL_CHANNEL_DEREGISTER as u64, ioc(3, b'R', 5, ptr));
    }

    #[test]
    fn test_event_registration_layout() {
        assert_eq!(std::mem::size_of::<EventRegistration>(), 12);
    }

    #[test]
    fn test_missing_device_reports_path() {
        let err = GulControlDevice::open("/nonexistent/gulipcgul0").unwrap_err();
        assert!(matches!(err, Error::DeviceOpen { ref path, .. } if path.ends_with("gulipcgul0")));

        let err = DevMem::open("/nonexistent/mem").unwrap_err();
        assert!(matches!(err, Error::DeviceOpen { .. }));
    }
}
