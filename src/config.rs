//! Protocol constants and instance configuration.
//!
//! The constants fix the shape of the shared metadata block and must match
//! the modem firmware build. [`IpcConfig`] carries the host-side knobs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use modem_ipc::config::IpcConfig;
//!
//! let config = IpcConfig::default()
//!     .with_instance_id(0)
//!     .with_strict_metadata_size(true);
//! ```

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Shared layout dimensions
// =============================================================================

/// Number of channels per IPC instance.
pub const CHANNELS_MAX: u32 = 64;

/// Maximum ring depth (slots per ring).
pub const MAX_DEPTH: u32 = 16;

/// Number of IPC instances described by the metadata block.
pub const MAX_INSTANCES: u32 = 2;

/// Number of 32-bit words in the channel configuration bitmask.
pub const CFGMASK_WORDS: usize = (CHANNELS_MAX as usize).div_ceil(32);

// =============================================================================
// Buffer size classes (bytes)
// =============================================================================

/// Small message buffers.
pub const SIZE_2K: u32 = 2 * 1024;

/// Large message buffers.
pub const SIZE_16K: u32 = 16 * 1024;

/// Pointer-channel transport blocks.
pub const SIZE_128K: u32 = 128 * 1024;

// =============================================================================
// Default pool element counts
// =============================================================================

/// Default number of 2K message buffers.
pub const POOL_2K_COUNT: usize = 256;

/// Default number of 16K message buffers.
pub const POOL_16K_COUNT: usize = 64;

/// Default number of 128K pointer-channel buffers.
pub const POOL_128K_COUNT: usize = 64;

/// Default number of shared-descriptor buffers.
pub const POOL_SH_BUF_COUNT: usize = 256;

// =============================================================================
// Devices
// =============================================================================

/// Default control device node exposed by the IPC driver.
pub const DEFAULT_CONTROL_DEVICE: &str = "/dev/gulipcgul0";

/// Default physical memory device.
pub const DEFAULT_MEMORY_DEVICE: &str = "/dev/mem";

/// Version written by the modem into the host interface block.
pub const HIF_VERSION: u32 = 1;

/// Configuration for an IPC [`Instance`](crate::instance::Instance).
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Which instance of the metadata block this host drives.
    pub instance_id: u32,
    /// Control device node.
    pub control_device: PathBuf,
    /// Physical memory device node.
    pub memory_device: PathBuf,
    /// Fail initialisation when the modem's metadata size differs from ours.
    ///
    /// When false the mismatch is counted and logged only.
    pub strict_metadata_size: bool,
    /// Sleep between retries in spin waits (modem ready, blocking receive).
    pub poll_interval: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            instance_id: 0,
            control_device: PathBuf::from(DEFAULT_CONTROL_DEVICE),
            memory_device: PathBuf::from(DEFAULT_MEMORY_DEVICE),
            strict_metadata_size: false,
            poll_interval: Duration::from_micros(50),
        }
    }
}

impl IpcConfig {
    /// Set the instance id.
    pub fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Set the control device path.
    pub fn with_control_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_device = path.into();
        self
    }

    /// Set the memory device path.
    pub fn with_memory_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.memory_device = path.into();
        self
    }

    /// Treat a metadata size mismatch as fatal.
    pub fn with_strict_metadata_size(mut self, strict: bool) -> Self {
        self.strict_metadata_size = strict;
        self
    }

    /// Set the spin-wait poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfgmask_covers_all_channels() {
        assert!(CFGMASK_WORDS * 32 >= CHANNELS_MAX as usize);
    }

    #[test]
    fn test_builder() {
        let config = IpcConfig::default()
            .with_instance_id(1)
            .with_control_device("/dev/null")
            .with_strict_metadata_size(true);
        assert_eq!(config.instance_id, 1);
        assert_eq!(config.control_device, PathBuf::from("/dev/null"));
        assert_eq!(config.memory_device, PathBuf::from(DEFAULT_MEMORY_DEVICE));
        assert!(config.strict_metadata_size);
    }
}
