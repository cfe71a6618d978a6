//! Statistics counters shared with the modem.
//!
//! The host interface block carries two [`StatsBlock`]s, one written by each
//! side. Counters are 32-bit and wrap; readers take [`ChannelCounters`] /
//! [`GlobalCounters`] snapshots.

use crate::config::CHANNELS_MAX;
use crate::error::Error;
use crate::memory::SharedLayout;
use std::sync::atomic::{AtomicU32, Ordering};

/// Error categories with a dedicated counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Instance not initialised or out of range.
    InstanceInvalid,
    /// Metadata size reported by the modem differs from ours.
    MetadataSizeMismatch,
    /// Channel id beyond `CHANNELS_MAX`.
    ChannelOutOfRange,
    /// Bad payload, length or address.
    InputInvalid,
    /// Unconfigured channel or wrong discipline.
    ChannelInvalid,
    /// Shared structure does not resolve.
    MemoryInvalid,
    /// Ring full on send.
    ChannelFull,
    /// Ring empty on receive.
    ChannelEmpty,
    /// Free-list ring full on return.
    BufferListFull,
    /// Free-list ring empty on take (modem side).
    BufferListEmpty,
    /// Pool exhausted while stocking rings.
    HostBufferAllocFail,
    /// Driver request failed.
    IoctlFail,
    /// Event creation or registration failed.
    EventRegistration,
}

impl ErrorCategory {
    /// Counter category of an error, if it has one.
    pub fn of(err: &Error) -> Option<Self> {
        Some(match err {
            Error::InstanceInvalid(_) => Self::InstanceInvalid,
            Error::ChannelInvalid(_) => Self::ChannelInvalid,
            Error::ChannelFull(_) => Self::ChannelFull,
            Error::ChannelEmpty(_) => Self::ChannelEmpty,
            Error::BufferListFull(_) => Self::BufferListFull,
            Error::InputInvalid(_) => Self::InputInvalid,
            Error::MemoryInvalid(_) => Self::MemoryInvalid,
            Error::HostBufferAllocFail(_) => Self::HostBufferAllocFail,
            Error::EventFailure(_) => Self::EventRegistration,
            Error::Ioctl { .. } | Error::DeviceOpen { .. } => Self::IoctlFail,
            Error::NotImplemented(_)
            | Error::Map(_)
            | Error::Io(_)
            | Error::System(_) => return None,
        })
    }

    /// Label used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstanceInvalid => "instance_invalid",
            Self::MetadataSizeMismatch => "md_size_mismatch",
            Self::ChannelOutOfRange => "channel_out_of_range",
            Self::InputInvalid => "input_invalid",
            Self::ChannelInvalid => "channel_invalid",
            Self::MemoryInvalid => "mem_invalid",
            Self::ChannelFull => "channel_full",
            Self::ChannelEmpty => "channel_empty",
            Self::BufferListFull => "buf_list_full",
            Self::BufferListEmpty => "buf_list_empty",
            Self::HostBufferAllocFail => "host_buf_alloc_fail",
            Self::IoctlFail => "ioctl_fail",
            Self::EventRegistration => "efd_reg_fail",
        }
    }
}

/// Per-channel counters in shared memory.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent: AtomicU32,
    received: AtomicU32,
    bytes_sent: AtomicU32,
    bytes_received: AtomicU32,
    err_input_invalid: AtomicU32,
    err_channel_invalid: AtomicU32,
    err_mem_invalid: AtomicU32,
    err_channel_full: AtomicU32,
    err_channel_empty: AtomicU32,
    err_buf_list_full: AtomicU32,
    err_buf_list_empty: AtomicU32,
    err_host_buf_alloc_fail: AtomicU32,
    err_ioctl_fail: AtomicU32,
    err_efd_reg_fail: AtomicU32,
}

/// Snapshot of one channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChannelCounters {
    pub sent: u32,
    pub received: u32,
    pub bytes_sent: u32,
    pub bytes_received: u32,
    pub err_input_invalid: u32,
    pub err_channel_invalid: u32,
    pub err_mem_invalid: u32,
    pub err_channel_full: u32,
    pub err_channel_empty: u32,
    pub err_buf_list_full: u32,
    pub err_buf_list_empty: u32,
    pub err_host_buf_alloc_fail: u32,
    pub err_ioctl_fail: u32,
    pub err_efd_reg_fail: u32,
}

fn bump(counter: &AtomicU32, by: u32) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ChannelStats {
    /// Count one sent message of `bytes`.
    pub fn record_sent(&self, bytes: u32) {
        bump(&self.sent, 1);
        bump(&self.bytes_sent, bytes);
    }

    /// Count one received message of `bytes`.
    pub fn record_received(&self, bytes: u32) {
        bump(&self.received, 1);
        bump(&self.bytes_received, bytes);
    }

    /// Count one error. Categories without a per-channel counter are ignored.
    pub fn record_error(&self, category: ErrorCategory) {
        let counter = match category {
            ErrorCategory::InputInvalid => &self.err_input_invalid,
            ErrorCategory::ChannelInvalid => &self.err_channel_invalid,
            ErrorCategory::MemoryInvalid => &self.err_mem_invalid,
            ErrorCategory::ChannelFull => &self.err_channel_full,
            ErrorCategory::ChannelEmpty => &self.err_channel_empty,
            ErrorCategory::BufferListFull => &self.err_buf_list_full,
            ErrorCategory::BufferListEmpty => &self.err_buf_list_empty,
            ErrorCategory::HostBufferAllocFail => &self.err_host_buf_alloc_fail,
            ErrorCategory::IoctlFail => &self.err_ioctl_fail,
            ErrorCategory::EventRegistration => &self.err_efd_reg_fail,
            ErrorCategory::InstanceInvalid
            | ErrorCategory::MetadataSizeMismatch
            | ErrorCategory::ChannelOutOfRange => return,
        };
        bump(counter, 1);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> ChannelCounters {
        let load = |c: &AtomicU32| c.load(Ordering::Relaxed);
        ChannelCounters {
            sent: load(&self.sent),
            received: load(&self.received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            err_input_invalid: load(&self.err_input_invalid),
            err_channel_invalid: load(&self.err_channel_invalid),
            err_mem_invalid: load(&self.err_mem_invalid),
            err_channel_full: load(&self.err_channel_full),
            err_channel_empty: load(&self.err_channel_empty),
            err_buf_list_full: load(&self.err_buf_list_full),
            err_buf_list_empty: load(&self.err_buf_list_empty),
            err_host_buf_alloc_fail: load(&self.err_host_buf_alloc_fail),
            err_ioctl_fail: load(&self.err_ioctl_fail),
            err_efd_reg_fail: load(&self.err_efd_reg_fail),
        }
    }
}

/// Instance-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalCounters {
    /// Operations on an uninitialised instance.
    pub err_instance_invalid: u32,
    /// Metadata size mismatches seen at initialisation.
    pub err_md_sz_mismatch: u32,
    /// Channel ids beyond `CHANNELS_MAX`.
    pub err_channel_out_of_range: u32,
}

/// One side's statistics block.
#[repr(C)]
#[derive(Debug)]
pub struct StatsBlock {
    err_instance_invalid: AtomicU32,
    err_md_sz_mismatch: AtomicU32,
    err_channel_out_of_range: AtomicU32,
    channels: [ChannelStats; CHANNELS_MAX as usize],
}

// SAFETY: repr(C), only atomics.
unsafe impl SharedLayout for StatsBlock {}

impl StatsBlock {
    /// Counters of channel `id`.
    pub fn channel(&self, id: u32) -> Option<&ChannelStats> {
        self.channels.get(id as usize)
    }

    /// Count an error that is not tied to a configured channel.
    pub fn record_global(&self, category: ErrorCategory) {
        let counter = match category {
            ErrorCategory::InstanceInvalid => &self.err_instance_invalid,
            ErrorCategory::MetadataSizeMismatch => &self.err_md_sz_mismatch,
            ErrorCategory::ChannelOutOfRange => &self.err_channel_out_of_range,
            _ => return,
        };
        bump(counter, 1);
    }

    /// Read the global counters.
    pub fn global(&self) -> GlobalCounters {
        GlobalCounters {
            err_instance_invalid: self.err_instance_invalid.load(Ordering::Relaxed),
            err_md_sz_mismatch: self.err_md_sz_mismatch.load(Ordering::Relaxed),
            err_channel_out_of_range: self.err_channel_out_of_range.load(Ordering::Relaxed),
        }
    }
}
