//! Error types for modem-ipc.

use crate::role::Operation;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using modem-ipc's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for IPC operations.
///
/// Ring-state conditions ([`Error::ChannelFull`], [`Error::ChannelEmpty`],
/// [`Error::BufferListFull`]) are ordinary, retryable outcomes of the
/// non-blocking API; see [`Error::is_retryable`].
#[derive(Error, Debug)]
pub enum Error {
    /// The instance was never initialised by the modem, or the id is out of range.
    #[error("IPC instance invalid: {0}")]
    InstanceInvalid(String),

    /// Channel id out of range, not configured, or of the wrong discipline.
    #[error("channel invalid: {0}")]
    ChannelInvalid(String),

    /// The channel's ring has no free slot.
    #[error("channel {0} is full")]
    ChannelFull(u32),

    /// The channel's ring holds no message.
    #[error("channel {0} is empty")]
    ChannelEmpty(u32),

    /// The pointer channel's free-buffer list has no room for another buffer.
    #[error("buffer list of channel {0} is full")]
    BufferListFull(u32),

    /// Empty or oversized payload, or an address outside the DMA region.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// A shared structure or slot address does not resolve to mapped memory.
    #[error("invalid memory: {0}")]
    MemoryInvalid(String),

    /// A buffer pool could not supply ring buffers during configuration.
    #[error("host buffer allocation failed: {0}")]
    HostBufferAllocFail(String),

    /// The operation exists in the protocol but not on this side of the link.
    #[error("{0:?} is not implemented on this side")]
    NotImplemented(Operation),

    /// Creating or registering a channel event failed.
    #[error("event notification failure: {0}")]
    EventFailure(String),

    /// A device node could not be opened.
    #[error("cannot open {path}: {source}")]
    DeviceOpen {
        /// Device node path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A control request to the driver failed.
    #[error("{request} failed: {source}")]
    Ioctl {
        /// Name of the request.
        request: &'static str,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Mapping a memory region failed.
    #[error("memory map failed: {0}")]
    Map(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether the condition is expected to clear on its own (poll or back off).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ChannelFull(_) | Error::ChannelEmpty(_) | Error::BufferListFull(_)
        )
    }
}
