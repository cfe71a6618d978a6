//! # modem-ipc
//!
//! Host-side inter-processor communication with a PCIe-attached modem
//! co-processor over shared memory.
//!
//! The host and the modem share three memory regions: a small control
//! region (host interface block), the modem's data region holding the IPC
//! metadata (one ring set per channel), and a DMA-capable region backing the
//! buffer pools. Nothing coordinates the two sides except the documented
//! layout in [`layout`] and the producer/consumer counter discipline in
//! [`ring`].
//!
//! ## Features
//!
//! - **Message channels**: payloads are copied into pre-placed slot buffers
//! - **Pointer channels**: ownership of large buffers is exchanged by
//!   descriptor, with a free-list ring to hand them back (zero copy)
//! - **Hybrid receive**: busy polling or eventfd wake-ups per channel
//! - **Loopback**: [`sim`] runs the whole protocol against memfd-backed
//!   regions with a simulated modem, no hardware required
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use modem_ipc::prelude::*;
//!
//! let dma = DmaRegion::new(hugepage_segment, hugepage_phys)?;
//! let pools = BufferPools::carve(&dma, &PoolLayout::default())?;
//! let ipc = Instance::init(&IpcConfig::default(), pools, dma)?;
//!
//! ipc.configure_channel(4, 4, ChannelKind::Message, SIZE_2K, false)?;
//! ipc.send(4, b"hello modem")?;
//!
//! let mut buf = [0u8; SIZE_2K as usize];
//! match ipc.recv(5, &mut buf) {
//!     Ok(len) => println!("got {len} bytes"),
//!     Err(Error::ChannelEmpty(_)) => {} // poll again later
//!     Err(e) => return Err(e),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod observability;
pub mod receive;
pub mod ring;
pub mod role;
pub mod sim;
pub mod stats;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::channel::{ChannelKind, PendingMessage, RingKind, SharedBuffer};
    pub use crate::config::{CHANNELS_MAX, IpcConfig, MAX_DEPTH, SIZE_2K, SIZE_16K, SIZE_128K};
    pub use crate::error::{Error, Result};
    pub use crate::instance::Instance;
    pub use crate::memory::{
        BufferPool, BufferPools, DmaRegion, PoolClass, PoolLayout, VirtAddr,
    };
    pub use crate::receive::ChannelPoller;
    pub use crate::role::{Operation, Role, Side};
}

pub use error::{Error, Result};
