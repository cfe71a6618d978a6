//! Memory regions, address translation and buffer pools.
//!
//! Everything the host shares with the modem lives in one of three mapped
//! regions (control, data, DMA). This module owns those mappings and is, with
//! the pools, the only place that turns addresses into references.
//!
//! - [`MemorySegment`]: a mapped, contiguous range of memory
//! - [`SharedMemorySegment`]: memfd-backed segment (loopback bus, tests)
//! - [`DeviceMapping`]: physical range mapped through a device node
//! - [`RegionMap`]: the control and data regions plus the [`Translator`]
//! - [`BufferPools`]: fixed-size element pools carved out of the DMA region

mod mapped;
mod pool;
mod region;
mod segment;
mod shared;
mod translate;

pub use mapped::DeviceMapping;
pub use pool::{BufferPool, BufferPools, PoolClass, PoolLayout, SlabPool};
pub use region::{DmaRegion, MappedRegion, MemRange, RegionMap, SharedLayout, SystemMap};
pub use segment::{MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
pub use translate::{Translator, VirtAddr, join64, split64};
