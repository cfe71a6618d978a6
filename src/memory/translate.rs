//! Address translation between the host and modem address spaces.
//!
//! Three address spaces meet at the link:
//!
//! ```text
//!   host virtual ──(- dma.host_virt + dma.host_phys)──> host physical
//!        │
//!        └──────(- dma.host_virt + dma.modem_phys)──> modem physical
//!
//!   data-region offset ──(+ data.host_virt)──> host virtual
//! ```
//!
//! 64-bit host virtual addresses travel in shared structures as two 32-bit
//! halves ([`VirtAddr::to_wire`] / [`VirtAddr::from_wire`]).
//!
//! [`Translator`] is also the only place that reads or writes DMA memory:
//! every access is bounds checked against the DMA region first.

use super::{DmaRegion, MemorySegment};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Split a 64-bit value into `(high, low)` 32-bit halves.
#[inline]
pub const fn split64(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Join `(high, low)` 32-bit halves into a 64-bit value.
#[inline]
pub const fn join64(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// A host virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wrap a raw address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Address of a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    /// The raw address.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Wire form: `(host_virt_h, host_virt_l)`.
    #[inline]
    pub const fn to_wire(self) -> (u32, u32) {
        split64(self.0)
    }

    /// Rebuild from the wire halves.
    #[inline]
    pub const fn from_wire(hi: u32, lo: u32) -> Self {
        Self(join64(hi, lo))
    }

    /// Address `bytes` further on, or `None` on overflow.
    #[inline]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Converts addresses for one instance and guards access to DMA memory.
pub struct Translator {
    /// Keeps the DMA memory mapped while addresses into it are handed out.
    dma: Arc<dyn MemorySegment>,
    dma_base: u64,
    dma_len: u64,
    dma_host_phys: u64,
    dma_modem_phys: u32,
    data_base: u64,
}

impl Translator {
    /// Build a translator for a DMA region whose modem-side base is
    /// `dma_modem_phys`, and a data region mapped at `data_base`.
    pub fn new(dma: &DmaRegion, dma_modem_phys: u32, data_base: VirtAddr) -> Self {
        Self {
            dma: Arc::clone(dma.segment()),
            dma_base: dma.host_virt().get(),
            dma_len: dma.len() as u64,
            dma_host_phys: dma.host_phys(),
            dma_modem_phys,
            data_base: data_base.get(),
        }
    }

    /// Host virtual base of the DMA region.
    pub fn dma_base(&self) -> VirtAddr {
        VirtAddr(self.dma_base)
    }

    /// Size of the DMA region in bytes.
    pub fn dma_len(&self) -> u64 {
        self.dma_len
    }

    /// Is `va` inside the DMA region?
    #[inline]
    pub fn in_dma_region(&self, va: VirtAddr) -> bool {
        va.0 >= self.dma_base && va.0 - self.dma_base < self.dma_len
    }

    /// Is `[va, va + len)` inside the DMA region?
    #[inline]
    pub fn contains(&self, va: VirtAddr, len: usize) -> bool {
        if !self.in_dma_region(va) {
            return false;
        }
        let offset = va.0 - self.dma_base;
        offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.dma_len)
    }

    fn dma_offset(&self, va: VirtAddr) -> Result<u64> {
        if !self.in_dma_region(va) {
            return Err(Error::InputInvalid(format!(
                "address {va} outside DMA region {:#x}+{:#x}",
                self.dma_base, self.dma_len
            )));
        }
        Ok(va.0 - self.dma_base)
    }

    /// Modem physical address of a DMA buffer.
    pub fn host_virtual_to_coprocessor_physical(&self, va: VirtAddr) -> Result<u32> {
        let offset = self.dma_offset(va)?;
        u32::try_from(offset)
            .ok()
            .and_then(|off| self.dma_modem_phys.checked_add(off))
            .ok_or_else(|| Error::InputInvalid(format!("address {va} beyond 32-bit modem window")))
    }

    /// Host physical address of a DMA buffer.
    pub fn host_virtual_to_host_physical(&self, va: VirtAddr) -> Result<u64> {
        Ok(self.dma_host_phys + self.dma_offset(va)?)
    }

    /// Offset of a DMA buffer from the start of the region.
    pub fn host_virtual_to_dma_offset(&self, va: VirtAddr) -> Result<u32> {
        let offset = self.dma_offset(va)?;
        u32::try_from(offset)
            .map_err(|_| Error::InputInvalid(format!("DMA offset {offset:#x} exceeds 32 bits")))
    }

    /// Host virtual address of a DMA-region offset.
    pub fn dma_offset_to_host_virtual(&self, offset: u32) -> Result<VirtAddr> {
        if u64::from(offset) >= self.dma_len {
            return Err(Error::InputInvalid(format!(
                "DMA offset {offset:#x} outside region of {:#x} bytes",
                self.dma_len
            )));
        }
        Ok(VirtAddr(self.dma_base + u64::from(offset)))
    }

    /// Host virtual address of a modem physical address inside the DMA region.
    pub fn coprocessor_physical_to_host_virtual(&self, phys: u32) -> Result<VirtAddr> {
        let offset = phys
            .checked_sub(self.dma_modem_phys)
            .ok_or_else(|| Error::InputInvalid(format!("modem address {phys:#x} below DMA window")))?;
        self.dma_offset_to_host_virtual(offset)
    }

    /// Host virtual address of an offset into the modem data region.
    #[inline]
    pub fn coprocessor_offset_to_host_virtual(&self, offset: u32) -> VirtAddr {
        VirtAddr(self.data_base + u64::from(offset))
    }

    fn check(&self, va: VirtAddr, len: usize) -> Result<()> {
        if self.contains(va, len) {
            Ok(())
        } else {
            Err(Error::InputInvalid(format!(
                "range {va}+{len:#x} outside DMA region {:#x}+{:#x}",
                self.dma_base, self.dma_len
            )))
        }
    }

    /// Copy `src` into DMA memory at `va`.
    pub fn write(&self, va: VirtAddr, src: &[u8]) -> Result<()> {
        self.check(va, src.len())?;
        // SAFETY: the range lies inside the DMA segment, which `self.dma`
        // keeps mapped. The ring protocol gives the caller exclusive use of
        // the buffer until it publishes it.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), va.0 as *mut u8, src.len());
        }
        Ok(())
    }

    /// Copy `dst.len()` bytes of DMA memory at `va` into `dst`.
    pub fn read(&self, va: VirtAddr, dst: &mut [u8]) -> Result<()> {
        self.check(va, dst.len())?;
        // SAFETY: as in `write`; the peer published this buffer and does not
        // touch it until the consumer index moves past it.
        unsafe {
            std::ptr::copy_nonoverlapping(va.0 as *const u8, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Borrow `len` bytes of DMA memory at `va`.
    ///
    /// The view is only stable while the buffer is owned by the host (a
    /// received slot that is not yet marked consumed, or a buffer not yet
    /// returned with `put_buf`).
    pub fn bytes(&self, va: VirtAddr, len: usize) -> Result<&[u8]> {
        self.check(va, len)?;
        // SAFETY: range checked above; lifetime tied to `self`, which owns an
        // Arc of the mapping.
        Ok(unsafe { std::slice::from_raw_parts(va.0 as *const u8, len) })
    }
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("dma_base", &format_args!("{:#x}", self.dma_base))
            .field("dma_len", &format_args!("{:#x}", self.dma_len))
            .field("dma_host_phys", &format_args!("{:#x}", self.dma_host_phys))
            .field("dma_modem_phys", &format_args!("{:#x}", self.dma_modem_phys))
            .field("data_base", &format_args!("{:#x}", self.data_base))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemorySegment;

    const HOST_PHYS: u64 = 0x8_0000_0000;
    const MODEM_PHYS: u32 = 0xC000_0000;

    fn translator(size: usize) -> (Translator, VirtAddr) {
        let segment = SharedMemorySegment::new("test-translate", size).unwrap();
        let dma = DmaRegion::from_segment(segment, HOST_PHYS).unwrap();
        let base = dma.host_virt();
        (Translator::new(&dma, MODEM_PHYS, VirtAddr::new(0x1000)), base)
    }

    #[test]
    fn test_split_join_lossless() {
        for value in [0, 1, u32::MAX as u64, 1 << 32, 0x7fff_dead_beef_0001, u64::MAX] {
            let (hi, lo) = split64(value);
            assert_eq!(join64(hi, lo), value);
            assert_eq!(VirtAddr::from_wire(hi, lo), VirtAddr::new(value));
        }
        assert_eq!(split64(0x1234_5678_9abc_def0), (0x1234_5678, 0x9abc_def0));
    }

    #[test]
    fn test_physical_translations() {
        let (t, base) = translator(8192);
        let va = base.checked_add(0x100).unwrap();

        assert_eq!(t.host_virtual_to_coprocessor_physical(va).unwrap(), MODEM_PHYS + 0x100);
        assert_eq!(t.host_virtual_to_host_physical(va).unwrap(), HOST_PHYS + 0x100);
        assert_eq!(t.host_virtual_to_dma_offset(va).unwrap(), 0x100);
        assert_eq!(t.dma_offset_to_host_virtual(0x100).unwrap(), va);
        assert_eq!(t.coprocessor_physical_to_host_virtual(MODEM_PHYS + 0x100).unwrap(), va);
        assert_eq!(t.coprocessor_offset_to_host_virtual(0x20), VirtAddr::new(0x1020));
    }

    #[test]
    fn test_out_of_region_rejected() {
        let (t, base) = translator(4096);
        let end = base.checked_add(4096).unwrap();

        assert!(t.in_dma_region(base));
        assert!(!t.in_dma_region(end));
        assert!(!t.in_dma_region(VirtAddr::new(base.get() - 1)));
        assert!(matches!(
            t.host_virtual_to_coprocessor_physical(end),
            Err(Error::InputInvalid(_))
        ));
        assert!(t.dma_offset_to_host_virtual(4096).is_err());
        assert!(t.coprocessor_physical_to_host_virtual(MODEM_PHYS - 1).is_err());
    }

    #[test]
    fn test_range_checks_cover_length() {
        let (t, base) = translator(4096);
        let near_end = base.checked_add(4000).unwrap();

        assert!(t.contains(near_end, 96));
        assert!(!t.contains(near_end, 97));
        assert!(t.write(near_end, &[0u8; 97]).is_err());
    }

    #[test]
    fn test_read_write_roundtrip() {
        let (t, base) = translator(4096);
        let va = base.checked_add(64).unwrap();

        t.write(va, b"modem").unwrap();
        let mut out = [0u8; 5];
        t.read(va, &mut out).unwrap();
        assert_eq!(&out, b"modem");
        assert_eq!(t.bytes(va, 5).unwrap(), b"modem");
    }
}
