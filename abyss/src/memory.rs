//! Physical memory of the machine.
//!
//! Every physical address the kernel touches goes through this object.
//! Accessing outside of the installed memory is a machine check and halts.
use crate::addressing::{Pa, PAGE_SIZE};
use alloc::vec;
use alloc::vec::Vec;

/// Byte-addressable physical memory.
pub struct PhysicalMemory {
    bytes: Vec<u8>,
}

impl PhysicalMemory {
    /// Install `size` bytes of physical memory. `size` is rounded down to pages.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size & !(PAGE_SIZE - 1)],
        }
    }

    /// Size of the installed memory in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Number of physical pages.
    #[inline]
    pub fn npages(&self) -> usize {
        self.bytes.len() / PAGE_SIZE
    }

    #[inline]
    fn range(&self, pa: Pa, len: usize) -> core::ops::Range<usize> {
        let start = pa.into_usize();
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => start..end,
            _ => panic!("machine check: physical access {:?}+{:#x} out of range", pa, len),
        }
    }

    /// Borrow `len` bytes starting at `pa`.
    pub fn slice(&self, pa: Pa, len: usize) -> &[u8] {
        let r = self.range(pa, len);
        &self.bytes[r]
    }

    /// Mutably borrow `len` bytes starting at `pa`.
    pub fn slice_mut(&mut self, pa: Pa, len: usize) -> &mut [u8] {
        let r = self.range(pa, len);
        &mut self.bytes[r]
    }

    /// Borrow the page containing `pa`.
    pub fn page(&self, pa: Pa) -> &[u8; PAGE_SIZE] {
        let base = Pa::from_page_number(pa.page_number());
        self.slice(base, PAGE_SIZE).try_into().unwrap()
    }

    /// Mutably borrow the page containing `pa`.
    pub fn page_mut(&mut self, pa: Pa) -> &mut [u8; PAGE_SIZE] {
        let base = Pa::from_page_number(pa.page_number());
        self.slice_mut(base, PAGE_SIZE).try_into().unwrap()
    }

    /// Read a byte.
    pub fn read_u8(&self, pa: Pa) -> u8 {
        self.slice(pa, 1)[0]
    }

    /// Write a byte.
    pub fn write_u8(&mut self, pa: Pa, v: u8) {
        self.slice_mut(pa, 1)[0] = v;
    }

    /// Read a little-endian quad word.
    pub fn read_u64(&self, pa: Pa) -> u64 {
        u64::from_le_bytes(self.slice(pa, 8).try_into().unwrap())
    }

    /// Write a little-endian quad word.
    pub fn write_u64(&mut self, pa: Pa, v: u64) {
        self.slice_mut(pa, 8).copy_from_slice(&v.to_le_bytes());
    }

    /// Fill the page at `pa` with `byte`.
    pub fn fill_page(&mut self, pa: Pa, byte: u8) {
        self.page_mut(pa).fill(byte);
    }

    /// Copy the contents of page `src` to page `dst`.
    pub fn copy_page(&mut self, dst: Pa, src: Pa) {
        let (dst, src) = (dst.page_number() * PAGE_SIZE, src.page_number() * PAGE_SIZE);
        assert!(dst + PAGE_SIZE <= self.bytes.len() && src + PAGE_SIZE <= self.bytes.len());
        self.bytes.copy_within(src..src + PAGE_SIZE, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access() {
        let mut mem = PhysicalMemory::new(4 * PAGE_SIZE + 7);
        assert_eq!(mem.npages(), 4);
        let pa = Pa::new(0x1008).unwrap();
        mem.write_u64(pa, 0xdead_beef_cafe_f00d);
        assert_eq!(mem.read_u64(pa), 0xdead_beef_cafe_f00d);
        assert_eq!(mem.read_u8(pa), 0x0d);
        mem.fill_page(Pa::new(0x2000).unwrap(), 0xcc);
        mem.copy_page(Pa::new(0x3000).unwrap(), Pa::new(0x1000).unwrap());
        assert_eq!(mem.read_u64(Pa::new(0x3008).unwrap()), 0xdead_beef_cafe_f00d);
        assert!(mem.page(Pa::new(0x2abc).unwrap()).iter().all(|b| *b == 0xcc));
    }

    #[test]
    #[should_panic(expected = "machine check")]
    fn out_of_range() {
        let mem = PhysicalMemory::new(PAGE_SIZE);
        mem.read_u64(Pa::new(PAGE_SIZE - 4).unwrap());
    }
}
