//! Memory abstraction.
//!
//! Physical addresses index the simulated physical memory of the machine
//! ([`PhysicalMemory`]). Virtual addresses are translated to physical
//! addresses through the 4-level page table rooted at `cr3`.
//!
//! [`PhysicalMemory`]: crate::memory::PhysicalMemory

/// Page size.
pub const PAGE_SIZE: usize = 0x1000;
/// Shift amount to get page index.
pub const PAGE_SHIFT: usize = 12;
/// Mask for page offset.
pub const PAGE_MASK: usize = 0xfff;

/// Physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// PA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new physical address with a check.
    ///
    /// Physical addresses are limited to the 52 bits a page table entry can hold.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << 52) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Physical page number of this address.
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// The first address of the physical page number `pn`.
    #[inline]
    pub const fn from_page_number(pn: usize) -> Self {
        Self(pn << PAGE_SHIFT)
    }

    /// Returns true if this address is the start of a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

/// Virtual address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// VA with address 0.
    pub const ZERO: Self = Self(0);

    /// Create a new virtual address with a check.
    ///
    /// The address must be canonical: bits 63..47 are all zero or all one.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns true if this address is the start of a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Round down to the start of the page.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

/// Align upwards. Returns the smallest x with alignment `align`
/// so that x >= addr. The alignment must be a power of 2.
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Align downwards. Returns the greatest x with alignment `align`
/// so that x <= addr. The alignment must be a power of 2.
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}
