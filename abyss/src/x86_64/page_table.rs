//! 4-level page table format of x86_64 and the MMU walk.
//!
//! Every level (PML4, PDPT, PD, PT) is a page holding 512 eight-byte entries.
//! The index for each level is calculated from the virtual address:
//! ```text
//! 63          48 47            39 38            30 29            21 20         12 11         0
//! +-------------+----------------+----------------+----------------+-------------+------------+
//! | Sign Extend |    Page-Map    | Page-Directory | Page-directory |  Page-Table |    Page    |
//! |             | Level-4 Offset |    Pointer     |     Offset     |   Offset    |   Offset   |
//! +-------------+----------------+----------------+----------------+-------------+------------+
//!               |                |                |                |             |            |
//!               +------- 9 ------+------- 9 ------+------- 9 ------+----- 9 -----+---- 12 ----+
//! ```
//! Note that attributes of all levels are **AND**ed.
use crate::addressing::{Pa, Va, PAGE_SHIFT};
use crate::interrupt::{PFERR_PRESENT, PFERR_USER, PFERR_WRITE};
use crate::memory::PhysicalMemory;

/// Number of entries in a table of any level.
pub const ENTRIES_PER_TABLE: usize = 512;
/// Number of levels of the page table.
pub const LEVELS: usize = 4;

bitflags::bitflags! {
    /// Flags for a page table entry of any level.
    pub struct PteFlags: u64 {
        /// Present; must be 1 to map a page or reference a table.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the region controlled by this entry.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the region controlled by this entry.
        const US = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the region controlled by this entry.
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the page referenced by this entry.
        const D = 1 << 6;
        /// Page size; large pages are not supported by this machine and must be 0.
        const PS = 1 << 7;
        /// Global; if CR4.PGE = 1, determines whether the translation is global.
        const G = 1 << 8;
        /// Execute-disable.
        const XD = 1 << 63;
    }
}

/// Page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl Pte {
    /// Mask of the physical address bits of an entry.
    pub const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// An empty entry.
    pub const EMPTY: Self = Self(0);

    /// Get a physical address pointed by this entry.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new((self.0 & Self::ADDRESS_MASK) as usize)
        } else {
            None
        }
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns true if the present bit is set.
    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    /// Make an entry that points `pa` with `flags`.
    ///
    /// Returns `None` if `pa` is not page-aligned.
    #[inline]
    pub fn new(pa: Pa, flags: PteFlags) -> Option<Self> {
        if pa.is_page_aligned() {
            Some(Self(pa.into_usize() as u64 | flags.bits()))
        } else {
            None
        }
    }

    /// Set a permission of this entry.
    ///
    /// The physical address is kept.
    #[inline]
    pub fn set_perm(&mut self, perm: PteFlags) -> &mut Self {
        self.0 = (self.0 & Self::ADDRESS_MASK) | perm.bits();
        self
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Pte({:#x}, {:?})",
            self.0 & Self::ADDRESS_MASK,
            self.flags()
        )
    }
}

/// Index of `va` in the table of `level`.
///
/// Level 3 is the PML4 and level 0 is the page table holding the leaves.
#[inline]
pub const fn index(va: Va, level: usize) -> usize {
    (va.into_usize() >> (PAGE_SHIFT + 9 * level)) & (ENTRIES_PER_TABLE - 1)
}

/// Read the `idx`-th entry of the table at `table`.
#[inline]
pub fn read_entry(mem: &PhysicalMemory, table: Pa, idx: usize) -> Pte {
    debug_assert!(idx < ENTRIES_PER_TABLE);
    Pte(mem.read_u64(table + idx * 8))
}

/// Write the `idx`-th entry of the table at `table`.
#[inline]
pub fn write_entry(mem: &mut PhysicalMemory, table: Pa, idx: usize, pte: Pte) {
    debug_assert!(idx < ENTRIES_PER_TABLE);
    mem.write_u64(table + idx * 8, pte.0)
}

/// Kind of a memory access checked by the MMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Execute,
}

/// Translate `va` through the page table rooted at `cr3`, as the MMU does.
///
/// On failure, returns the page-fault error code: [`PFERR_PRESENT`] when
/// the walk reached a present leaf but the access was not permitted,
/// [`PFERR_WRITE`] for writes and [`PFERR_USER`] for user-mode accesses.
pub fn translate(
    mem: &PhysicalMemory,
    cr3: Pa,
    va: Va,
    access: Access,
    user: bool,
) -> Result<Pa, u64> {
    let mut errcode = 0;
    if access == Access::Write {
        errcode |= PFERR_WRITE;
    }
    if user {
        errcode |= PFERR_USER;
    }

    let mut table = cr3;
    let mut perm = PteFlags::P | PteFlags::RW | PteFlags::US;
    for level in (0..LEVELS).rev() {
        let pte = read_entry(mem, table, index(va, level));
        match pte.pa() {
            Some(pa) if !pte.flags().contains(PteFlags::PS) => {
                perm &= pte.flags();
                table = pa;
            }
            _ => return Err(errcode),
        }
    }

    if (access == Access::Write && !perm.contains(PteFlags::RW))
        || (user && !perm.contains(PteFlags::US))
    {
        return Err(errcode | PFERR_PRESENT);
    }
    Ok(table + va.page_offset())
}
