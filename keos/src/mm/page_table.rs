//! 4-level page table of x86_64.
//!
//! A [`PageTable`] owns its root table page. Every present leaf entry owns one
//! counted reference ([`Page`]) to the page it maps, and every present
//! intermediate entry owns the table page it points to. Dropping a mapping
//! therefore always hands a [`Page`] back to the caller, and [`PageTable::destroy`]
//! releases every reference the table holds.
//!
//! [`VmIter`] is a cursor over a page table. It reads the mapping of the
//! current virtual address, installs or removes it, and advances one page at a
//! time.
//!
//! Note that attributes of all levels are **AND**ed. Intermediate entries are
//! always present, writable and user-accessible; the leaf decides.
use super::{Page, PhysicalAllocator};
use crate::addressing::{Pa, Va, PAGE_SIZE};
use abyss::x86_64::page_table::{index, read_entry, write_entry, Pte, PteFlags, LEVELS};
use alloc::vec::Vec;
use core::ops::Range;

/// A list specifying categories of page table operation error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageTableMappingError {
    /// Unaligned address
    Unaligned,
    /// Not exist
    NotExist,
    /// Duplicated mapping
    Duplicated,
    /// No memory left for a page table page
    OutOfMemory,
    /// Mapping of the null page
    InvalidAddress,
}

bitflags::bitflags! {
    /// Possible memory permissions for the page.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Permission of a user data page.
    pub const USER_RW: Self = Self::from_bits_truncate(
        Self::READ.bits() | Self::WRITE.bits() | Self::USER.bits(),
    );
    /// Permission of a kernel page.
    pub const KERNEL: Self = Self::from_bits_truncate(
        Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTABLE.bits(),
    );

    /// Encode into entry flags.
    pub fn into_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Self::WRITE) {
            flags |= PteFlags::RW;
        }
        if self.contains(Self::USER) {
            flags |= PteFlags::US;
        }
        if !self.contains(Self::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        flags
    }

    /// Decode from entry flags. A non-present entry has no permission.
    pub fn from_pte_flags(flags: PteFlags) -> Self {
        if !flags.contains(PteFlags::P) {
            return Self::empty();
        }
        let mut perm = Self::READ;
        if flags.contains(PteFlags::RW) {
            perm |= Self::WRITE;
        }
        if flags.contains(PteFlags::US) {
            perm |= Self::USER;
        }
        if !flags.contains(PteFlags::XD) {
            perm |= Self::EXECUTABLE;
        }
        perm
    }
}

const TABLE_FLAGS: PteFlags =
    PteFlags::from_bits_truncate(PteFlags::P.bits() | PteFlags::RW.bits() | PteFlags::US.bits());

// Pages handed out by the allocator are always aligned.
fn entry(pa: Pa, flags: PteFlags) -> Pte {
    debug_assert!(pa.is_page_aligned());
    Pte(pa.into_usize() as u64 | flags.bits())
}

/// Page table of an address space.
#[derive(Debug)]
pub struct PageTable {
    root: Page,
}

impl PageTable {
    /// Allocate an empty page table.
    pub fn new(mm: &mut PhysicalAllocator) -> Option<Self> {
        mm.alloc_zeroed().map(|root| Self { root })
    }

    /// Physical address of the root table, as loaded in `cr3`.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.root.pa()
    }

    /// Create a cursor at `va`.
    pub fn iter<'a>(&'a mut self, mm: &'a mut PhysicalAllocator, va: Va) -> VmIter<'a> {
        VmIter {
            root: self.root.pa(),
            mm,
            va,
            _table: core::marker::PhantomData,
        }
    }

    /// Map `page` at `va` with `perm`.
    ///
    /// Fails with [`PageTableMappingError::Duplicated`] if `va` is already
    /// mapped. On failure the reference held by `page` is released.
    pub fn map(
        &mut self,
        mm: &mut PhysicalAllocator,
        va: Va,
        page: Page,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() {
            mm.release(page);
            return Err(PageTableMappingError::Unaligned);
        }
        if self.walk(mm, va).is_ok() {
            mm.release(page);
            return Err(PageTableMappingError::Duplicated);
        }
        self.iter(mm, va).try_map(page, perm).map(|_| ())
    }

    /// Map `page` at `va` with `perm`, returning the page previously mapped there.
    pub fn replace(
        &mut self,
        mm: &mut PhysicalAllocator,
        va: Va,
        page: Page,
        perm: Permission,
    ) -> Result<Option<Page>, PageTableMappingError> {
        self.iter(mm, va).try_map(page, perm)
    }

    /// Remove the mapping of `va`, returning the page it mapped.
    pub fn unmap(&mut self, mm: &mut PhysicalAllocator, va: Va) -> Result<Page, PageTableMappingError> {
        self.iter(mm, va).unmap()
    }

    /// Find the leaf entry mapping `va`.
    pub fn walk(&self, mm: &PhysicalAllocator, va: Va) -> Result<Pte, PageTableMappingError> {
        let mut table = self.root.pa();
        for level in (1..LEVELS).rev() {
            let pte = read_entry(mm.memory(), table, index(va, level));
            table = pte.pa().ok_or(PageTableMappingError::NotExist)?;
        }
        let pte = read_entry(mm.memory(), table, index(va, 0));
        if pte.is_present() {
            Ok(pte)
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    /// Copy `data` into the address space at `va`, as the kernel sees it.
    pub fn write_bytes(
        &self,
        mm: &mut PhysicalAllocator,
        va: Va,
        data: &[u8],
    ) -> Result<(), PageTableMappingError> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done;
            let pa = self.walk(mm, at.page_down())?.pa().ok_or(PageTableMappingError::NotExist)?;
            let len = (PAGE_SIZE - at.page_offset()).min(data.len() - done);
            mm.memory_mut()
                .slice_mut(pa + at.page_offset(), len)
                .copy_from_slice(&data[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Copy bytes of the address space at `va` into `buf`, as the kernel sees it.
    pub fn read_bytes(
        &self,
        mm: &PhysicalAllocator,
        va: Va,
        buf: &mut [u8],
    ) -> Result<(), PageTableMappingError> {
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let pa = self.walk(mm, at.page_down())?.pa().ok_or(PageTableMappingError::NotExist)?;
            let len = (PAGE_SIZE - at.page_offset()).min(buf.len() - done);
            buf[done..done + len].copy_from_slice(mm.memory().slice(pa + at.page_offset(), len));
            done += len;
        }
        Ok(())
    }

    /// Every present leaf in `range`, in ascending order of virtual address.
    pub fn mappings(&self, mm: &PhysicalAllocator, range: Range<usize>) -> Vec<(Va, Pte)> {
        fn visit(
            mm: &PhysicalAllocator,
            table: Pa,
            level: usize,
            base: usize,
            range: &Range<usize>,
            out: &mut Vec<(Va, Pte)>,
        ) {
            let span = PAGE_SIZE << (9 * level);
            for idx in 0..512 {
                let start = base + idx * span;
                if start >= range.end || start + span <= range.start {
                    continue;
                }
                let pte = read_entry(mm.memory(), table, idx);
                match (pte.pa(), level) {
                    (Some(_), 0) => {
                        if let Some(va) = Va::new(start) {
                            out.push((va, pte));
                        }
                    }
                    (Some(next), _) => visit(mm, next, level - 1, start, range, out),
                    (None, _) => (),
                }
            }
        }
        let mut out = Vec::new();
        visit(mm, self.root.pa(), LEVELS - 1, 0, &range, &mut out);
        out
    }

    /// Physical addresses of every table page, the root included.
    pub fn table_pages(&self, mm: &PhysicalAllocator) -> Vec<Pa> {
        fn visit(mm: &PhysicalAllocator, table: Pa, level: usize, out: &mut Vec<Pa>) {
            out.push(table);
            if level == 0 {
                return;
            }
            for idx in 0..512 {
                if let Some(next) = read_entry(mm.memory(), table, idx).pa() {
                    visit(mm, next, level - 1, out);
                }
            }
        }
        let mut out = Vec::new();
        visit(mm, self.root.pa(), LEVELS - 1, &mut out);
        out
    }

    /// Tear down the address space: release every mapped page and every table page.
    pub fn destroy(self, mm: &mut PhysicalAllocator) {
        fn visit(mm: &mut PhysicalAllocator, table: Pa, level: usize) {
            for idx in 0..512 {
                let pte = read_entry(mm.memory(), table, idx);
                if let Some(pa) = pte.pa() {
                    if level > 0 {
                        visit(mm, pa, level - 1);
                    }
                    write_entry(mm.memory_mut(), table, idx, Pte::EMPTY);
                    mm.release(unsafe { Page::from_pa(pa) });
                }
            }
        }
        visit(mm, self.root.pa(), LEVELS - 1);
        mm.release(self.root);
    }
}

/// A cursor over a page table.
pub struct VmIter<'a> {
    root: Pa,
    mm: &'a mut PhysicalAllocator,
    va: Va,
    _table: core::marker::PhantomData<&'a mut PageTable>,
}

impl<'a> VmIter<'a> {
    /// Current virtual address.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    // Table holding the leaf of the current address, if every level is present.
    fn leaf_table(&self) -> Option<Pa> {
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            table = read_entry(self.mm.memory(), table, index(self.va, level)).pa()?;
        }
        Some(table)
    }

    /// Leaf entry of the current address.
    pub fn pte(&self) -> Pte {
        self.leaf_table()
            .map(|table| read_entry(self.mm.memory(), table, index(self.va, 0)))
            .unwrap_or(Pte::EMPTY)
    }

    /// Physical address the current address translates to.
    pub fn pa(&self) -> Option<Pa> {
        self.pte().pa().map(|pa| pa + self.va.page_offset())
    }

    /// Permission of the current address, **AND**ed across levels.
    pub fn perm(&self) -> Permission {
        let mut table = self.root;
        let mut flags = TABLE_FLAGS;
        let mut xd = false;
        for level in (0..LEVELS).rev() {
            let pte = read_entry(self.mm.memory(), table, index(self.va, level));
            table = match pte.pa() {
                Some(next) => next,
                None => return Permission::empty(),
            };
            flags &= pte.flags();
            xd |= pte.flags().contains(PteFlags::XD);
        }
        flags.set(PteFlags::XD, xd);
        Permission::from_pte_flags(flags)
    }

    /// Returns true if the current address is mapped.
    #[inline]
    pub fn present(&self) -> bool {
        self.pte().is_present()
    }

    /// Returns true if the current address is mapped writable.
    #[inline]
    pub fn writable(&self) -> bool {
        self.perm().contains(Permission::WRITE)
    }

    /// Returns true if the current address is mapped user-accessible.
    #[inline]
    pub fn user(&self) -> bool {
        self.perm().contains(Permission::USER)
    }

    /// Move the cursor to `va`.
    #[inline]
    pub fn find(&mut self, va: Va) -> &mut Self {
        self.va = va;
        self
    }

    /// Advance the cursor by one page.
    #[inline]
    pub fn next(&mut self) -> &mut Self {
        self.va = self.va.page_down() + PAGE_SIZE;
        self
    }

    /// Map `page` at the current address with `perm`.
    ///
    /// Missing intermediate tables are allocated first; if one of them cannot
    /// be allocated, the ones already taken are given back so the table is
    /// left as it was. On success, returns the page previously mapped at the
    /// current address, which the caller must release. On failure, `page` is
    /// released.
    pub fn try_map(&mut self, page: Page, perm: Permission) -> Result<Option<Page>, PageTableMappingError> {
        if !self.va.is_page_aligned() {
            self.mm.release(page);
            return Err(PageTableMappingError::Unaligned);
        }
        if self.va == Va::ZERO {
            self.mm.release(page);
            return Err(PageTableMappingError::InvalidAddress);
        }

        // Count the levels that must be created.
        let mut table = self.root;
        let mut missing = 0;
        for level in (1..LEVELS).rev() {
            match read_entry(self.mm.memory(), table, index(self.va, level)).pa() {
                Some(next) => table = next,
                None => {
                    missing = level;
                    break;
                }
            }
        }
        let mut fresh = Vec::with_capacity(missing);
        for _ in 0..missing {
            match self.mm.alloc_zeroed() {
                Some(p) => fresh.push(p),
                None => {
                    for p in fresh {
                        self.mm.release(p);
                    }
                    self.mm.release(page);
                    return Err(PageTableMappingError::OutOfMemory);
                }
            }
        }

        for (level, next) in (1..=missing).rev().zip(fresh) {
            let next = next.into_raw();
            write_entry(self.mm.memory_mut(), table, index(self.va, level), entry(next, TABLE_FLAGS));
            table = next;
        }

        let idx = index(self.va, 0);
        let old = read_entry(self.mm.memory(), table, idx);
        write_entry(
            self.mm.memory_mut(),
            table,
            idx,
            entry(page.into_raw(), perm.into_pte_flags()),
        );
        Ok(old.pa().map(|pa| unsafe { Page::from_pa(pa) }))
    }

    /// Map `page` at the current address with `perm`, panicking on failure.
    pub fn map(&mut self, page: Page, perm: Permission) -> Option<Page> {
        match self.try_map(page, perm) {
            Ok(old) => old,
            Err(e) => panic!("failed to map {:?}: {:?}", self.va, e),
        }
    }

    /// Remove the mapping of the current address, returning the page it mapped.
    pub fn unmap(&mut self) -> Result<Page, PageTableMappingError> {
        if !self.va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        let table = self.leaf_table().ok_or(PageTableMappingError::NotExist)?;
        let idx = index(self.va, 0);
        let pa = read_entry(self.mm.memory(), table, idx)
            .pa()
            .ok_or(PageTableMappingError::NotExist)?;
        write_entry(self.mm.memory_mut(), table, idx, Pte::EMPTY);
        Ok(unsafe { Page::from_pa(pa) })
    }
}
