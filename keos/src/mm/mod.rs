//! Physical memory management.
//!
//! The kernel tracks a reference count for every physical page. A page with
//! refcount 0 is free. Each counted reference is represented by a [`Page`]
//! handle: [`PhysicalAllocator::alloc`] hands out the first one,
//! [`PhysicalAllocator::share`] creates more and [`PhysicalAllocator::release`]
//! gives one back. Pages below [`ALLOCATABLE_START`] belong to the kernel and
//! the hardware and are never handed out, whatever their refcount.
pub mod page_table;

use crate::addressing::{Pa, PAGE_SIZE};
use crate::layout::{ALLOCATABLE_START, ALLOC_FILL};
use abyss::memory::PhysicalMemory;
use alloc::vec;
use alloc::vec::Vec;

/// Bookkeeping of a physical page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageInfo {
    /// Number of references to the page.
    pub refcount: u32,
}

impl PageInfo {
    /// Returns true if somebody references the page.
    #[inline]
    pub fn used(&self) -> bool {
        self.refcount > 0
    }
}

/// A counted reference to a physical page.
///
/// The handle does not give the reference back when it is dropped: every
/// `Page` must end in [`PhysicalAllocator::release`], in a page table, or in
/// [`Page::into_raw`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct Page {
    pa: Pa,
}

impl Page {
    /// Get physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Consumes the page, returning a pa of the page.
    ///
    /// After calling this function, the caller is responsible for the reference previously managed by the Page.
    /// In particular, the caller should properly release the page by calling the `Page::from_pa`.
    #[inline]
    pub fn into_raw(self) -> Pa {
        self.pa
    }

    /// Constructs a page from a pa.
    ///
    /// For this to be safe, the pa must have been taken by `Page::into_raw`.
    ///
    /// ## Safety
    /// This function is unsafe because improper use may lead to memory problems. For example, a double-free may occur if the function is called twice on the same raw pointer.
    #[inline]
    pub unsafe fn from_pa(pa: Pa) -> Self {
        debug_assert!(pa.is_page_aligned());
        Page { pa }
    }
}

/// Physical page allocator.
///
/// Owns the physical memory of the machine and the page info table.
pub struct PhysicalAllocator {
    memory: PhysicalMemory,
    pages: Vec<PageInfo>,
    // Page number where the next search starts.
    cursor: usize,
}

impl PhysicalAllocator {
    /// Take over the physical memory.
    pub fn new(memory: PhysicalMemory) -> Self {
        let npages = memory.npages();
        Self {
            memory,
            pages: vec![PageInfo::default(); npages],
            cursor: ALLOCATABLE_START / PAGE_SIZE,
        }
    }

    /// Number of physical pages.
    #[inline]
    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Bookkeeping of the physical page number `pn`.
    #[inline]
    pub fn page_info(&self, pn: usize) -> PageInfo {
        self.pages[pn]
    }

    /// Reference count of the page containing `pa`.
    #[inline]
    pub fn refcount(&self, pa: Pa) -> u32 {
        self.pages
            .get(pa.page_number())
            .map(|p| p.refcount)
            .unwrap_or(0)
    }

    /// Returns true if `pa` may be handed out by the allocator.
    #[inline]
    pub fn is_allocatable(&self, pa: Pa) -> bool {
        pa.into_usize() >= ALLOCATABLE_START && pa.page_number() < self.pages.len()
    }

    /// Allocate a page of `size` bytes at most.
    ///
    /// The search starts from where the previous one stopped and covers the
    /// physical memory once. The page comes back filled with [`ALLOC_FILL`]
    /// and a refcount of 1. Fails if `size` exceeds a page or no page is free.
    pub fn alloc(&mut self, size: usize) -> Option<Page> {
        if size > PAGE_SIZE {
            return None;
        }
        let npages = self.pages.len();
        for i in 0..npages {
            let pn = (self.cursor + i) % npages;
            let pa = Pa::from_page_number(pn);
            if self.is_allocatable(pa) && !self.pages[pn].used() {
                self.cursor = (pn + 1) % npages;
                self.pages[pn].refcount = 1;
                self.memory.fill_page(pa, ALLOC_FILL);
                return Some(Page { pa });
            }
        }
        None
    }

    /// Allocate a page filled with zero.
    pub fn alloc_zeroed(&mut self) -> Option<Page> {
        let page = self.alloc(PAGE_SIZE)?;
        self.memory.fill_page(page.pa(), 0);
        Some(page)
    }

    /// Force the page at `pa` free.
    ///
    /// No-op on the null address, on non-allocatable addresses and on free
    /// pages. The contents of the page are kept.
    ///
    /// The page must have no other reference. Shared pages go through
    /// [`PhysicalAllocator::release`].
    pub fn free(&mut self, pa: Pa) {
        if pa == Pa::ZERO || !self.is_allocatable(pa) {
            return;
        }
        let info = &mut self.pages[pa.page_number()];
        debug_assert!(info.refcount <= 1, "free of shared page {:?}", pa);
        info.refcount = 0;
    }

    /// Take one more reference to the page at `pa`, which must be in use.
    pub fn share(&mut self, pa: Pa) -> Page {
        let info = &mut self.pages[pa.page_number()];
        assert!(info.used(), "share of free page {:?}", pa);
        info.refcount += 1;
        Page {
            pa: Pa::from_page_number(pa.page_number()),
        }
    }

    /// Give back a reference. The page is free once the last one is released.
    pub fn release(&mut self, page: Page) {
        let info = &mut self.pages[page.pa().page_number()];
        assert!(info.used(), "release of free page {:?}", page.pa());
        info.refcount -= 1;
    }

    /// Claim the first reference to a page of the kernel's reserved memory.
    pub fn claim_reserved(&mut self, pa: Pa) -> Page {
        assert!(!self.is_allocatable(pa), "{:?} is not reserved", pa);
        let info = &mut self.pages[pa.page_number()];
        assert!(!info.used(), "{:?} already claimed", pa);
        info.refcount = 1;
        Page {
            pa: Pa::from_page_number(pa.page_number()),
        }
    }

    /// The physical memory.
    #[inline]
    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// The physical memory.
    #[inline]
    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    /// Number of free allocatable pages.
    pub fn free_pages(&self) -> usize {
        (0..self.pages.len())
            .filter(|pn| {
                self.is_allocatable(Pa::from_page_number(*pn)) && !self.pages[*pn].used()
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MEMSIZE_PHYSICAL;
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn allocator() -> PhysicalAllocator {
        PhysicalAllocator::new(PhysicalMemory::new(MEMSIZE_PHYSICAL))
    }

    const ALLOCATABLE: usize = (MEMSIZE_PHYSICAL - ALLOCATABLE_START) / PAGE_SIZE;

    #[test]
    fn alloc_fills_and_counts() {
        let mut mm = allocator();
        let page = mm.alloc(PAGE_SIZE).unwrap();
        assert!(mm.is_allocatable(page.pa()));
        assert_eq!(mm.refcount(page.pa()), 1);
        assert!(mm.memory().page(page.pa()).iter().all(|b| *b == ALLOC_FILL));
        assert!(mm.alloc(PAGE_SIZE + 1).is_none());

        let zero = mm.alloc_zeroed().unwrap();
        assert!(mm.memory().page(zero.pa()).iter().all(|b| *b == 0));
        assert_ne!(zero.pa(), page.pa());
    }

    #[test]
    fn free_semantics() {
        let mut mm = allocator();
        let pa = mm.alloc(1).unwrap().into_raw();
        mm.free(pa);
        assert_eq!(mm.refcount(pa), 0);
        // Freeing a free page does not underflow.
        mm.free(pa);
        assert_eq!(mm.refcount(pa), 0);

        let reserved = mm.claim_reserved(Pa::new(0x40000).unwrap());
        mm.free(Pa::ZERO);
        mm.free(reserved.pa());
        mm.free(Pa::new(MEMSIZE_PHYSICAL).unwrap());
        assert_eq!(mm.refcount(reserved.pa()), 1);
        mm.release(reserved);
    }

    #[test]
    #[should_panic(expected = "free of shared page")]
    fn free_shared_page() {
        let mut mm = allocator();
        let page = mm.alloc_zeroed().unwrap();
        let _other = mm.share(page.pa());
        mm.free(page.into_raw());
    }

    #[test]
    fn share_and_release() {
        let mut mm = allocator();
        let page = mm.alloc(PAGE_SIZE).unwrap();
        let pa = page.pa();
        let other = mm.share(pa);
        assert_eq!(mm.refcount(pa), 2);
        mm.release(page);
        assert_eq!(mm.refcount(pa), 1);
        assert_eq!(mm.free_pages(), ALLOCATABLE - 1);
        mm.release(other);
        assert_eq!(mm.refcount(pa), 0);
        assert_eq!(mm.free_pages(), ALLOCATABLE);
    }

    #[test]
    #[should_panic(expected = "share of free page")]
    fn share_free_page() {
        let mut mm = allocator();
        let _ = mm.share(Pa::new(ALLOCATABLE_START).unwrap());
    }

    #[test]
    fn exhaust_and_cycle() {
        let mut mm = allocator();
        let mut pages = Vec::new();
        while let Some(page) = mm.alloc(PAGE_SIZE) {
            pages.push(page);
        }
        assert_eq!(pages.len(), ALLOCATABLE);
        assert!(pages.iter().all(|p| p.pa().into_usize() >= ALLOCATABLE_START));

        // Pages behind the cursor are found again.
        let first = pages.remove(0);
        let pa = first.pa();
        mm.release(first);
        let again = mm.alloc(PAGE_SIZE).unwrap();
        assert_eq!(again.pa(), pa);
        pages.push(again);

        // Cycling through memory never runs out while pages are released.
        for _ in 0..4 * ALLOCATABLE {
            let page = pages.pop().unwrap();
            mm.release(page);
            pages.insert(0, mm.alloc(PAGE_SIZE).unwrap());
        }
        assert!(mm.alloc(PAGE_SIZE).is_none());
    }

    #[test]
    fn random_stress() {
        let mut rng = rand::thread_rng();
        let mut mm = allocator();
        let mut held: Vec<Page> = Vec::new();
        for _ in 0..10_000 {
            if rng.gen_bool(0.6) {
                match mm.alloc(rng.gen_range(0..=PAGE_SIZE)) {
                    Some(page) => held.push(page),
                    None => assert_eq!(held.len(), ALLOCATABLE),
                }
            } else if !held.is_empty() {
                held.shuffle(&mut rng);
                mm.release(held.pop().unwrap());
            }
            assert_eq!(mm.free_pages(), ALLOCATABLE - held.len());
        }
        for page in &held {
            assert_eq!(mm.refcount(page.pa()), 1);
        }
    }
}
