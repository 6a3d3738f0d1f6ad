//! Consistency checks of the memory state.
//!
//! Both checks halt the kernel when they find a violation: once the page
//! tables or the reference counts are inconsistent, nothing the kernel does
//! afterward can be trusted.
use crate::addressing::PAGE_SIZE;
use crate::layout::{va, CONSOLE_ADDR, MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::mm::page_table::PageTable;
use crate::mm::PhysicalAllocator;
use crate::process::ProcTable;
use abyss::x86_64::page_table::PteFlags;
use alloc::vec;

/// Check the page table `pt` of a process against the kernel's.
///
/// Every kernel mapping below [`PROC_START_ADDR`] but the console must be
/// present with the same page and flags, the null page must be unmapped and
/// the console must be present, user-accessible and writable.
pub fn check_pagetable(mm: &PhysicalAllocator, kernel: &PageTable, pt: &PageTable) {
    let ours = pt.mappings(mm, 0..PROC_START_ADDR);
    let theirs = kernel.mappings(mm, 0..PROC_START_ADDR);
    let mut ours = ours.iter().filter(|(va, _)| va.into_usize() != CONSOLE_ADDR);
    let mut theirs = theirs.iter().filter(|(va, _)| va.into_usize() != CONSOLE_ADDR);
    loop {
        match (ours.next(), theirs.next()) {
            (None, None) => break,
            (Some((va, pte)), Some((kva, kpte))) if va == kva => {
                assert_eq!(
                    pte, kpte,
                    "check_pagetable: {:?} differs from the kernel mapping",
                    va
                );
            }
            (Some((va, _)), _) => panic!("check_pagetable: unexpected mapping at {:?}", va),
            (None, Some((kva, _))) => panic!("check_pagetable: kernel mapping {:?} missing", kva),
        }
    }

    assert!(
        pt.walk(mm, va(0)).is_err(),
        "check_pagetable: null page is mapped"
    );
    let console = pt
        .walk(mm, va(CONSOLE_ADDR))
        .map(|pte| pte.flags())
        .unwrap_or(PteFlags::empty());
    assert!(
        console.contains(PteFlags::P | PteFlags::RW | PteFlags::US),
        "check_pagetable: console is not user-writable ({:?})",
        console
    );
}

/// Check that the refcount of every physical page equals the number of
/// references the live page tables hold to it.
///
/// A page table references each of its table pages once and each mapped
/// page once per mapping.
pub fn check_virtual_memory(mm: &PhysicalAllocator, kernel: &PageTable, procs: &ProcTable) {
    let mut counts = vec![0u32; mm.npages()];
    let tables = core::iter::once(kernel).chain(procs.live().filter_map(|p| p.pagetable.as_ref()));
    for pt in tables {
        for pa in pt.table_pages(mm) {
            counts[pa.page_number()] += 1;
        }
        for (_, pte) in pt.mappings(mm, 0..MEMSIZE_VIRTUAL) {
            if let Some(pa) = pte.pa() {
                counts[pa.page_number()] += 1;
            }
        }
    }
    for (pn, count) in counts.into_iter().enumerate() {
        let refcount = mm.page_info(pn).refcount;
        assert_eq!(
            refcount,
            count,
            "check_virtual_memory: page {:#x} has refcount {} but {} references",
            pn * PAGE_SIZE,
            refcount,
            count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::Pa;
    use crate::layout::MEMSIZE_PHYSICAL;
    use crate::loader::copy_kernel_mappings;
    use crate::mm::page_table::Permission;
    use crate::mm::Page;
    use crate::process::ProcState;
    use abyss::memory::PhysicalMemory;

    fn kernel() -> (PhysicalAllocator, PageTable) {
        let mut mm = PhysicalAllocator::new(PhysicalMemory::new(MEMSIZE_PHYSICAL));
        let mut pt = PageTable::new(&mut mm).unwrap();
        for addr in [0x40000, 0x41000, CONSOLE_ADDR] {
            let page = mm.claim_reserved(Pa::new(addr).unwrap());
            let perm = if addr == CONSOLE_ADDR {
                Permission::USER_RW
            } else {
                Permission::KERNEL
            };
            pt.map(&mut mm, va(addr), page, perm).unwrap();
        }
        (mm, pt)
    }

    #[test]
    fn mirrored_table_passes() {
        let (mut mm, kernel) = kernel();
        let pt = copy_kernel_mappings(&mut mm, &kernel).unwrap();
        check_pagetable(&mm, &kernel, &pt);

        let mut procs = ProcTable::new();
        procs[1].pagetable = Some(pt);
        procs[1].state = ProcState::Broken;
        check_virtual_memory(&mm, &kernel, &procs);
    }

    #[test]
    #[should_panic(expected = "kernel mapping")]
    fn missing_kernel_mapping() {
        let (mut mm, kernel) = kernel();
        let mut pt = copy_kernel_mappings(&mut mm, &kernel).unwrap();
        let page = pt.unmap(&mut mm, va(0x41000)).unwrap();
        mm.release(page);
        check_pagetable(&mm, &kernel, &pt);
    }

    #[test]
    #[should_panic(expected = "differs from the kernel mapping")]
    fn user_accessible_kernel_page() {
        let (mut mm, kernel) = kernel();
        let mut pt = copy_kernel_mappings(&mut mm, &kernel).unwrap();
        let page = mm.share(Pa::new(0x40000).unwrap());
        let old = pt
            .replace(&mut mm, va(0x40000), page, Permission::USER_RW)
            .unwrap()
            .unwrap();
        mm.release(old);
        check_pagetable(&mm, &kernel, &pt);
    }

    #[test]
    #[should_panic(expected = "console is not user-writable")]
    fn console_unmapped() {
        let (mut mm, kernel) = kernel();
        let mut pt = copy_kernel_mappings(&mut mm, &kernel).unwrap();
        let page = pt.unmap(&mut mm, va(CONSOLE_ADDR)).unwrap();
        mm.release(page);
        check_pagetable(&mm, &kernel, &pt);
    }

    #[test]
    #[should_panic(expected = "check_virtual_memory")]
    fn leaked_page() {
        let (mut mm, kernel) = kernel();
        let _leak = mm.alloc(PAGE_SIZE).unwrap().into_raw();
        check_virtual_memory(&mm, &kernel, &ProcTable::new());
    }

    #[test]
    #[should_panic(expected = "check_virtual_memory")]
    fn uncounted_share() {
        let (mut mm, kernel) = kernel();
        let mut pt = copy_kernel_mappings(&mut mm, &kernel).unwrap();
        let page = mm.alloc_zeroed().unwrap();
        let pa = page.into_raw();
        // Two mappings backed by a single reference.
        pt.map(
            &mut mm,
            va(PROC_START_ADDR),
            unsafe { Page::from_pa(pa) },
            Permission::USER_RW,
        )
        .unwrap();
        pt.map(
            &mut mm,
            va(PROC_START_ADDR + PAGE_SIZE),
            unsafe { Page::from_pa(pa) },
            Permission::USER_RW,
        )
        .unwrap();
        let mut procs = ProcTable::new();
        procs[1].pagetable = Some(pt);
        procs[1].state = ProcState::Runnable;
        check_virtual_memory(&mm, &kernel, &procs);
    }
}
