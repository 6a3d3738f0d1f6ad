//! Process duplication.
//!
//! The child gets a private copy of every user-writable page of the parent and
//! of the console page. Every other page (kernel mappings, read-only program
//! text) is shared: the child takes one more counted reference to it.
use crate::addressing::PAGE_SIZE;
use crate::layout::{CONSOLE_ADDR, MEMSIZE_VIRTUAL};
use crate::mm::page_table::{PageTable, Permission};
use crate::mm::{Page, PhysicalAllocator};
use crate::process::{Pid, ProcState, ProcTable};

/// A list specifying categories of fork error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ForkError {
    /// Every process slot is in use.
    NoFreeSlot,
    /// A page or a page table page could not be allocated.
    OutOfMemory,
}

/// Returns true if the child must own a private copy of a page mapped at
/// `va` with `perm`.
#[inline]
pub fn is_private(va: usize, perm: Permission) -> bool {
    perm.contains(Permission::WRITE | Permission::USER) || va == CONSOLE_ADDR
}

/// Duplicate the process `parent`.
///
/// On success the child is runnable and returns 0 from the system call; the
/// parent's state is left untouched. On failure nothing is left behind.
pub fn fork(mm: &mut PhysicalAllocator, procs: &mut ProcTable, parent: Pid) -> Result<Pid, ForkError> {
    let child = procs.first_free().ok_or(ForkError::NoFreeSlot)?;
    let Some(parent_pt) = procs[parent].pagetable.as_ref() else {
        panic!("fork: process {} has no address space", parent);
    };
    let mappings = parent_pt.mappings(mm, 0..MEMSIZE_VIRTUAL);

    let mut pt = PageTable::new(mm).ok_or(ForkError::OutOfMemory)?;
    for (va, pte) in mappings {
        let Some(src) = pte.pa() else { continue };
        let perm = Permission::from_pte_flags(pte.flags());
        let page: Page = if is_private(va.into_usize(), perm) {
            match mm.alloc(PAGE_SIZE) {
                Some(page) => {
                    mm.memory_mut().copy_page(page.pa(), src);
                    page
                }
                None => {
                    pt.destroy(mm);
                    return Err(ForkError::OutOfMemory);
                }
            }
        } else {
            mm.share(src)
        };
        if pt.iter(mm, va).try_map(page, perm).is_err() {
            pt.destroy(mm);
            return Err(ForkError::OutOfMemory);
        }
    }

    let mut regs = procs[parent].regs;
    regs.gprs.rax = 0;
    let proc = &mut procs[child];
    proc.regs = regs;
    proc.pagetable = Some(pt);
    proc.state = ProcState::Runnable;
    debug!("fork: process {} -> process {}", parent, child);
    Ok(child)
}
