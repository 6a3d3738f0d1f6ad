//! Process loader.
//!
//! A program is a list of segments and an entry point. Loading a program
//! builds a fresh address space that shares the kernel mappings, backs each
//! segment with freshly allocated pages, and gives the process one stack page
//! at the top of its address space.
use crate::addressing::{align_down, PAGE_SIZE};
use crate::layout::{va, MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::mm::page_table::{PageTable, PageTableMappingError, Permission};
use crate::mm::PhysicalAllocator;
use crate::process::{Proc, ProcState};
use abyss::interrupt::Registers;
use alloc::string::String;
use alloc::vec::Vec;

/// A loadable segment of a program.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Virtual address of the segment.
    pub va: usize,
    /// Size of the segment in memory. Bytes past `data` are zero.
    pub size: usize,
    /// Initial contents.
    pub data: Vec<u8>,
    /// Mapped writable if set; read-only and executable otherwise.
    pub writable: bool,
}

/// Program descriptor.
#[derive(Debug, Clone)]
pub struct Program {
    /// Name the program is looked up by.
    pub name: String,
    /// Address of the first instruction.
    pub entry: usize,
    /// Segments, loaded in order.
    pub segments: Vec<Segment>,
}

/// Source of the programs the kernel can run.
pub trait ProgramLoader {
    /// Look up a program by name.
    fn load(&self, name: &str) -> Option<Program>;
}

/// Virtual address of the stack page.
pub const STACK_PAGE: usize = MEMSIZE_VIRTUAL - PAGE_SIZE;

/// Build a page table that shares every kernel mapping below [`PROC_START_ADDR`].
pub fn copy_kernel_mappings(
    mm: &mut PhysicalAllocator,
    kernel: &PageTable,
) -> Result<PageTable, PageTableMappingError> {
    let mut pt = PageTable::new(mm).ok_or(PageTableMappingError::OutOfMemory)?;
    for (va, pte) in kernel.mappings(mm, 0..PROC_START_ADDR) {
        let Some(pa) = pte.pa() else { continue };
        let page = mm.share(pa);
        let perm = Permission::from_pte_flags(pte.flags());
        if let Err(e) = pt.iter(mm, va).try_map(page, perm) {
            pt.destroy(mm);
            return Err(e);
        }
    }
    Ok(pt)
}

/// Load `program` into the process `proc`.
///
/// # Panics
/// Panics if the process is runnable, if a segment lies outside of the user
/// region, or if memory runs out.
pub fn setup(mm: &mut PhysicalAllocator, kernel: &PageTable, proc: &mut Proc, program: &Program) {
    assert_ne!(
        proc.state,
        ProcState::Runnable,
        "process_setup: process {} is runnable",
        proc.pid
    );
    proc.teardown(mm);

    let mut pt = match copy_kernel_mappings(mm, kernel) {
        Ok(pt) => pt,
        Err(e) => panic!("process_setup: {}: {:?}", program.name, e),
    };

    for seg in program.segments.iter() {
        assert!(
            seg.va >= PROC_START_ADDR && seg.va + seg.size <= STACK_PAGE,
            "process_setup: {}: segment {:#x}+{:#x} outside of the user region",
            program.name,
            seg.va,
            seg.size
        );
        let perm = if seg.writable {
            Permission::USER_RW
        } else {
            Permission::READ | Permission::USER | Permission::EXECUTABLE
        };
        for a in (align_down(seg.va, PAGE_SIZE)..seg.va + seg.size).step_by(PAGE_SIZE) {
            let va = va(a);
            let result = match pt.walk(mm, va) {
                // A page shared by two segments gets the union of their permissions.
                Ok(pte) => {
                    let old = Permission::from_pte_flags(pte.flags());
                    if old.contains(perm) {
                        continue;
                    }
                    pt.unmap(mm, va)
                        .and_then(|page| pt.map(mm, va, page, old | perm))
                }
                Err(_) => {
                    let Some(page) = mm.alloc_zeroed() else {
                        panic!("process_setup: {}: out of memory", program.name)
                    };
                    pt.map(mm, va, page, perm)
                }
            };
            if let Err(e) = result {
                panic!("process_setup: {}: {:?} at {:?}", program.name, e, va);
            }
        }
        let len = seg.size.min(seg.data.len());
        if let Err(e) = pt.write_bytes(mm, va(seg.va), &seg.data[..len]) {
            panic!("process_setup: {}: {:?}", program.name, e);
        }
    }

    let Some(stack) = mm.alloc_zeroed() else {
        panic!("process_setup: {}: out of memory", program.name)
    };
    if let Err(e) = pt.map(mm, va(STACK_PAGE), stack, Permission::USER_RW) {
        panic!("process_setup: {}: {:?}", program.name, e);
    }

    proc.regs = Registers::new_user(program.entry, MEMSIZE_VIRTUAL);
    proc.pagetable = Some(pt);
    proc.state = ProcState::Runnable;
    info!("process {}: loaded {}", proc.pid, program.name);
}
