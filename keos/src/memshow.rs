//! Memory viewer.
//!
//! Draws the physical memory and the address space of one process as rows of
//! glyphs, one glyph per page and 64 pages per row.
//!
//! | glyph   | physical page                                  |
//! |---------|------------------------------------------------|
//! | `R`     | reserved for the hardware                      |
//! | `K`     | kernel image or kernel page table              |
//! | `.`     | free                                           |
//! | `0`-`f` | owned by the process with that pid             |
//! | `S`     | shared by several address spaces               |
//! | `?`     | in use but referenced by no page table         |
//!
//! In the virtual map, unmapped pages are `.`, kernel-only pages `K`, and user
//! pages take the glyph of the physical page they map.
use crate::addressing::{Pa, PAGE_SIZE};
use crate::layout::{
    va, HZ, IO_HOLE_START, KERNEL_START_ADDR, MEMSIZE_VIRTUAL, NPROC,
};
use crate::mm::page_table::PageTable;
use crate::mm::PhysicalAllocator;
use crate::process::{Pid, ProcState, ProcTable};
use abyss::x86_64::page_table::PteFlags;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::Write;

/// Pages per row.
pub const PAGES_PER_ROW: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Owner {
    Nobody,
    Kernel,
    Process(Pid),
    Shared,
}

impl Owner {
    fn add(self, other: Owner) -> Owner {
        match self {
            Owner::Nobody => other,
            s if s == other => s,
            _ => Owner::Shared,
        }
    }
}

fn owners(mm: &PhysicalAllocator, kernel: &PageTable, procs: &ProcTable) -> Vec<Owner> {
    let mut owners = vec![Owner::Nobody; mm.npages()];
    let tables = core::iter::once((Owner::Kernel, kernel)).chain(
        procs
            .live()
            .filter_map(|p| Some((Owner::Process(p.pid), p.pagetable.as_ref()?))),
    );
    for (owner, pt) in tables {
        let mut mark = |pa: Pa| {
            let o = &mut owners[pa.page_number()];
            *o = o.add(owner);
        };
        pt.table_pages(mm).into_iter().for_each(&mut mark);
        for (_, pte) in pt.mappings(mm, 0..MEMSIZE_VIRTUAL) {
            // Kernel mappings shared into every process say nothing about ownership.
            if owner != Owner::Kernel && !pte.flags().contains(PteFlags::US) {
                continue;
            }
            if let Some(pa) = pte.pa() {
                mark(pa);
            }
        }
    }
    owners
}

fn physical_glyph(mm: &PhysicalAllocator, owners: &[Owner], pa: Pa) -> char {
    if !mm.is_allocatable(pa) {
        let addr = pa.into_usize();
        return if addr < KERNEL_START_ADDR || addr >= IO_HOLE_START {
            'R'
        } else {
            'K'
        };
    }
    if mm.refcount(pa) == 0 {
        return '.';
    }
    match owners[pa.page_number()] {
        Owner::Nobody => '?',
        Owner::Kernel => 'K',
        Owner::Process(pid) => core::char::from_digit(pid as u32, 16).unwrap_or('S'),
        Owner::Shared => 'S',
    }
}

fn rows(glyphs: impl Iterator<Item = char>) -> Vec<String> {
    let glyphs: Vec<char> = glyphs.collect();
    glyphs
        .chunks(PAGES_PER_ROW)
        .enumerate()
        .map(|(i, row)| {
            let mut line = String::new();
            let _ = write!(line, "{:06x} ", i * PAGES_PER_ROW * PAGE_SIZE);
            line.extend(row.iter());
            line
        })
        .collect()
}

/// Rows of the physical memory map.
pub fn physical_map(mm: &PhysicalAllocator, kernel: &PageTable, procs: &ProcTable) -> Vec<String> {
    let owners = owners(mm, kernel, procs);
    rows((0..mm.npages()).map(|pn| physical_glyph(mm, &owners, Pa::from_page_number(pn))))
}

/// Rows of the virtual memory map of the process `pid`.
pub fn virtual_map(
    mm: &PhysicalAllocator,
    kernel: &PageTable,
    procs: &ProcTable,
    pid: Pid,
) -> Vec<String> {
    let owners = owners(mm, kernel, procs);
    let Some(pt) = procs[pid].pagetable.as_ref() else {
        return Vec::new();
    };
    rows((0..MEMSIZE_VIRTUAL).step_by(PAGE_SIZE).map(|addr| {
        match pt.walk(mm, va(addr)) {
            Err(_) => '.',
            Ok(pte) if !pte.flags().contains(PteFlags::US) => 'K',
            Ok(pte) => pte
                .pa()
                .map(|pa| physical_glyph(mm, &owners, pa))
                .unwrap_or('.'),
        }
    }))
}

/// State of the memory viewer.
#[derive(Debug, Default)]
pub struct MemShow {
    last_ticks: usize,
    showing: Pid,
}

impl MemShow {
    /// A viewer that draws on the first update.
    pub const fn new() -> Self {
        Self {
            last_ticks: 0,
            showing: 0,
        }
    }

    /// Process whose address space is shown.
    pub fn showing(&self) -> Pid {
        self.showing
    }

    /// Called on every trap. Every HZ/2 ticks the viewer moves on to the next
    /// process and redraws.
    pub fn update(&mut self, ticks: usize, mm: &PhysicalAllocator, kernel: &PageTable, procs: &ProcTable) {
        if self.last_ticks == 0 || ticks - self.last_ticks >= HZ / 2 {
            self.last_ticks = ticks;
            self.showing = (self.showing + 1) % NPROC;
            self.draw(mm, kernel, procs);
        }
    }

    /// Draw the physical map and the address space of the shown process.
    pub fn draw(&mut self, mm: &PhysicalAllocator, kernel: &PageTable, procs: &ProcTable) {
        for _ in 0..NPROC {
            let p = &procs[self.showing];
            if p.state != ProcState::Free && p.pagetable.is_some() {
                break;
            }
            self.showing = (self.showing + 1) % NPROC;
        }

        debug!("physical memory");
        for line in physical_map(mm, kernel, procs) {
            debug!("{}", line);
        }
        if procs[self.showing].pagetable.is_some() {
            debug!("virtual memory of process {}", self.showing);
            for line in virtual_map(mm, kernel, procs, self.showing) {
                debug!("{}", line);
            }
        }
    }
}
