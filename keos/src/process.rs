//! Process descriptor table.
use crate::layout::NPROC;
use crate::mm::page_table::PageTable;
use crate::mm::PhysicalAllocator;
use abyss::interrupt::Registers;

/// Process identifier; the index of the process in the table.
pub type Pid = usize;

/// Lifecycle state of a process slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    /// The slot is unused.
    Free,
    /// The process can be scheduled.
    Runnable,
    /// The process waits for something.
    Blocked,
    /// The process faulted and will never run again.
    Broken,
}

/// Process control block.
#[derive(Debug)]
pub struct Proc {
    /// Slot index of the process.
    pub pid: Pid,
    /// Lifecycle state.
    pub state: ProcState,
    /// Registers saved on the last trap.
    pub regs: Registers,
    /// Address space. `None` while the slot is free.
    pub pagetable: Option<PageTable>,
}

impl Proc {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            state: ProcState::Free,
            regs: Registers::default(),
            pagetable: None,
        }
    }

    /// Tear the process down: release its address space and reset the slot.
    pub fn teardown(&mut self, mm: &mut PhysicalAllocator) {
        if let Some(pt) = self.pagetable.take() {
            pt.destroy(mm);
        }
        *self = Proc::new(self.pid);
    }
}

/// Fixed-size table of process control blocks. Slot 0 is never used.
#[derive(Debug)]
pub struct ProcTable {
    procs: [Proc; NPROC],
}

impl ProcTable {
    /// A table of free slots.
    pub fn new() -> Self {
        Self {
            procs: core::array::from_fn(Proc::new),
        }
    }

    /// The first free slot, if any.
    pub fn first_free(&self) -> Option<Pid> {
        self.procs
            .iter()
            .skip(1)
            .find(|p| p.state == ProcState::Free)
            .map(|p| p.pid)
    }

    /// Iterate over the slots in use.
    pub fn live(&self) -> impl Iterator<Item = &Proc> {
        self.procs.iter().filter(|p| p.state != ProcState::Free)
    }

    /// Iterate over every slot.
    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        self.procs.iter()
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<Pid> for ProcTable {
    type Output = Proc;

    fn index(&self, pid: Pid) -> &Proc {
        &self.procs[pid]
    }
}

impl core::ops::IndexMut<Pid> for ProcTable {
    fn index_mut(&mut self, pid: Pid) -> &mut Proc {
        &mut self.procs[pid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::MEMSIZE_PHYSICAL;
    use abyss::memory::PhysicalMemory;

    #[test]
    fn slots() {
        let mut procs = ProcTable::new();
        assert_eq!(procs.first_free(), Some(1));
        for pid in 1..NPROC {
            assert_eq!(procs[pid].pid, pid);
            procs[pid].state = ProcState::Runnable;
        }
        assert_eq!(procs.first_free(), None);
        assert_eq!(procs.live().count(), NPROC - 1);
        procs[3].state = ProcState::Broken;
        assert_eq!(procs.live().count(), NPROC - 1);
        assert_eq!(procs.first_free(), None);
    }

    #[test]
    fn teardown_resets_slot() {
        let mut mm = PhysicalAllocator::new(PhysicalMemory::new(MEMSIZE_PHYSICAL));
        let free = mm.free_pages();
        let mut procs = ProcTable::new();
        procs[2].state = ProcState::Broken;
        procs[2].regs.gprs.rax = 42;
        procs[2].pagetable = PageTable::new(&mut mm);
        procs[2].teardown(&mut mm);
        assert_eq!(procs[2].state, ProcState::Free);
        assert_eq!(procs[2].pid, 2);
        assert_eq!(procs[2].regs, Registers::default());
        assert!(procs[2].pagetable.is_none());
        assert_eq!(mm.free_pages(), free);
        assert_eq!(procs.first_free(), Some(1));
    }
}
