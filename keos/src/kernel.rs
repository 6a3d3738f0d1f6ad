//! The kernel.
//!
//! [`Kernel`] owns every piece of kernel state: the physical page allocator,
//! the kernel page table, the process table and the machine the processes run
//! on. It is initialized once by [`Kernel::boot`].
//!
//! Control reaches user mode only through [`Kernel::run`], which runs a
//! process until the next trap, handles the trap, and reports what to run next
//! as a [`Resume`].
use crate::addressing::{Pa, PAGE_SIZE};
use crate::check::check_pagetable;
use crate::layout::{
    va, CONSOLE_ADDR, DEFAULT_PROGRAMS, HZ, IDLE_REDRAW_SPINS, MEMSIZE_PHYSICAL, PROC_START_ADDR,
};
use crate::loader::{self, ProgramLoader};
use crate::memshow::MemShow;
use crate::mm::page_table::{PageTable, Permission};
use crate::mm::PhysicalAllocator;
use crate::process::{Pid, ProcState, ProcTable};
use crate::scheduler::{RoundRobin, Scheduler};
use abyss::cpu::Cpu;
use abyss::dev::Lapic;
use abyss::interrupt::Vector;
use abyss::memory::PhysicalMemory;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// What the kernel does after handling a trap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Return to user mode in the process.
    Run(Pid),
    /// No process is runnable.
    Idle,
}

/// Why [`Kernel::run_until`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// The stop condition holds.
    Condition,
    /// No process is runnable.
    Idle,
}

/// The kernel state.
pub struct Kernel<L: ProgramLoader> {
    pub(crate) mm: PhysicalAllocator,
    pub(crate) kernel_pagetable: PageTable,
    pub(crate) procs: ProcTable,
    pub(crate) cpu: Cpu,
    pub(crate) lapic: Lapic,
    pub(crate) ticks: usize,
    pub(crate) current: Pid,
    pub(crate) scheduler: Box<dyn Scheduler>,
    pub(crate) memshow: MemShow,
    loader: L,
}

impl<L: ProgramLoader> Kernel<L> {
    /// Boot the kernel.
    ///
    /// `command` names the program to run in process 1. If it is absent or
    /// unknown to `loader`, the default programs are loaded into processes 1
    /// and up.
    pub fn boot(loader: L, command: Option<&str>) -> Self {
        info!("Starting WeensyOS");
        let mut mm = PhysicalAllocator::new(PhysicalMemory::new(MEMSIZE_PHYSICAL));
        let kernel_pagetable = kernel_pagetable(&mut mm);
        let mut kernel = Self {
            mm,
            kernel_pagetable,
            procs: ProcTable::new(),
            cpu: Cpu::new(),
            lapic: Lapic::new(HZ),
            ticks: 1,
            current: 0,
            scheduler: Box::new(RoundRobin::new()),
            memshow: MemShow::new(),
            loader,
        };

        let programs: Vec<&str> = match command {
            Some(name) if kernel.loader.load(name).is_some() => alloc::vec![name],
            Some(name) => {
                warning!("unknown program {}, loading the default programs", name);
                DEFAULT_PROGRAMS.to_vec()
            }
            None => DEFAULT_PROGRAMS.to_vec(),
        };
        for (i, name) in programs.into_iter().enumerate() {
            kernel.process_setup(i + 1, name);
        }
        kernel
    }

    /// Load the program `name` into the process `pid`.
    ///
    /// # Panics
    /// Panics if the program is unknown or the process is runnable.
    pub fn process_setup(&mut self, pid: Pid, name: &str) {
        let Some(program) = self.loader.load(name) else {
            panic!("process_setup: unknown program {}", name);
        };
        loader::setup(
            &mut self.mm,
            &self.kernel_pagetable,
            &mut self.procs[pid],
            &program,
        );
    }

    /// The physical page allocator.
    pub fn mm(&self) -> &PhysicalAllocator {
        &self.mm
    }

    /// The kernel page table.
    pub fn kernel_pagetable(&self) -> &PageTable {
        &self.kernel_pagetable
    }

    /// The process table.
    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    /// Number of timer interrupts so far, plus one.
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// The process that ran last.
    pub fn current(&self) -> Pid {
        self.current
    }

    /// Read the memory of process `pid` at `addr`, as the kernel sees it.
    pub fn read_user(&self, pid: Pid, addr: usize, buf: &mut [u8]) -> bool {
        match self.procs[pid].pagetable.as_ref() {
            Some(pt) => pt.read_bytes(&self.mm, va(addr), buf).is_ok(),
            None => false,
        }
    }

    /// Pick the next process to run after the current one.
    pub fn schedule(&mut self) -> Resume {
        match self.scheduler.next_to_run(&self.procs, self.current) {
            Some(pid) => Resume::Run(pid),
            None => Resume::Idle,
        }
    }

    /// Run the process `pid` until it traps, then handle the trap.
    ///
    /// # Panics
    /// Panics if the process is not runnable or its page table is broken.
    pub fn run(&mut self, pid: Pid) -> Resume {
        let proc = &self.procs[pid];
        assert_eq!(
            proc.state,
            ProcState::Runnable,
            "run: process {} is not runnable",
            pid
        );
        self.current = pid;
        let Some(pt) = proc.pagetable.as_ref() else {
            panic!("run: process {} has no address space", pid);
        };
        check_pagetable(&self.mm, &self.kernel_pagetable, pt);
        self.cpu.set_cr3(pt.pa());

        let mut regs = proc.regs;
        match self
            .cpu
            .run(self.mm.memory_mut(), &mut regs, &mut self.lapic)
        {
            Vector::Syscall => self.syscall(regs),
            _ => self.exception(regs),
        }
    }

    /// Spin with nothing to run. The memory viewer is redrawn every
    /// [`IDLE_REDRAW_SPINS`] spins.
    ///
    /// Returns the process to run as soon as one is runnable, or None after
    /// `spins` spins.
    pub fn idle(&mut self, spins: usize) -> Option<Pid> {
        for spin in 1..=spins {
            if let Resume::Run(pid) = self.schedule() {
                return Some(pid);
            }
            if spin % IDLE_REDRAW_SPINS == 0 {
                self.memshow
                    .draw(&self.mm, &self.kernel_pagetable, &self.procs);
                info!("{}", spin);
            }
        }
        None
    }

    /// Run processes until `stop` holds or nothing is runnable.
    ///
    /// `stop` is evaluated before the first process runs and after every trap.
    pub fn run_until(&mut self, mut stop: impl FnMut(&Self) -> bool) -> Stop {
        let mut resume = if self.procs[self.current].state == ProcState::Runnable {
            Resume::Run(self.current)
        } else {
            self.schedule()
        };
        loop {
            if stop(self) {
                return Stop::Condition;
            }
            resume = match resume {
                Resume::Run(pid) => self.run(pid),
                Resume::Idle => match self.idle(IDLE_REDRAW_SPINS) {
                    Some(pid) => Resume::Run(pid),
                    None => return Stop::Idle,
                },
            };
        }
    }
}

/// Build the kernel page table: an identity mapping of everything below
/// [`PROC_START_ADDR`] but the null page. The console is user-accessible.
fn kernel_pagetable(mm: &mut PhysicalAllocator) -> PageTable {
    let Some(mut pt) = PageTable::new(mm) else {
        panic!("kernel_pagetable: out of memory");
    };
    for addr in (PAGE_SIZE..PROC_START_ADDR).step_by(PAGE_SIZE) {
        let Some(pa) = Pa::new(addr) else {
            panic!("kernel_pagetable: {:#x} is not a physical address", addr);
        };
        let page = mm.claim_reserved(pa);
        let perm = if addr == CONSOLE_ADDR {
            Permission::USER_RW
        } else {
            Permission::KERNEL
        };
        if let Err(e) = pt.map(mm, va(addr), page, perm) {
            panic!("kernel_pagetable: {:?} at {:#x}", e, addr);
        }
    }
    pt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::check_virtual_memory;
    use crate::loader::{Program, Segment};
    use abyss::cpu::asm::Assembler;
    use abyss::cpu::isa::Reg;
    use alloc::string::ToString;

    // Programs that run forever.
    struct Spinners;

    fn spinner(name: &str) -> Program {
        let mut asm = Assembler::new();
        let top = asm.label();
        asm.bind(top);
        asm.addi(Reg::Rbx, 1).jmp(top);
        Program {
            name: name.to_string(),
            entry: PROC_START_ADDR,
            segments: alloc::vec![Segment {
                va: PROC_START_ADDR,
                size: PAGE_SIZE,
                data: asm.finish(),
                writable: false,
            }],
        }
    }

    impl ProgramLoader for Spinners {
        fn load(&self, name: &str) -> Option<Program> {
            match name {
                "allocator" | "allocator2" | "allocator3" | "allocator4" | "spin" => {
                    Some(spinner(name))
                }
                _ => None,
            }
        }
    }

    #[test]
    fn boot_defaults() {
        let kernel = Kernel::boot(Spinners, None);
        let live: Vec<Pid> = kernel.procs().live().map(|p| p.pid).collect();
        assert_eq!(live, [1, 2, 3, 4]);
        for pid in live {
            let pt = kernel.procs()[pid].pagetable.as_ref().unwrap();
            check_pagetable(kernel.mm(), kernel.kernel_pagetable(), pt);
        }
        check_virtual_memory(kernel.mm(), kernel.kernel_pagetable(), kernel.procs());

        let unknown = Kernel::boot(Spinners, Some("nonexistent"));
        assert_eq!(unknown.procs().live().count(), 4);
        let one = Kernel::boot(Spinners, Some("spin"));
        assert_eq!(one.procs().live().count(), 1);
    }

    #[test]
    fn round_robin_on_timer() {
        let mut kernel = Kernel::boot(Spinners, None);
        let mut order = Vec::new();
        kernel.run_until(|k| {
            if order.last() != Some(&k.current()) {
                order.push(k.current());
            }
            k.ticks() > 8
        });
        // Process 0 is the boot context.
        assert_eq!(order, [0, 1, 2, 3, 4, 1, 2, 3, 4]);
        check_virtual_memory(kernel.mm(), kernel.kernel_pagetable(), kernel.procs());
    }

    #[test]
    #[should_panic(expected = "process_setup: unknown program")]
    fn setup_unknown_program() {
        let mut kernel = Kernel::boot(Spinners, Some("spin"));
        kernel.process_setup(2, "nonexistent");
    }

    #[test]
    #[should_panic(expected = "is runnable")]
    fn setup_runnable_process() {
        let mut kernel = Kernel::boot(Spinners, Some("spin"));
        kernel.process_setup(1, "spin");
    }

    #[test]
    fn idle_when_nothing_runs() {
        let mut kernel = Kernel::boot(Spinners, Some("spin"));
        kernel.procs[1].state = ProcState::Blocked;
        assert_eq!(kernel.schedule(), Resume::Idle);
        assert_eq!(kernel.idle(2 * IDLE_REDRAW_SPINS), None);
        assert_eq!(kernel.run_until(|_| false), Stop::Idle);
        kernel.procs[1].state = ProcState::Runnable;
        assert_eq!(kernel.idle(1), Some(1));
    }
}
