//! Trap handling.
//!
//! Every trap saves the registers of the interrupted process into its
//! control block before anything else. A handler either returns to the
//! process, if it is still runnable, or asks the scheduler for another one.
use crate::fork::fork;
use crate::kernel::{Kernel, Resume};
use crate::loader::ProgramLoader;
use crate::process::ProcState;
use crate::syscall::{return_value, sys_page_alloc, Syscall};
use abyss::interrupt::{Registers, Vector, PFERR_PRESENT, PFERR_USER, PFERR_WRITE};

impl<L: ProgramLoader> Kernel<L> {
    fn save(&mut self, regs: Registers) {
        self.procs[self.current].regs = regs;
    }

    fn resume(&mut self) -> Resume {
        if self.procs[self.current].state == ProcState::Runnable {
            Resume::Run(self.current)
        } else {
            self.schedule()
        }
    }

    fn memshow(&mut self) {
        self.memshow
            .update(self.ticks, &self.mm, &self.kernel_pagetable, &self.procs);
    }

    /// Handle an exception or an interrupt of the current process.
    ///
    /// # Panics
    /// Kernel page faults and unexpected exceptions halt the kernel.
    pub fn exception(&mut self, regs: Registers) -> Resume {
        self.save(regs);
        let vector = regs.trap();
        if vector != Some(Vector::PageFault) || regs.error_code & PFERR_USER != 0 {
            self.memshow();
        }

        match vector {
            Some(Vector::Timer) => {
                self.ticks += 1;
                self.lapic.ack();
                return self.schedule();
            }
            Some(Vector::PageFault) => {
                let addr = self.cpu.cr2;
                let operation = if regs.error_code & PFERR_WRITE != 0 {
                    "write"
                } else {
                    "read"
                };
                let problem = if regs.error_code & PFERR_PRESENT != 0 {
                    "protection problem"
                } else {
                    "missing page"
                };
                if regs.error_code & PFERR_USER == 0 {
                    panic!(
                        "Kernel page fault for {:#x} ({} {}, rip={:#x})!",
                        addr, operation, problem, regs.rip
                    );
                }
                warning!(
                    "Process {} page fault for {:#x} ({} {}, rip={:#x})!",
                    self.current,
                    addr,
                    operation,
                    problem,
                    regs.rip
                );
                self.procs[self.current].state = ProcState::Broken;
            }
            _ => panic!("Unexpected exception {}!", regs.vector),
        }
        self.resume()
    }

    /// Handle a system call of the current process.
    ///
    /// # Panics
    /// `PANIC` and unknown system calls halt the kernel.
    pub fn syscall(&mut self, regs: Registers) -> Resume {
        self.save(regs);
        self.memshow();

        let pid = self.current;
        let Some(call) = Syscall::resolve(&regs) else {
            panic!("Unexpected system call {}!", regs.gprs.rax);
        };
        let ret = match call {
            Syscall::Panic => panic!("process {} panicked", pid),
            Syscall::Getpid => pid,
            Syscall::Yield => {
                self.procs[pid].regs.gprs.rax = 0;
                return self.schedule();
            }
            Syscall::PageAlloc { addr } => {
                let Some(pt) = self.procs[pid].pagetable.as_mut() else {
                    panic!("syscall: process {} has no address space", pid);
                };
                return_value(sys_page_alloc(&mut self.mm, pt, addr).map(|_| 0))
            }
            Syscall::Fork => return_value(
                fork(&mut self.mm, &mut self.procs, pid)
                    .map_err(|e| warning!("process {}: fork failed: {:?}", pid, e)),
            ),
            Syscall::Exit => {
                self.procs[pid].teardown(&mut self.mm);
                info!("process {}: exited", pid);
                return self.schedule();
            }
        };
        self.procs[pid].regs.gprs.rax = ret;
        self.resume()
    }
}
