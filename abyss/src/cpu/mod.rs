//! User-mode cpu.
//!
//! The cpu executes user programs out of physical memory through the page
//! table rooted at `cr3`, always with user privilege. It runs until the
//! context traps: a `syscall`, a page fault, an undefined instruction, or an
//! interrupt from the local apic timer.
use crate::addressing::{Pa, Va};
use crate::dev::Lapic;
use crate::interrupt::{Registers, Vector};
use crate::memory::PhysicalMemory;
use crate::x86_64::page_table::{translate, Access};

pub mod asm;
pub mod isa;

use isa::{Instruction, Opcode, INSTRUCTION_SIZE};

/// State of the processor visible to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Cpu {
    /// Root of the active page table.
    pub cr3: Pa,
    /// Faulting address of the last page fault.
    pub cr2: usize,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            cr3: Pa::ZERO,
            cr2: 0,
        }
    }

    /// Load `pa` as the root of the page table.
    #[inline]
    pub fn set_cr3(&mut self, pa: Pa) {
        self.cr3 = pa;
    }

    /// Run the user context `regs` until it traps.
    ///
    /// Returns the trap vector, which is also recorded in `regs.vector`. On a
    /// page fault, `cr2` holds the faulting address and `regs.error_code` the
    /// error code. Faulting instructions are not retired; `syscall` is.
    pub fn run(&mut self, mem: &mut PhysicalMemory, regs: &mut Registers, lapic: &mut Lapic) -> Vector {
        let vector = loop {
            if lapic.tick() {
                break Vector::Timer;
            }
            if let Err(v) = self.step(mem, regs) {
                break v;
            }
        };
        regs.vector = vector as u8;
        vector
    }

    fn translate(
        &mut self,
        mem: &PhysicalMemory,
        regs: &mut Registers,
        va: usize,
        access: Access,
    ) -> Result<Pa, Vector> {
        let va = Va::new(va).ok_or(Vector::GeneralProtection)?;
        translate(mem, self.cr3, va, access, true).map_err(|errcode| {
            self.cr2 = va.into_usize();
            regs.error_code = errcode;
            Vector::PageFault
        })
    }

    fn read(
        &mut self,
        mem: &PhysicalMemory,
        regs: &mut Registers,
        va: usize,
        buf: &mut [u8],
        access: Access,
    ) -> Result<(), Vector> {
        for (i, b) in buf.iter_mut().enumerate() {
            let pa = self.translate(mem, regs, va.wrapping_add(i), access)?;
            *b = mem.read_u8(pa);
        }
        Ok(())
    }

    fn write(
        &mut self,
        mem: &mut PhysicalMemory,
        regs: &mut Registers,
        va: usize,
        data: &[u8],
    ) -> Result<(), Vector> {
        // Check every byte before touching memory so a fault leaves nothing behind.
        let mut pas = [Pa::ZERO; 8];
        for (i, pa) in pas.iter_mut().take(data.len()).enumerate() {
            *pa = self.translate(mem, regs, va.wrapping_add(i), Access::Write)?;
        }
        for (pa, b) in pas.iter().zip(data) {
            mem.write_u8(*pa, *b);
        }
        Ok(())
    }

    fn step(&mut self, mem: &mut PhysicalMemory, regs: &mut Registers) -> Result<(), Vector> {
        let rip = regs.rip;
        let mut raw = [0; INSTRUCTION_SIZE];
        self.read(mem, regs, rip, &mut raw, Access::Execute)?;
        let Instruction { op, a, b, imm } =
            Instruction::decode(&raw).ok_or(Vector::InvalidOpcode)?;

        let (va, vb) = (a.read(regs), b.read(regs));
        let disp = imm as isize as usize;
        let next = rip.wrapping_add(INSTRUCTION_SIZE);
        let target = next.wrapping_add(disp);
        let mut rip = next;
        match op {
            Opcode::Movi => a.write(regs, disp),
            Opcode::Mov => a.write(regs, vb),
            Opcode::Addi => a.write(regs, va.wrapping_add(disp)),
            Opcode::Add => a.write(regs, va.wrapping_add(vb)),
            Opcode::Sub => a.write(regs, va.wrapping_sub(vb)),
            Opcode::Load => {
                let mut v = [0; 8];
                self.read(mem, regs, vb.wrapping_add(disp), &mut v, Access::Read)?;
                a.write(regs, u64::from_le_bytes(v) as usize);
            }
            Opcode::LoadByte => {
                let mut v = [0; 1];
                self.read(mem, regs, vb.wrapping_add(disp), &mut v, Access::Read)?;
                a.write(regs, v[0] as usize);
            }
            Opcode::Store => {
                self.write(mem, regs, va.wrapping_add(disp), &(vb as u64).to_le_bytes())?
            }
            Opcode::StoreByte => self.write(mem, regs, va.wrapping_add(disp), &[vb as u8])?,
            Opcode::Jmp => rip = target,
            Opcode::Jeq if va == vb => rip = target,
            Opcode::Jne if va != vb => rip = target,
            Opcode::Jlt if (va as isize) < (vb as isize) => rip = target,
            Opcode::Jeq | Opcode::Jne | Opcode::Jlt => (),
            Opcode::Syscall => {
                regs.rip = next;
                return Err(Vector::Syscall);
            }
        }
        regs.rip = rip;
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
