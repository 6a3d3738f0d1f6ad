//! Interrupt
//!
//! When the cpu traps into the kernel, the state of the interrupted user
//! context is saved in [`Registers`] and the reason is recorded in its
//! `vector` (and `error_code`).
use crate::x86_64::PrivilegeLevel;
use num_enum::TryFromPrimitive;

/// Page-fault error code: the fault was a protection violation on a present page.
pub const PFERR_PRESENT: u64 = 0x1;
/// Page-fault error code: the faulting access was a write.
pub const PFERR_WRITE: u64 = 0x2;
/// Page-fault error code: the faulting access was made in user mode.
pub const PFERR_USER: u64 = 0x4;

/// Base vector of the external interrupts.
pub const INT_IRQ: u8 = 32;
/// Irq line of the local apic timer.
pub const IRQ_TIMER: u8 = 0;

/// Exception vector enumeration of the x86_64.
///
/// See Intel 64 and IA-32 Architectures Software Developer’s Manual, Volume
/// 3A: System Programming Guide, Part 1, Chapter 6.15.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum Vector {
    /// Interrupt 0 - Divide Error Exception (#DE)
    DivideError = 0,
    /// Interrupt 1 - Debug Exception (#DB)
    Debug = 1,
    /// Interrupt 2 - NonMaskableInterrupt Interrupt
    NonMaskableInterrupt = 2,
    /// Interrupt 3 - Breakpoint Exception (#BP)
    Breakpoint = 3,
    /// Interrupt 4 - Overflow Exception (#OF)
    OverflowException = 4,
    /// Interrupt 5 - Bound Range Exceeded Exception (#BR)
    BoundRangeExceeded = 5,
    /// Interrupt 6 - Invalid Opcode Exception (#UD)
    InvalidOpcode = 6,
    /// Interrupt 7 - Device Not Available Exception (#NM)
    DeviceNotAvailable = 7,
    /// Interrupt 8 - Double Fault Exception (#DF)
    DoubleFault = 8,
    /// Interrupt 13 - General Protection Exception (#GP)
    GeneralProtection = 13,
    /// Interrupt 14 - Page-Fault Exception (#PF)
    PageFault = 14,
    /// Interrupt 32 - Local apic timer.
    Timer = 32,
    /// Interrupt 48 - System call.
    Syscall = 48,
}

/// X86_64 general purpose registers
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rbx: usize,
    pub rax: usize,
}

/// Saved state of a user context.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub gprs: GeneralPurposeRegisters,
    /// Vector of the last trap.
    pub vector: u8,
    /// Error code of the last trap.
    pub error_code: u64,
    pub rip: usize,
    pub cs: u16,
    pub rflags: u64,
    pub rsp: usize,
    pub ss: u16,
}

impl Registers {
    /// User code segment selector (ring 3).
    pub const USER_CS: u16 = 0x18 | 3;
    /// User data segment selector (ring 3).
    pub const USER_SS: u16 = 0x20 | 3;
    /// Initial rflags of a user context: IF and the reserved bit 1.
    pub const USER_RFLAGS: u64 = (1 << 9) | (1 << 1);

    /// Create a register set for a new user context.
    #[inline]
    pub fn new_user(rip: usize, rsp: usize) -> Self {
        Self {
            rip,
            rsp,
            cs: Self::USER_CS,
            ss: Self::USER_SS,
            rflags: Self::USER_RFLAGS,
            ..Default::default()
        }
    }

    /// Decode the vector of the last trap.
    #[inline]
    pub fn trap(&self) -> Option<Vector> {
        Vector::try_from(self.vector).ok()
    }

    /// Returns true if the saved context was running in user mode.
    #[inline]
    pub fn is_user(&self) -> bool {
        PrivilegeLevel::of_selector(self.cs) == PrivilegeLevel::Ring3
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        writeln!(
            f,
            "RAX: {:016x} | RBX: {:016x}  | RCX: {:016x} | RDX: {:016x}\n\
             RSI: {:016x} | RDI: {:016x}  | RBP: {:016x} | RSP: {:016x}\n\
             R8 : {:016x} | R9 : {:016x}  | R10: {:016x} | R11: {:016x}\n\
             R12: {:016x} | R13: {:016x}  | R14: {:016x} | R15: {:016x}\n\
             RIP: {:016x} | RFLAGS: {:016x} | VECTOR: {} | ERR: {:#x}",
            self.gprs.rax,
            self.gprs.rbx,
            self.gprs.rcx,
            self.gprs.rdx,
            self.gprs.rsi,
            self.gprs.rdi,
            self.gprs.rbp,
            self.rsp,
            self.gprs.r8,
            self.gprs.r9,
            self.gprs.r10,
            self.gprs.r11,
            self.gprs.r12,
            self.gprs.r13,
            self.gprs.r14,
            self.gprs.r15,
            self.rip,
            self.rflags,
            self.vector,
            self.error_code,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_vector() {
        let mut regs = Registers::new_user(0x10_0000, 0x30_0000);
        assert!(regs.is_user());
        regs.vector = 14;
        assert_eq!(regs.trap(), Some(Vector::PageFault));
        regs.vector = 32;
        assert_eq!(regs.trap(), Some(Vector::Timer));
        regs.vector = 200;
        assert_eq!(regs.trap(), None);
    }
}
