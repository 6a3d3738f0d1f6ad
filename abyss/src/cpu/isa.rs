//! Instruction set of the user-mode cpu.
//!
//! Every instruction is 8 bytes wide:
//! ```text
//! +--------+--------+--------+--------+--------------------------------+
//! | opcode |   a    |   b    |  zero  |     imm (i32, little endian)   |
//! +--------+--------+--------+--------+--------------------------------+
//! ```
//! Branch targets are relative to the next instruction.
use crate::interrupt::Registers;
use num_enum::TryFromPrimitive;

/// Width of an instruction in bytes.
pub const INSTRUCTION_SIZE: usize = 8;

/// Opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// a = sign_extend(imm)
    Movi = 0x01,
    /// a = b
    Mov = 0x02,
    /// a = a + sign_extend(imm)
    Addi = 0x03,
    /// a = a + b
    Add = 0x04,
    /// a = u64 [b + imm]
    Load = 0x05,
    /// u64 [a + imm] = b
    Store = 0x06,
    /// u8 [a + imm] = b
    StoreByte = 0x07,
    /// a = u8 [b + imm]
    LoadByte = 0x08,
    /// rip = next + imm
    Jmp = 0x09,
    /// if a == b { rip = next + imm }
    Jeq = 0x0a,
    /// if a != b { rip = next + imm }
    Jne = 0x0b,
    /// if (a as isize) < (b as isize) { rip = next + imm }
    Jlt = 0x0c,
    /// a = a - b
    Sub = 0x0d,
    /// Enter the kernel. rax holds the system call number.
    Syscall = 0x0f,
}

/// General purpose registers, in x86_64 encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Read the register from the saved state.
    pub fn read(self, regs: &Registers) -> usize {
        let g = &regs.gprs;
        match self {
            Reg::Rax => g.rax,
            Reg::Rcx => g.rcx,
            Reg::Rdx => g.rdx,
            Reg::Rbx => g.rbx,
            Reg::Rsp => regs.rsp,
            Reg::Rbp => g.rbp,
            Reg::Rsi => g.rsi,
            Reg::Rdi => g.rdi,
            Reg::R8 => g.r8,
            Reg::R9 => g.r9,
            Reg::R10 => g.r10,
            Reg::R11 => g.r11,
            Reg::R12 => g.r12,
            Reg::R13 => g.r13,
            Reg::R14 => g.r14,
            Reg::R15 => g.r15,
        }
    }

    /// Write the register into the saved state.
    pub fn write(self, regs: &mut Registers, v: usize) {
        let g = &mut regs.gprs;
        let slot = match self {
            Reg::Rax => &mut g.rax,
            Reg::Rcx => &mut g.rcx,
            Reg::Rdx => &mut g.rdx,
            Reg::Rbx => &mut g.rbx,
            Reg::Rsp => &mut regs.rsp,
            Reg::Rbp => &mut g.rbp,
            Reg::Rsi => &mut g.rsi,
            Reg::Rdi => &mut g.rdi,
            Reg::R8 => &mut g.r8,
            Reg::R9 => &mut g.r9,
            Reg::R10 => &mut g.r10,
            Reg::R11 => &mut g.r11,
            Reg::R12 => &mut g.r12,
            Reg::R13 => &mut g.r13,
            Reg::R14 => &mut g.r14,
            Reg::R15 => &mut g.r15,
        };
        *slot = v;
    }
}

/// A decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub a: Reg,
    pub b: Reg,
    pub imm: i32,
}

impl Instruction {
    /// Decode an instruction. Returns `None` for an undefined encoding.
    pub fn decode(raw: &[u8; INSTRUCTION_SIZE]) -> Option<Self> {
        if raw[3] != 0 {
            return None;
        }
        Some(Self {
            op: Opcode::try_from(raw[0]).ok()?,
            a: Reg::try_from(raw[1]).ok()?,
            b: Reg::try_from(raw[2]).ok()?,
            imm: i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        })
    }

    /// Encode an instruction.
    pub fn encode(&self) -> [u8; INSTRUCTION_SIZE] {
        let imm = self.imm.to_le_bytes();
        [
            self.op as u8,
            self.a as u8,
            self.b as u8,
            0,
            imm[0],
            imm[1],
            imm[2],
            imm[3],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_encodings() {
        assert_eq!(Instruction::decode(&[0; 8]), None);
        assert_eq!(Instruction::decode(&[0xcc; 8]), None);
        // register out of range
        assert_eq!(Instruction::decode(&[0x01, 16, 0, 0, 0, 0, 0, 0]), None);
        // reserved byte
        assert_eq!(Instruction::decode(&[0x01, 0, 0, 1, 0, 0, 0, 0]), None);
    }

    #[test]
    fn negative_immediate() {
        let insn = Instruction {
            op: Opcode::Jmp,
            a: Reg::Rax,
            b: Reg::Rax,
            imm: -16,
        };
        let raw = insn.encode();
        assert_eq!(&raw[4..], &[0xf0, 0xff, 0xff, 0xff]);
        assert_eq!(Instruction::decode(&raw), Some(insn));
    }

    #[test]
    fn register_file() {
        let mut regs = Registers::default();
        Reg::Rsp.write(&mut regs, 0x30_0000);
        Reg::R13.write(&mut regs, 7);
        assert_eq!(regs.rsp, 0x30_0000);
        assert_eq!(regs.gprs.r13, 7);
        assert_eq!(Reg::Rsp.read(&regs), 0x30_0000);
    }
}
