//! Assembler for the user-mode instruction set.
use super::isa::{Instruction, Opcode, Reg, INSTRUCTION_SIZE};
use alloc::vec::Vec;

/// A branch target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// Builds program text, resolving labels on [`finish`].
///
/// [`finish`]: Assembler::finish
#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next instruction.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Create a label that is not bound yet.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction.
    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.here());
    }

    fn emit(&mut self, op: Opcode, a: Reg, b: Reg, imm: i32) -> &mut Self {
        self.code
            .extend_from_slice(&Instruction { op, a, b, imm }.encode());
        self
    }

    fn branch(&mut self, op: Opcode, a: Reg, b: Reg, target: Label) -> &mut Self {
        self.fixups.push((self.here(), target));
        self.emit(op, a, b, 0)
    }

    pub fn movi(&mut self, dst: Reg, imm: i32) -> &mut Self {
        self.emit(Opcode::Movi, dst, Reg::Rax, imm)
    }

    pub fn mov(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.emit(Opcode::Mov, dst, src, 0)
    }

    pub fn addi(&mut self, dst: Reg, imm: i32) -> &mut Self {
        self.emit(Opcode::Addi, dst, Reg::Rax, imm)
    }

    pub fn add(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.emit(Opcode::Add, dst, src, 0)
    }

    pub fn sub(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.emit(Opcode::Sub, dst, src, 0)
    }

    /// dst = u64 [base + off]
    pub fn load(&mut self, dst: Reg, base: Reg, off: i32) -> &mut Self {
        self.emit(Opcode::Load, dst, base, off)
    }

    /// u64 [base + off] = src
    pub fn store(&mut self, base: Reg, off: i32, src: Reg) -> &mut Self {
        self.emit(Opcode::Store, base, src, off)
    }

    /// dst = u8 [base + off]
    pub fn load_byte(&mut self, dst: Reg, base: Reg, off: i32) -> &mut Self {
        self.emit(Opcode::LoadByte, dst, base, off)
    }

    /// u8 [base + off] = src
    pub fn store_byte(&mut self, base: Reg, off: i32, src: Reg) -> &mut Self {
        self.emit(Opcode::StoreByte, base, src, off)
    }

    pub fn jmp(&mut self, target: Label) -> &mut Self {
        self.branch(Opcode::Jmp, Reg::Rax, Reg::Rax, target)
    }

    pub fn jeq(&mut self, a: Reg, b: Reg, target: Label) -> &mut Self {
        self.branch(Opcode::Jeq, a, b, target)
    }

    pub fn jne(&mut self, a: Reg, b: Reg, target: Label) -> &mut Self {
        self.branch(Opcode::Jne, a, b, target)
    }

    /// Signed less-than branch.
    pub fn jlt(&mut self, a: Reg, b: Reg, target: Label) -> &mut Self {
        self.branch(Opcode::Jlt, a, b, target)
    }

    pub fn syscall(&mut self) -> &mut Self {
        self.emit(Opcode::Syscall, Reg::Rax, Reg::Rax, 0)
    }

    /// Resolve every branch and return the program text.
    ///
    /// # Panics
    /// Panics if a branch refers to a label that was never bound.
    pub fn finish(mut self) -> Vec<u8> {
        for (at, label) in core::mem::take(&mut self.fixups) {
            let target = match self.labels[label.0] {
                Some(target) => target,
                None => panic!("unbound label {:?}", label),
            };
            let rel = target as i64 - (at + INSTRUCTION_SIZE) as i64;
            self.code[at + 4..at + 8].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.code
    }
}
