//! User programs.
//!
//! Programs are written with the [`Assembler`] of the machine. They talk to
//! the kernel only through system calls: %rax holds the number, %rdi the
//! argument, and the result comes back in %rax.
//!
//! Register conventions used below: `r12` holds the pid, `rbx` the top of the
//! heap, `r13` the bottom of the stack, `r14` the page size and `r15` zero.
use abyss::cpu::asm::{Assembler, Label};
use abyss::cpu::isa::Reg;
use keos::addressing::PAGE_SIZE;
use keos::layout::{CONSOLE_ADDR, PROC_START_ADDR};
use keos::loader::{Program, Segment, STACK_PAGE};
use keos::syscall::SyscallNumber;

/// Text address of the `n`th program slot. Each slot spans 256 KiB.
pub const fn text_addr(n: usize) -> usize {
    PROC_START_ADDR + n * 0x40000
}

/// First heap page of a program whose text is at `text`.
pub const fn heap_addr(text: usize) -> usize {
    text + PAGE_SIZE
}

fn imm(v: usize) -> i32 {
    match i32::try_from(v) {
        Ok(v) => v,
        Err(_) => panic!("immediate {:#x} does not fit", v),
    }
}

trait SyscallExt {
    fn sys(&mut self, number: SyscallNumber) -> &mut Self;
    fn sys_with(&mut self, number: SyscallNumber, arg: Reg) -> &mut Self;
}

impl SyscallExt for Assembler {
    fn sys(&mut self, number: SyscallNumber) -> &mut Self {
        self.movi(Reg::Rax, number as i32).syscall()
    }

    fn sys_with(&mut self, number: SyscallNumber, arg: Reg) -> &mut Self {
        self.mov(Reg::Rdi, arg).sys(number)
    }
}

fn program(name: &str, text: usize, asm: Assembler) -> Program {
    let data = asm.finish();
    assert!(data.len() <= PAGE_SIZE, "{}: text does not fit a page", name);
    Program {
        name: name.into(),
        entry: text,
        segments: vec![Segment {
            va: text,
            size: PAGE_SIZE,
            data,
            writable: false,
        }],
    }
}

// Set up the allocator registers for a heap starting at `heap`.
fn prologue(asm: &mut Assembler, heap: usize) {
    asm.sys(SyscallNumber::Getpid)
        .mov(Reg::R12, Reg::Rax)
        .movi(Reg::Rbx, imm(heap))
        .movi(Reg::R13, imm(STACK_PAGE))
        .movi(Reg::R14, imm(PAGE_SIZE))
        .movi(Reg::R15, 0);
}

// Allocate pages upward from the heap top until the stack or the first
// failure, writing the pid into each page and yielding `yields` times in
// between. Jumps to `done` when finished.
fn allocate_loop(asm: &mut Assembler, yields: usize, limit: Option<usize>, done: Label) {
    if let Some(limit) = limit {
        asm.movi(Reg::R11, imm(limit));
    }
    let top = asm.label();
    asm.bind(top);
    asm.jeq(Reg::Rbx, Reg::R13, done);
    if limit.is_some() {
        asm.jeq(Reg::R11, Reg::R15, done).addi(Reg::R11, -1);
    }
    asm.sys_with(SyscallNumber::PageAlloc, Reg::Rbx)
        .jne(Reg::Rax, Reg::R15, done)
        .store(Reg::Rbx, 0, Reg::R12)
        .add(Reg::Rbx, Reg::R14);
    for _ in 0..yields {
        asm.sys(SyscallNumber::Yield);
    }
    asm.jmp(top);
}

// Yield forever.
fn spin(asm: &mut Assembler) {
    let top = asm.label();
    asm.bind(top);
    asm.sys(SyscallNumber::Yield).jmp(top);
}

/// `allocator`, `allocator2`, ...: allocate the heap page by page, then yield
/// forever. The `n`th allocator yields `n` times between two allocations.
pub fn allocator(name: &str, n: usize) -> Program {
    let text = text_addr(n - 1);
    let mut asm = Assembler::new();
    let done = asm.label();
    prologue(&mut asm, heap_addr(text));
    allocate_loop(&mut asm, n, None, done);
    asm.bind(done);
    spin(&mut asm);
    program(name, text, asm)
}

/// `fork`: fork twice, then allocate like `allocator` in all four processes.
pub fn fork() -> Program {
    let text = text_addr(0);
    let mut asm = Assembler::new();
    let done = asm.label();
    asm.sys(SyscallNumber::Fork).sys(SyscallNumber::Fork);
    prologue(&mut asm, heap_addr(text));
    allocate_loop(&mut asm, 1, None, done);
    asm.bind(done);
    spin(&mut asm);
    program("fork", text, asm)
}

/// `forkexit`: fork children forever. Each child allocates a few pages and
/// exits.
pub fn forkexit() -> Program {
    let text = text_addr(0);
    let mut asm = Assembler::new();
    let (top, child, done) = (asm.label(), asm.label(), asm.label());
    asm.movi(Reg::R15, 0);
    asm.bind(top);
    asm.sys(SyscallNumber::Fork)
        .jeq(Reg::Rax, Reg::R15, child)
        .sys(SyscallNumber::Yield)
        .jmp(top);
    asm.bind(child);
    prologue(&mut asm, heap_addr(text));
    allocate_loop(&mut asm, 1, Some(3), done);
    asm.bind(done);
    asm.sys(SyscallNumber::Exit);
    program("forkexit", text, asm)
}

/// `forkbomb`: every process forks forever.
pub fn forkbomb() -> Program {
    let text = text_addr(0);
    let mut asm = Assembler::new();
    let top = asm.label();
    asm.bind(top);
    asm.sys(SyscallNumber::Fork)
        .sys(SyscallNumber::Yield)
        .jmp(top);
    program("forkbomb", text, asm)
}

/// `null_deref`: read address 0.
pub fn null_deref() -> Program {
    let mut asm = Assembler::new();
    asm.movi(Reg::Rbx, 0).load(Reg::Rax, Reg::Rbx, 0);
    spin(&mut asm);
    program("null_deref", text_addr(0), asm)
}

/// `text_write`: write to its own read-only text.
pub fn text_write() -> Program {
    let text = text_addr(0);
    let mut asm = Assembler::new();
    asm.movi(Reg::Rbx, imm(text))
        .movi(Reg::Rcx, 0x41)
        .store_byte(Reg::Rbx, 0, Reg::Rcx);
    spin(&mut asm);
    program("text_write", text, asm)
}

/// `console`: write the pid to the console, then allocate a private console
/// page over it and write again.
pub fn console() -> Program {
    let text = text_addr(0);
    let mut asm = Assembler::new();
    asm.sys(SyscallNumber::Getpid)
        .mov(Reg::R12, Reg::Rax)
        .movi(Reg::Rbx, imm(CONSOLE_ADDR))
        .store(Reg::Rbx, 0, Reg::R12)
        .sys_with(SyscallNumber::PageAlloc, Reg::Rbx)
        .store(Reg::Rbx, 8, Reg::R12);
    spin(&mut asm);
    program("console", text, asm)
}
