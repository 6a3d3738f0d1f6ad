//! Memory layout and kernel configuration.
//!
//! ```text
//!  physical / kernel virtual (identity)          process virtual
//!  0x000000 +------------------+                 +------------------+ 0x000000
//!           | reserved (null)  |                 | unmapped (null)  |
//!  0x001000 +------------------+                 +------------------+ 0x001000
//!           | boot reserved    |                 |                  |
//!  0x040000 +------------------+                 |  kernel mappings |
//!           | kernel text/data |                 |  (not user)      |
//!  0x080000 +------------------+ stack top       |                  |
//!           | kernel reserved  |                 |                  |
//!  0x0a0000 +------------------+                 |                  |
//!           | i/o hole         |  0x0b8000       |  console (user)  |
//!  0x100000 +------------------+                 +------------------+ 0x100000
//!           | allocatable      |                 | program, heap    |
//!  0x200000 +------------------+                 |        ...       |
//!                                                | stack page       |
//!                                                +------------------+ 0x300000
//! ```
use abyss::addressing::Va;

pub use abyss::addressing::PAGE_SIZE;

/// Size of the physical memory.
pub const MEMSIZE_PHYSICAL: usize = 0x200000;
/// Size of a process virtual address space.
pub const MEMSIZE_VIRTUAL: usize = 0x300000;

/// Start of the kernel image.
pub const KERNEL_START_ADDR: usize = 0x40000;
/// Top of the kernel stack.
pub const KERNEL_STACK_TOP: usize = 0x80000;
/// Start of the i/o hole.
pub const IO_HOLE_START: usize = 0xa0000;
/// Address of the console, mapped user-writable in every address space.
pub const CONSOLE_ADDR: usize = 0xb8000;
/// First user address of a process.
pub const PROC_START_ADDR: usize = 0x100000;
/// First physical address handed out by the page allocator.
pub const ALLOCATABLE_START: usize = 0x100000;

/// Number of process slots. Slot 0 is never used.
pub const NPROC: usize = 16;
/// Timer interrupts per second.
pub const HZ: usize = 100;

/// Byte pattern of a freshly allocated page.
pub const ALLOC_FILL: u8 = 0xcc;
/// Idle spins between two redraws of the memory viewer.
pub const IDLE_REDRAW_SPINS: usize = 1 << 12;

/// Programs loaded at boot when no program is requested.
pub const DEFAULT_PROGRAMS: [&str; 4] = ["allocator", "allocator2", "allocator3", "allocator4"];

/// Virtual address of the low half. Every address of the layout is one.
///
/// # Panics
/// Panics if `addr` is not canonical.
pub const fn va(addr: usize) -> Va {
    match Va::new(addr) {
        Some(va) => va,
        None => panic!("non-canonical address"),
    }
}
