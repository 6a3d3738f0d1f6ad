//! System calls.
//!
//! A process requests a system call with the `syscall` instruction.
//! %rax holds the system call number, %rdi the argument. The result is
//! returned in %rax; failures are reported as -1.
//!
//! | number | call         | argument          | returns                       |
//! |--------|--------------|-------------------|-------------------------------|
//! | 1      | `GETPID`     |                   | pid of the caller             |
//! | 2      | `YIELD`      |                   | 0                             |
//! | 3      | `PANIC`      |                   | never                         |
//! | 4      | `PAGE_ALLOC` | page-aligned addr | 0 or -1                       |
//! | 5      | `FORK`       |                   | child pid, 0 in child, or -1  |
//! | 6      | `EXIT`       |                   | never                         |
use crate::addressing::{Va, PAGE_SIZE};
use crate::layout::{CONSOLE_ADDR, MEMSIZE_VIRTUAL, PROC_START_ADDR};
use crate::mm::page_table::{PageTable, PageTableMappingError, Permission};
use crate::mm::PhysicalAllocator;
use abyss::interrupt::Registers;
use num_enum::TryFromPrimitive;

/// System call numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// `GETPID`
    Getpid = 1,
    /// `YIELD`
    Yield = 2,
    /// `PANIC`
    Panic = 3,
    /// `PAGE_ALLOC`
    PageAlloc = 4,
    /// `FORK`
    Fork = 5,
    /// `EXIT`
    Exit = 6,
}

/// Value of %rax reporting a failure to the process.
pub const SYSCALL_ERROR: usize = usize::MAX;

/// Supported system calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    /// Get the pid of the caller.
    Getpid,
    /// Give up the cpu.
    Yield,
    /// Halt the kernel.
    Panic,
    /// Map a fresh zeroed page at `addr`.
    PageAlloc {
        /// Virtual address to map. Provides on rdi.
        addr: usize,
    },
    /// Duplicate the caller.
    Fork,
    /// Terminate the caller and reclaim its resources.
    Exit,
}

impl Syscall {
    /// Decode the system call requested by the saved registers `regs`.
    ///
    /// Returns None if the number is unknown.
    pub fn resolve(regs: &Registers) -> Option<Self> {
        let number = SyscallNumber::try_from(regs.gprs.rax).ok()?;
        Some(match number {
            SyscallNumber::Getpid => Self::Getpid,
            SyscallNumber::Yield => Self::Yield,
            SyscallNumber::Panic => Self::Panic,
            SyscallNumber::PageAlloc => Self::PageAlloc {
                addr: regs.gprs.rdi,
            },
            SyscallNumber::Fork => Self::Fork,
            SyscallNumber::Exit => Self::Exit,
        })
    }
}

/// A list specifying categories of `PAGE_ALLOC` error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageAllocError {
    /// The address is not page-aligned.
    Unaligned,
    /// The address is neither in the user region nor the console.
    OutOfRange,
    /// No physical page is left.
    OutOfMemory,
}

impl From<PageTableMappingError> for PageAllocError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::Unaligned => Self::Unaligned,
            PageTableMappingError::InvalidAddress => Self::OutOfRange,
            _ => Self::OutOfMemory,
        }
    }
}

/// Map a fresh zeroed page at `addr` in `pt`.
///
/// A page already mapped at `addr` is released. On failure `pt` is left as
/// it was.
pub fn sys_page_alloc(
    mm: &mut PhysicalAllocator,
    pt: &mut PageTable,
    addr: usize,
) -> Result<(), PageAllocError> {
    if addr % PAGE_SIZE != 0 {
        return Err(PageAllocError::Unaligned);
    }
    if (addr < PROC_START_ADDR || addr >= MEMSIZE_VIRTUAL) && addr != CONSOLE_ADDR {
        return Err(PageAllocError::OutOfRange);
    }
    let va = Va::new(addr).ok_or(PageAllocError::OutOfRange)?;
    let page = mm.alloc_zeroed().ok_or(PageAllocError::OutOfMemory)?;
    if let Some(old) = pt.replace(mm, va, page, Permission::USER_RW)? {
        mm.release(old);
    }
    Ok(())
}

/// Translate the result of a system call into the value of %rax.
#[inline]
pub fn return_value<E>(r: Result<usize, E>) -> usize {
    r.unwrap_or(SYSCALL_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{va, MEMSIZE_PHYSICAL};
    use abyss::memory::PhysicalMemory;

    fn setup() -> (PhysicalAllocator, PageTable) {
        let mut mm = PhysicalAllocator::new(PhysicalMemory::new(MEMSIZE_PHYSICAL));
        let pt = PageTable::new(&mut mm).unwrap();
        (mm, pt)
    }

    #[test]
    fn resolve() {
        let mut regs = Registers::default();
        regs.gprs.rax = 4;
        regs.gprs.rdi = 0x123000;
        assert_eq!(
            Syscall::resolve(&regs),
            Some(Syscall::PageAlloc { addr: 0x123000 })
        );
        regs.gprs.rax = 6;
        assert_eq!(Syscall::resolve(&regs), Some(Syscall::Exit));
        regs.gprs.rax = 0;
        assert_eq!(Syscall::resolve(&regs), None);
        regs.gprs.rax = 7;
        assert_eq!(Syscall::resolve(&regs), None);
    }

    #[test]
    fn page_alloc_validation() {
        let (mut mm, mut pt) = setup();
        let free = mm.free_pages();
        for (addr, e) in [
            (PROC_START_ADDR + 1, PageAllocError::Unaligned),
            (0, PageAllocError::OutOfRange),
            (PROC_START_ADDR - PAGE_SIZE, PageAllocError::OutOfRange),
            (MEMSIZE_VIRTUAL, PageAllocError::OutOfRange),
            (usize::MAX & !0xfff, PageAllocError::OutOfRange),
        ] {
            assert_eq!(sys_page_alloc(&mut mm, &mut pt, addr), Err(e));
        }
        assert_eq!(mm.free_pages(), free);
        assert!(pt.mappings(&mm, 0..MEMSIZE_VIRTUAL).is_empty());
    }

    #[test]
    fn page_alloc_replaces() {
        let (mut mm, mut pt) = setup();
        let addr = MEMSIZE_VIRTUAL - 2 * PAGE_SIZE;
        assert_eq!(sys_page_alloc(&mut mm, &mut pt, addr), Ok(()));
        pt.write_bytes(&mut mm, va(addr), &[7; 16]).unwrap();
        let old = pt.walk(&mm, va(addr)).unwrap().pa().unwrap();
        let free = mm.free_pages();

        assert_eq!(sys_page_alloc(&mut mm, &mut pt, addr), Ok(()));
        let new = pt.walk(&mm, va(addr)).unwrap().pa().unwrap();
        assert_eq!(mm.refcount(old), 0);
        assert_eq!(mm.free_pages(), free);
        let mut buf = [1u8; 16];
        pt.read_bytes(&mm, va(addr), &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
        assert_eq!(mm.refcount(new), 1);

        // The console is the only address allowed below the user region.
        assert_eq!(sys_page_alloc(&mut mm, &mut pt, CONSOLE_ADDR), Ok(()));
    }

    #[test]
    fn page_alloc_out_of_memory() {
        let (mut mm, mut pt) = setup();
        let mut hog = Vec::new();
        while let Some(page) = mm.alloc(PAGE_SIZE) {
            hog.push(page);
        }
        assert_eq!(
            sys_page_alloc(&mut mm, &mut pt, PROC_START_ADDR),
            Err(PageAllocError::OutOfMemory)
        );
        assert_eq!(return_value(Err::<usize, _>(PageAllocError::OutOfMemory)), usize::MAX);
        for page in hog {
            mm.release(page);
        }
    }
}
