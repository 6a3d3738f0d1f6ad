//! A small multi-process kernel.
//!
//! The kernel runs user processes on the machine modeled by [`abyss`]. Each
//! process owns a 4-level page table; physical pages are reference counted so
//! that address spaces can share them. Processes are created by the loader or
//! by `fork`, scheduled round-robin on timer interrupts, and reach the kernel
//! through system calls and faults.
//!
//! Every piece of kernel state lives in a [`Kernel`], created once by
//! [`Kernel::boot`].

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[macro_use]
extern crate abyss;
extern crate alloc;

pub mod check;
pub mod fork;
pub mod interrupt;
pub mod kernel;
pub mod layout;
pub mod loader;
pub mod memshow;
pub mod mm;
pub mod process;
pub mod scheduler;
pub mod syscall;

pub use abyss::{addressing, debug, info, print, println, warning};
pub use kernel::{Kernel, Resume, Stop};
