//! The abyss of kernel that operates hardwares.
//!
//! This crate models the machine the kernel runs on: physical memory, the
//! x86_64 page table format walked by the MMU, a user-mode cpu, the local apic
//! timer and the serial port.

#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod cpu;
pub mod dev;
pub mod interrupt;
pub mod memory;
pub mod x86_64;
