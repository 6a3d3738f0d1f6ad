//! x86_64 devices.

pub mod apic;
pub mod serial;
