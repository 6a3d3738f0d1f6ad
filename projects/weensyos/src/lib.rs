//! WeensyOS: the user programs of the kernel and the boot entry.
//!
//! [`Programs`] is the program table handed to [`keos::Kernel::boot`].

pub mod programs;

use keos::loader::{Program, ProgramLoader};

/// Every program known to the kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Programs;

impl Programs {
    /// Names of the programs.
    pub const NAMES: [&'static str; 10] = [
        "allocator",
        "allocator2",
        "allocator3",
        "allocator4",
        "fork",
        "forkexit",
        "forkbomb",
        "null_deref",
        "text_write",
        "console",
    ];
}

impl ProgramLoader for Programs {
    fn load(&self, name: &str) -> Option<Program> {
        Some(match name {
            "allocator" => programs::allocator(name, 1),
            "allocator2" => programs::allocator(name, 2),
            "allocator3" => programs::allocator(name, 3),
            "allocator4" => programs::allocator(name, 4),
            "fork" => programs::fork(),
            "forkexit" => programs::forkexit(),
            "forkbomb" => programs::forkbomb(),
            "null_deref" => programs::null_deref(),
            "text_write" => programs::text_write(),
            "console" => programs::console(),
            _ => return None,
        })
    }
}

/// Boot the kernel with `command` and run it until `max_ticks` timer
/// interrupts have passed, or forever if `max_ticks` is None.
pub fn run(command: Option<&str>, max_ticks: Option<usize>) -> keos::Stop {
    let mut kernel = keos::Kernel::boot(Programs, command);
    let stop = kernel.run_until(|k| max_ticks.map_or(false, |max| k.ticks() > max));
    match stop {
        keos::Stop::Idle => keos::info!("no runnable process after {} ticks", kernel.ticks()),
        keos::Stop::Condition => keos::info!("stopped after {} ticks", kernel.ticks()),
    }
    stop
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_loads() {
        for name in Programs::NAMES {
            let program = Programs.load(name).unwrap();
            assert_eq!(program.name, name);
            assert!(!program.segments.is_empty());
        }
        assert!(Programs.load("nonexistent").is_none());
        for name in keos::layout::DEFAULT_PROGRAMS {
            assert!(Programs::NAMES.contains(&name));
        }
    }
}
