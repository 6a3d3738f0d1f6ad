//! Process scheduler.
use crate::layout::NPROC;
use crate::process::{Pid, ProcState, ProcTable};

/// Common features of process scheduler.
pub trait Scheduler {
    /// Peek a next process to run after `current`.
    ///
    /// If there is no process to run, returns None.
    fn next_to_run(&mut self, procs: &ProcTable, current: Pid) -> Option<Pid>;
}

/// A round robin scheduler.
///
/// Slots are scanned circularly starting just after the current one; the
/// current process itself comes last.
#[derive(Debug, Default)]
pub struct RoundRobin;

impl RoundRobin {
    /// Create a new round robin scheduler.
    pub const fn new() -> Self {
        Self
    }
}

impl Scheduler for RoundRobin {
    fn next_to_run(&mut self, procs: &ProcTable, current: Pid) -> Option<Pid> {
        (1..=NPROC)
            .map(|i| (current + i) % NPROC)
            .find(|pid| procs[*pid].state == ProcState::Runnable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_order() {
        let mut procs = ProcTable::new();
        let mut rr = RoundRobin::new();
        assert_eq!(rr.next_to_run(&procs, 1), None);

        for pid in [2, 5, 9] {
            procs[pid].state = ProcState::Runnable;
        }
        procs[3].state = ProcState::Broken;
        procs[4].state = ProcState::Blocked;
        assert_eq!(rr.next_to_run(&procs, 2), Some(5));
        assert_eq!(rr.next_to_run(&procs, 5), Some(9));
        assert_eq!(rr.next_to_run(&procs, 9), Some(2));
        assert_eq!(rr.next_to_run(&procs, 0), Some(2));
    }

    #[test]
    fn lone_process_runs_again() {
        let mut procs = ProcTable::new();
        let mut rr = RoundRobin::new();
        procs[NPROC - 1].state = ProcState::Runnable;
        assert_eq!(rr.next_to_run(&procs, NPROC - 1), Some(NPROC - 1));
        assert_eq!(rr.next_to_run(&procs, 1), Some(NPROC - 1));
    }
}
