//! Local apic.
//!
//! The timer of the local apic counts down once per user instruction and
//! fires when the count reaches zero, then reloads with the quantum. The count
//! survives across traps. The kernel must acknowledge each timer interrupt with
//! an end-of-interrupt.

/// Number of user instructions the cpu retires per second.
pub const INSTRUCTIONS_PER_SECOND: usize = 100_000;

/// Local apic of the cpu.
#[derive(Debug)]
pub struct Lapic {
    quantum: usize,
    count: usize,
    eoi: u64,
}

impl Lapic {
    /// Program the timer to fire `hz` times a second.
    pub fn new(hz: usize) -> Self {
        assert!(hz > 0 && hz <= INSTRUCTIONS_PER_SECOND);
        let quantum = INSTRUCTIONS_PER_SECOND / hz;
        Self {
            quantum,
            count: quantum,
            eoi: 0,
        }
    }

    /// Instructions between two timer interrupts.
    #[inline]
    pub fn quantum(&self) -> usize {
        self.quantum
    }

    /// Count down one instruction. Returns true if the timer fires.
    #[inline]
    pub fn tick(&mut self) -> bool {
        if self.count == 0 {
            self.count = self.quantum;
            true
        } else {
            self.count -= 1;
            false
        }
    }

    /// Acknowledge the current interrupt (end-of-interrupt).
    #[inline]
    pub fn ack(&mut self) {
        self.eoi += 1;
    }

    /// Number of interrupts acknowledged so far.
    #[inline]
    pub fn acked(&self) -> u64 {
        self.eoi
    }
}
