//! Serial device.
//!
//! The serial port keeps the most recent lines written to it. With the `std`
//! feature, each completed line is also echoed to the host's stderr.
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

/// Number of lines the serial port retains.
pub const SERIAL_LINES: usize = 1024;

pub struct Serial {
    lines: VecDeque<String>,
    partial: String,
}

impl Serial {
    /// Create a new serial device interface.
    pub const fn new() -> Self {
        Serial {
            lines: VecDeque::new(),
            partial: String::new(),
        }
    }

    fn push_line(&mut self) {
        let line = core::mem::take(&mut self.partial);
        #[cfg(feature = "std")]
        std::eprintln!("{}", line);
        if self.lines.len() == SERIAL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Take every completed line out of the device.
    pub fn drain(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let mut rest = s;
        while let Some(pos) = rest.find('\n') {
            self.partial.push_str(&rest[..pos]);
            self.push_line();
            rest = &rest[pos + 1..];
        }
        self.partial.push_str(rest);
        Ok(())
    }
}
