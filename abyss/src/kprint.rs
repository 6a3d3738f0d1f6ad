//! Kernel print utilities.
//!
//! Every message goes to the serial port of the machine. Messages printed
//! through [`info!`], [`warning!`] and [`debug!`] carry a level tag; `debug!`
//! is compiled to nothing in release builds.

use crate::dev::x86_64::serial::Serial;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use spin_lock::SpinLock;

static SERIAL: SpinLock<Serial> = SpinLock::new(Serial::new());

/// Level of a log message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
        }
    }
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let _ = SERIAL.lock().write_fmt(fmt);
}

#[doc(hidden)]
pub fn _log(level: Level, fmt: core::fmt::Arguments<'_>) {
    let _ = writeln!(&mut *SERIAL.lock(), "[{}] {}", level.tag(), fmt);
}

/// Take every line printed so far out of the serial port.
pub fn drain() -> Vec<String> {
    SERIAL.lock().drain()
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the serial port.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (
        $crate::kprint::_log($crate::kprint::Level::Info, format_args!($($arg)*))
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => (
        $crate::kprint::_log($crate::kprint::Level::Warning, format_args!($($arg)*))
    );
}

/// Print msg if debug build
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            $crate::kprint::_log($crate::kprint::Level::Debug, format_args!($($arg)*))
        }
    }
}
