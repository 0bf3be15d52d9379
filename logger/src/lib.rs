//! Simple module to provide logging & printing utils

#![no_std]

use core::fmt::{self, Write};

#[cfg(feature = "serial")]
pub mod serial;

/// Empty struct to implement 'Write' on
pub struct Writer;

/// A macro to print to the serial port with a newline
#[macro_export]
macro_rules! println {
    ($($arg:tt)*) => {{
        let _ = core::fmt::Write::write_fmt(&mut $crate::Writer, format_args!("{}\n", format_args!($($arg)*)));
    }}
}

/// A macro to print a message with no severity prefix.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::println!("{}", format_args!($($arg)*));
    }
}

/// A macro to print an informational message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::println!("-> INFO: {}", format_args!($($arg)*));
    }
}

/// A macro to print an error
#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::println!("-> ERROR: {}", format_args!($($arg)*));
    }
}

/// A macro to print a warning
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::println!("-> WARNING: {}", format_args!($($arg)*));
    }
}

/// A macro to print a debug message. Compiled out entirely in release builds.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        $crate::println!("-> DEBUG: {}", format_args!($($arg)*));
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            #[cfg(feature = "serial")]
            #[allow(static_mut_refs)]
            unsafe {
                serial::SERIAL_WRITER.write_byte(byte);
            };
        }

        Ok(())
    }
}
