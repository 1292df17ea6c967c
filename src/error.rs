//! Error types shared across the serial framer and command processor.
//!
//! Modelled on `hermit-os-kernel`'s `src/io.rs`, which represents errors as
//! a fieldless enum convertible to/from the wire-level numeric code via
//! `num_enum`, with a hand-written [`core::fmt::Display`] rather than
//! `thiserror` (the teacher lists `thiserror` in its dependency table but
//! does not actually use it anywhere in its source tree).

use core::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Serial-level error, reported as the device byte during `ACKNOWLEDGE` and
/// `RESPONSE_ACKNOWLEDGE`. See `mobile_serial_error` in `serial.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SerialError {
    UnknownCommand = 0xF0,
    Checksum = 0xF1,
    Internal = 0xF2,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SerialError::UnknownCommand => "unknown command",
            SerialError::Checksum => "checksum mismatch",
            SerialError::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// A command-level failure, reported as an `ERROR (0x6E)` packet carrying
/// `[original_command, code]`. Unlike [`SerialError`], the numeric meaning
/// of `code` is assigned per command (see each command's doc comment in
/// [`crate::commands`]), so this type stores the opaque code rather than an
/// enum of all possible codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandError {
    pub command: u8,
    pub code: u8,
}

impl CommandError {
    pub const fn new(command: u8, code: u8) -> Self {
        CommandError { command, code }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {:#04x} failed with code {}", self.command, self.code)
    }
}

/// Result alias for the serial framer, whose only failure mode is the
/// three-variant [`SerialError`].
pub type Result<T> = core::result::Result<T, SerialError>;
