//! The wire-level command packet and its opcode space.
//!
//! Grounded on `struct mobile_packet` (`commands.h`) and the framing helpers
//! `packet_parse`/`packet_create` in `mobile.c`. The checksum and magic-byte
//! framing itself live in [`crate::serial`]; this module only owns the
//! parsed `(command, length, data)` triple that passes between the serial
//! framer and the command processor.

/// Maximum payload size a packet's `data` field can hold.
///
/// `length` is a `u8`, so this is also the largest representable length.
pub const MAX_DATA_SIZE: usize = 0xFF;

/// Largest payload a single `TRANSFER_DATA` command may carry, one less
/// than [`MAX_DATA_SIZE`] to leave room for the leading connection-id byte.
pub const MAX_TRANSFER_SIZE: usize = 0xFE;

/// Command opcodes, as they appear in the low 7 bits of the wire command
/// byte (requests); responses additionally set bit 7.
pub mod opcode {
    pub const EMPTY: u8 = 0x0F;
    pub const BEGIN_SESSION: u8 = 0x10;
    pub const END_SESSION: u8 = 0x11;
    pub const DIAL_TELEPHONE: u8 = 0x12;
    pub const HANG_UP_TELEPHONE: u8 = 0x13;
    pub const WAIT_FOR_TELEPHONE_CALL: u8 = 0x14;
    pub const TRANSFER_DATA: u8 = 0x15;
    pub const RESET: u8 = 0x16;
    pub const TELEPHONE_STATUS: u8 = 0x17;
    pub const SIO32_MODE: u8 = 0x18;
    pub const READ_CONFIGURATION_DATA: u8 = 0x19;
    pub const WRITE_CONFIGURATION_DATA: u8 = 0x1A;
    pub const TRANSFER_DATA_END: u8 = 0x1F;
    pub const ISP_LOGIN: u8 = 0x21;
    pub const ISP_LOGOUT: u8 = 0x22;
    pub const OPEN_TCP_CONNECTION: u8 = 0x23;
    pub const CLOSE_TCP_CONNECTION: u8 = 0x24;
    pub const OPEN_UDP_CONNECTION: u8 = 0x25;
    pub const CLOSE_UDP_CONNECTION: u8 = 0x26;
    pub const DNS_QUERY: u8 = 0x28;
    pub const FIRMWARE_VERSION: u8 = 0x3F;
    pub const ERROR: u8 = 0x6E;

    /// True for every opcode the command processor is willing to dispatch;
    /// used by the serial framer to set `SerialError::UnknownCommand`
    /// during `DATA` as soon as the header is complete. Grounded on
    /// `mobile_commands_exists` in `commands.c`.
    pub fn exists(command: u8) -> bool {
        matches!(
            command,
            EMPTY
                | BEGIN_SESSION
                | END_SESSION
                | DIAL_TELEPHONE
                | HANG_UP_TELEPHONE
                | WAIT_FOR_TELEPHONE_CALL
                | TRANSFER_DATA
                | RESET
                | TELEPHONE_STATUS
                | SIO32_MODE
                | READ_CONFIGURATION_DATA
                | WRITE_CONFIGURATION_DATA
                | ISP_LOGIN
                | ISP_LOGOUT
                | OPEN_TCP_CONNECTION
                | CLOSE_TCP_CONNECTION
                | OPEN_UDP_CONNECTION
                | CLOSE_UDP_CONNECTION
                | DNS_QUERY
                | FIRMWARE_VERSION
        )
    }
}

/// A parsed command or response packet.
#[derive(Clone, Copy)]
pub struct Packet {
    pub command: u8,
    pub length: u8,
    pub data: [u8; MAX_DATA_SIZE],
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("command", &format_args!("{:#04x}", self.command))
            .field("length", &self.length)
            .field("data", &self.data())
            .finish()
    }
}

impl Packet {
    pub const fn empty(command: u8) -> Self {
        Packet {
            command,
            length: 0,
            data: [0; MAX_DATA_SIZE],
        }
    }

    /// Builds a packet from a command byte and a payload slice.
    ///
    /// `bytes` must fit in [`MAX_DATA_SIZE`]; longer input is truncated,
    /// which never happens in practice since every caller constructs
    /// payloads well under that bound.
    pub fn with_data(command: u8, bytes: &[u8]) -> Self {
        let mut packet = Packet::empty(command);
        packet.set_data(bytes);
        packet
    }

    /// Builds an `ERROR (0x6E)` packet carrying `[original_command, code]`.
    ///
    /// Grounded on `error_packet` in `commands.c`.
    pub fn error(original_command: u8, code: u8) -> Self {
        Packet::with_data(opcode::ERROR, &[original_command, code])
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }

    pub fn set_data(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(MAX_DATA_SIZE);
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.length = n as u8;
    }
}
