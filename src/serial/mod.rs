//! The byte-at-a-time serial transceiver.
//!
//! Drives the Game Boy's external serial port protocol: magic bytes, a
//! checksummed header+payload, device-byte handshaking, and (in 32-bit
//! mode) 4-byte alignment padding. Grounded on `mobile_serial_transfer` in
//! `serial.c`. Every `transfer` call consumes exactly one byte coming in
//! and produces exactly one byte going out, matching the Game Boy link
//! cable's full-duplex shift register.

use log::warn;

use crate::config::{Device, DEVICE_UNMETERED_BIT};
use crate::error::SerialError;
use crate::packet::{opcode, Packet, MAX_DATA_SIZE};

/// `header(4) + padded data(<=256) + checksum(2)`, with headroom; the
/// original's `unsigned char buffer[MOBILE_MAX_DATA_SIZE]` is actually one
/// `unsigned char current` increment away from overflowing for
/// maximum-size 32-bit-padded transfers. Sized generously here instead of
/// replicating that narrow margin.
const BUFFER_SIZE: usize = MAX_DATA_SIZE + 8;

const MAGIC_1: u8 = 0x99;
const MAGIC_2: u8 = 0x66;
const IDLE_BYTE: u8 = 0xD2;
const IDLE_CONFIRM: u8 = 0x4B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Data,
    Checksum,
    Acknowledge,
    IdleCheck,
    ResponseWaiting,
    ResponseStart,
    ResponseData,
    ResponseAcknowledge,
}

pub struct SerialFramer {
    state: State,
    current: usize,
    data_size: usize,
    checksum: u16,
    /// Raw ack/error byte; `0` means no error. Not always one of
    /// [`SerialError`]'s three values: during `RESPONSE_ACKNOWLEDGE` it's
    /// whatever the Game Boy echoed back, which may not be a recognized
    /// error code at all.
    error: u8,
    buffer: [u8; BUFFER_SIZE],
    pub mode_32bit: bool,
    device: u8,
    device_unmetered: bool,
    /// Set on every [`Self::transfer`] call, cleared by the scheduler once
    /// it's acted on a timeout; mirrors `serial.active` in `mobile.h`.
    active: bool,
}

impl Default for SerialFramer {
    fn default() -> Self {
        SerialFramer {
            state: State::Waiting,
            current: 0,
            data_size: 0,
            checksum: 0,
            error: 0,
            buffer: [0; BUFFER_SIZE],
            mode_32bit: false,
            device: Device::Blue as u8,
            device_unmetered: false,
            active: false,
        }
    }
}

impl SerialFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True once a full request packet has been validated and the host is
    /// expected to process it (`MOBILE_SERIAL_RESPONSE_WAITING`).
    pub fn awaiting_response(&self) -> bool {
        self.state == State::ResponseWaiting
    }

    /// True while idling between packets (`MOBILE_SERIAL_WAITING`); this is
    /// the only state in which the 32-bit mode may be safely flipped.
    pub fn is_waiting(&self) -> bool {
        self.state == State::Waiting
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn mark_active(&mut self) {
        self.active = true;
    }

    pub fn clear_active(&mut self) {
        self.active = false;
    }

    /// Extracts the parsed request once [`Self::awaiting_response`] is true.
    pub fn take_request(&self) -> Packet {
        let mut packet = Packet::empty(self.buffer[0]);
        let len = self.buffer[3] as usize;
        packet.length = self.buffer[3];
        packet.data[..len].copy_from_slice(&self.buffer[4..4 + len]);
        packet
    }

    /// Serial-level error raised while parsing the current request, if any.
    pub fn request_error(&self) -> Option<SerialError> {
        SerialError::try_from(self.error).ok()
    }

    /// Loads the response packet into the transmit buffer and starts
    /// sending it. The command byte always has its high bit set, mirroring
    /// the ack convention used throughout the rest of the protocol. Grounded
    /// on `packet_create`.
    pub fn set_response(&mut self, packet: &Packet) {
        self.buffer[0] = packet.command | 0x80;
        self.buffer[1] = 0;
        self.buffer[2] = 0;
        self.buffer[3] = packet.length;
        let len = packet.length as usize;
        self.buffer[4..4 + len].copy_from_slice(packet.data());

        let mut offset = 4 + len;
        if self.mode_32bit && offset % 4 != 0 {
            let pad = 4 - (offset % 4);
            self.buffer[offset..offset + pad].fill(0);
            offset += pad;
        }

        let mut checksum: u16 = 0;
        for &b in &self.buffer[..offset] {
            checksum = checksum.wrapping_add(b as u16);
        }
        self.buffer[offset] = (checksum >> 8) as u8;
        self.buffer[offset + 1] = checksum as u8;

        self.current = 0;
        self.state = State::ResponseStart;
    }

    /// Advances the framer by one transferred byte, returning the byte to
    /// shift back out. `device_byte` is the live device configuration
    /// (including the unmetered bit); it's only latched once per session,
    /// the first time a header is parsed before `BEGIN_SESSION` completes.
    /// Grounded on `mobile_serial_transfer`.
    pub fn transfer(&mut self, c: u8, session_begun: bool, device_byte: u8) -> u8 {
        match self.state {
            State::Waiting => {
                if c == MAGIC_1 {
                    self.current = 1;
                } else if c == MAGIC_2 && self.current == 1 {
                    self.data_size = 0;
                    self.checksum = 0;
                    self.error = 0;
                    self.current = 0;
                    self.state = State::Data;
                } else {
                    self.current = 0;
                }
            }

            State::Data => {
                self.buffer[self.current] = c;
                self.current += 1;
                self.checksum = self.checksum.wrapping_add(c as u16);
                if self.current == 4 {
                    self.data_size = self.buffer[3] as usize;
                    if self.mode_32bit && self.data_size % 4 != 0 {
                        self.data_size += 4 - self.data_size % 4;
                    }

                    if self.buffer[2] != 0 {
                        self.current = 0;
                        self.state = State::Waiting;
                    }

                    if !session_begun {
                        self.device = device_byte & !DEVICE_UNMETERED_BIT;
                        self.device_unmetered = device_byte & DEVICE_UNMETERED_BIT != 0;
                        if self.buffer[0] != opcode::BEGIN_SESSION {
                            self.current = 0;
                            self.state = State::Waiting;
                        }
                    }

                    if !opcode::exists(self.buffer[0]) {
                        warn!("serial: unknown command {:#04x}", self.buffer[0]);
                        self.error = SerialError::UnknownCommand.into();
                    }
                }
                if self.current >= self.data_size + 4 {
                    self.state = State::Checksum;
                }
            }

            State::Checksum => {
                self.buffer[self.current] = c;
                self.current += 1;
                if self.current >= self.data_size + 6 {
                    let in_checksum =
                        u16::from_be_bytes([self.buffer[self.current - 2], self.buffer[self.current - 1]]);
                    if self.checksum != in_checksum {
                        warn!("serial: checksum mismatch, got {:#06x} expected {:#06x}", in_checksum, self.checksum);
                        self.error = SerialError::Checksum.into();
                    }
                    self.current = 0;
                    self.state = State::Acknowledge;
                    return self.device | 0x80;
                }
            }

            State::Acknowledge => {
                if self.current > 0 {
                    let was_two = self.current == 2;
                    self.current += 1;
                    if was_two {
                        self.current = 0;
                        self.state = State::IdleCheck;
                    }
                    return 0;
                }

                let gameboy_ack = c == Device::GameBoy as u8 | 0x80;
                let gba_ack = c == Device::GameBoyAdvance as u8 | 0x80;
                if self.device != Device::Blue as u8 && !self.mode_32bit && !gameboy_ack && !gba_ack {
                    self.state = State::Waiting;
                    return IDLE_BYTE;
                }

                if self.mode_32bit {
                    self.current += 1;
                } else {
                    self.state = State::IdleCheck;
                }
                if self.error != 0 {
                    return self.error;
                }
                return self.buffer[0] ^ 0x80;
            }

            State::IdleCheck => {
                let was_lt1 = self.current < 1;
                self.current += 1;
                if !was_lt1 {
                    self.current = 0;
                    if self.buffer[0] == opcode::EMPTY || self.error != 0 {
                        self.state = State::Waiting;
                        if c == MAGIC_1 {
                            self.current = 1;
                        }
                    } else if c != IDLE_CONFIRM {
                        self.state = State::Waiting;
                        if c == MAGIC_1 {
                            self.current = 1;
                        }
                    } else {
                        self.state = State::ResponseWaiting;
                    }
                }
            }

            State::ResponseWaiting => {}

            State::ResponseStart => {
                let was_zero = self.current == 0;
                self.current += 1;
                if was_zero {
                    return MAGIC_1;
                }
                self.data_size = self.buffer[3] as usize;
                if self.mode_32bit && self.data_size % 4 != 0 {
                    self.data_size += 4 - self.data_size % 4;
                }
                self.current = 0;
                self.state = State::ResponseData;
                return MAGIC_2;
            }

            State::ResponseData => {
                let out = self.buffer[self.current];
                self.current += 1;
                if self.current >= self.data_size + 6 {
                    self.current = 0;
                    self.state = State::ResponseAcknowledge;
                }
                return out;
            }

            State::ResponseAcknowledge => {
                match self.current {
                    0 => {
                        self.current += 1;
                        return self.device | 0x80;
                    }
                    1 => {
                        self.current += 1;
                        return 0;
                    }
                    2 => {
                        self.error = c;
                    }
                    _ => {}
                }

                if self.mode_32bit && self.current < 4 {
                    self.current += 1;
                    return 0;
                }

                self.current = 0;
                if SerialError::try_from(self.error).is_ok() {
                    self.state = State::ResponseStart;
                } else {
                    self.state = State::Waiting;
                }
            }
        }

        IDLE_BYTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut SerialFramer, bytes: &[u8]) -> alloc::vec::Vec<u8> {
        bytes.iter().map(|&b| framer.transfer(b, true, Device::Blue as u8)).collect()
    }

    #[test]
    fn parses_a_minimal_begin_session_header() {
        let mut framer = SerialFramer::new();
        // magic, then header(command=0x10, 0, 0, len=0), checksum = 0x10.
        let out = feed(&mut framer, &[0x99, 0x66, 0x10, 0, 0, 0, 0x00, 0x10]);
        assert_eq!(out.len(), 8);
        assert_eq!(framer.state, State::Acknowledge);
    }

    #[test]
    fn detects_unknown_command() {
        let mut framer = SerialFramer::new();
        feed(&mut framer, &[0x99, 0x66, 0x77, 0, 0, 0, 0x00, 0x77]);
        assert_eq!(framer.request_error(), Some(SerialError::UnknownCommand));
    }

    #[test]
    fn detects_checksum_mismatch() {
        let mut framer = SerialFramer::new();
        feed(&mut framer, &[0x99, 0x66, 0x10, 0, 0, 0, 0xFF, 0xFF]);
        assert_eq!(framer.request_error(), Some(SerialError::Checksum));
    }
}
