//! Human-readable command tracing.
//!
//! Builds one line per logged command/response and flushes it through
//! [`Callbacks::debug_log`], exactly the way `mobile_debug_command` in
//! `debug.c` assembles a line into `adapter.debug.buffer` before handing it
//! to `mobile_cb_debug_log`. The line buffer is bounded the same way the
//! original's is (`MOBILE_DEBUG_BUFFER_SIZE`), so a runaway payload gets
//! silently truncated rather than growing the trace without bound.

use core::fmt::Write as _;

use crate::callbacks::Callbacks;
use crate::packet::{opcode, Packet};

const BUFFER_SIZE: usize = 80;

/// Fixed-capacity line buffer; anything past [`BUFFER_SIZE`] is dropped.
struct LineBuffer {
    buf: [u8; BUFFER_SIZE],
    len: usize,
}

impl LineBuffer {
    fn new() -> Self {
        LineBuffer { buf: [0; BUFFER_SIZE], len: 0 }
    }

    fn push_bytes(&mut self, data: &[u8]) {
        let remaining = BUFFER_SIZE - self.len;
        let n = data.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl core::fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// Accumulates one logical line across several writes, flushing it to the
/// host on [`Self::endl`]. Grounded on `struct mobile_adapter_debug`.
pub struct Tracer {
    line: LineBuffer,
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer { line: LineBuffer::new() }
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    fn endl<C: Callbacks>(&mut self, cb: &mut C) {
        cb.debug_log(self.line.as_str());
        self.line = LineBuffer::new();
    }

    fn hex_dump<C: Callbacks>(&mut self, cb: &mut C, data: &[u8]) {
        self.endl(cb);
        for chunk in data.chunks(0x10) {
            let _ = write!(self.line, "    ");
            for &b in chunk {
                let _ = write!(self.line, "{:02X} ", b);
            }
            self.endl(cb);
        }
    }

    /// Dumps a payload as text if it looks printable, hex otherwise.
    /// Grounded on `dump` in `debug.c`.
    fn dump<C: Callbacks>(&mut self, cb: &mut C, data: &[u8]) {
        if data.is_empty() {
            self.endl(cb);
            return;
        }

        let printable = data.iter().all(|&b| b < 0x80 && (b >= 0x20 || b == b'\r' || b == b'\n'));
        if !printable {
            self.hex_dump(cb, data);
            return;
        }

        self.endl(cb);
        self.line.push_bytes(data);
        self.endl(cb);
    }

    /// Closes out a packet line, flagging any payload the handler above
    /// didn't account for as unparsed trailing bytes. Grounded on
    /// `packet_end` in `debug.c`.
    fn packet_end<C: Callbacks>(&mut self, cb: &mut C, packet: &Packet, consumed: usize) {
        if (packet.length as usize) > consumed {
            let _ = write!(self.line, " !!parsing failed!!");
            self.hex_dump(cb, &packet.data()[consumed..]);
        } else {
            self.endl(cb);
        }
    }

    /// Logs one command or response packet. `send` is true for a response
    /// going back to the Game Boy, false for an incoming request. Grounded
    /// on `mobile_debug_command` in `debug.c`.
    pub fn log_command<C: Callbacks>(&mut self, cb: &mut C, packet: &Packet, send: bool) {
        let _ = write!(self.line, "{} {:02X} ", if send { "<<<" } else { ">>>" }, packet.command);
        let data = packet.data();

        match packet.command {
            opcode::BEGIN_SESSION => {
                let _ = write!(self.line, "Begin session: ");
                self.line.push_bytes(data);
                self.endl(cb);
            }

            opcode::END_SESSION => {
                let _ = write!(self.line, "End session");
                self.packet_end(cb, packet, 0);
                if send {
                    self.endl(cb);
                }
            }

            opcode::DIAL_TELEPHONE => {
                let _ = write!(self.line, "Dial telephone");
                if !send {
                    if data.len() < 2 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let _ = write!(self.line, " (prot {}): ", data[0]);
                    self.line.push_bytes(&data[1..]);
                    self.endl(cb);
                } else {
                    self.packet_end(cb, packet, 0);
                }
            }

            opcode::HANG_UP_TELEPHONE => {
                let _ = write!(self.line, "Hang up telephone");
                self.packet_end(cb, packet, 0);
            }

            opcode::WAIT_FOR_TELEPHONE_CALL => {
                let _ = write!(self.line, "Wait for telephone call");
                self.packet_end(cb, packet, 0);
            }

            opcode::TRANSFER_DATA => {
                let _ = write!(self.line, "Transfer data");
                if data.is_empty() {
                    self.endl(cb);
                    return;
                }
                if data[0] == 0xFF {
                    let _ = write!(self.line, " (p2p)");
                } else {
                    let _ = write!(self.line, " (conn {})", data[0]);
                }
                let rest = &data[1..];
                self.dump(cb, rest);
            }

            opcode::RESET => {
                let _ = write!(self.line, "Reset");
                self.packet_end(cb, packet, 0);
            }

            opcode::TELEPHONE_STATUS => {
                let _ = write!(self.line, "Telephone status");
                if !send {
                    self.packet_end(cb, packet, 0);
                } else {
                    if data.len() < 3 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let _ = write!(self.line, ": {:02X} {:02X} {:02X}", data[0], data[1], data[2]);
                    self.packet_end(cb, packet, 3);
                }
            }

            opcode::SIO32_MODE => {
                let _ = write!(self.line, "Serial 32-bit mode");
                if !send {
                    if data.is_empty() {
                        self.endl(cb);
                        return;
                    }
                    let _ = write!(self.line, ": {}", if data[0] != 0 { "On" } else { "Off" });
                    self.packet_end(cb, packet, 1);
                } else {
                    self.packet_end(cb, packet, 0);
                }
            }

            opcode::READ_CONFIGURATION_DATA => {
                let _ = write!(self.line, "Read configuration data");
                if !send {
                    if data.len() < 2 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let _ = write!(self.line, " (offset: {:02X}; size: {:02X})", data[0], data[1]);
                    self.packet_end(cb, packet, 2);
                } else {
                    if data.is_empty() {
                        self.endl(cb);
                        return;
                    }
                    let _ = write!(self.line, " (offset: {:02X})", data[0]);
                    self.hex_dump(cb, &data[1..]);
                }
            }

            opcode::WRITE_CONFIGURATION_DATA => {
                let _ = write!(self.line, "Write configuration data");
                if !send {
                    if data.is_empty() {
                        self.endl(cb);
                        return;
                    }
                    let _ = write!(self.line, " (offset: {:02X})", data[0]);
                    self.hex_dump(cb, &data[1..]);
                } else {
                    if data.len() < 2 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let _ = write!(self.line, " (offset: {:02X}; size: {:02X})", data[0], data[1]);
                    self.packet_end(cb, packet, 2);
                }
            }

            opcode::TRANSFER_DATA_END => {
                let _ = write!(self.line, "Transfer data end");
                if data.is_empty() {
                    self.endl(cb);
                    return;
                }
                let _ = write!(self.line, " (conn {})", data[0]);
                self.packet_end(cb, packet, 1);
            }

            opcode::ISP_LOGIN => {
                let _ = write!(self.line, "ISP login");
                if !send {
                    self.log_isp_login_request(cb, packet, data);
                } else {
                    if data.len() < 4 * 3 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let _ = write!(
                        self.line,
                        " (ip: {}.{}.{}.{}; dns1: {}.{}.{}.{}; dns2: {}.{}.{}.{})",
                        data[0], data[1], data[2], data[3],
                        data[4], data[5], data[6], data[7],
                        data[8], data[9], data[10], data[11],
                    );
                    self.packet_end(cb, packet, 4 * 3);
                }
            }

            opcode::ISP_LOGOUT => {
                let _ = write!(self.line, "ISP logout");
                self.packet_end(cb, packet, 0);
            }

            opcode::OPEN_TCP_CONNECTION | opcode::OPEN_UDP_CONNECTION => {
                let _ = write!(
                    self.line,
                    "{}",
                    if packet.command == opcode::OPEN_TCP_CONNECTION { "Open TCP connection" } else { "Open UDP connection" }
                );
                if !send {
                    if data.len() < 6 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let port = (data[4] as u16) << 8 | data[5] as u16;
                    let _ = write!(self.line, ": {}.{}.{}.{}:{}", data[0], data[1], data[2], data[3], port);
                    self.packet_end(cb, packet, 6);
                } else {
                    if data.is_empty() {
                        self.endl(cb);
                        return;
                    }
                    let _ = write!(self.line, " (conn {})", data[0]);
                    self.packet_end(cb, packet, 1);
                }
            }

            opcode::CLOSE_TCP_CONNECTION | opcode::CLOSE_UDP_CONNECTION => {
                let _ = write!(
                    self.line,
                    "{}",
                    if packet.command == opcode::CLOSE_TCP_CONNECTION { "Close TCP connection" } else { "Close UDP connection" }
                );
                if data.is_empty() {
                    self.endl(cb);
                    return;
                }
                let _ = write!(self.line, " (conn {})", data[0]);
                self.packet_end(cb, packet, 1);
            }

            opcode::DNS_QUERY => {
                let _ = write!(self.line, "DNS query");
                if !send {
                    let _ = write!(self.line, ": ");
                    self.line.push_bytes(data);
                    self.endl(cb);
                } else {
                    if data.len() < 4 {
                        self.packet_end(cb, packet, 0);
                        return;
                    }
                    let _ = write!(self.line, ": {}.{}.{}.{}", data[0], data[1], data[2], data[3]);
                    self.packet_end(cb, packet, 4);
                }
            }

            opcode::ERROR => {
                let _ = write!(self.line, "Error");
                if data.len() < 2 {
                    self.packet_end(cb, packet, 0);
                    return;
                }
                let _ = write!(self.line, ": {:02X}", data[1]);
                self.packet_end(cb, packet, 2);
            }

            _ => {
                let _ = write!(self.line, "Unknown");
                self.hex_dump(cb, data);
            }
        }
    }

    fn log_isp_login_request<C: Callbacks>(&mut self, cb: &mut C, packet: &Packet, data: &[u8]) {
        if data.is_empty() {
            self.packet_end(cb, packet, 0);
            return;
        }
        let id_len = data[0] as usize;
        if data.len() < 1 + id_len {
            self.packet_end(cb, packet, 0);
            return;
        }
        let _ = write!(self.line, " (id: ");
        self.line.push_bytes(&data[1..1 + id_len]);
        let mut consumed = 1 + id_len;

        if data.len() < consumed + 1 {
            let _ = write!(self.line, ")");
            self.packet_end(cb, packet, consumed);
            return;
        }
        let pass_len = data[consumed] as usize;
        if data.len() < consumed + 1 + pass_len + 8 {
            let _ = write!(self.line, ")");
            self.packet_end(cb, packet, consumed);
            return;
        }
        consumed += 1 + pass_len;

        let dns = &data[consumed..consumed + 8];
        let _ = write!(
            self.line,
            "; dns1: {}.{}.{}.{}; dns2: {}.{}.{}.{})",
            dns[0], dns[1], dns[2], dns[3], dns[4], dns[5], dns[6], dns[7],
        );
        consumed += 8;
        self.packet_end(cb, packet, consumed);
    }
}
