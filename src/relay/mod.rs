//! Relay server client: pairing, calling, and waiting across the public
//! internet when no direct peer address is known.
//!
//! Grounded on `relay.c`/`relay.h`. Each exchange is a tiny
//! request/response pair over the same TCP connection used later for
//! `TRANSFER_DATA`; once a call is accepted the connection is `Linked` and
//! the command processor tunnels raw bytes through it instead of calling
//! back into this module.

use log::warn;

use crate::addr::Addr;
use crate::callbacks::{Callbacks, ConnectOutcome, NumberKind, RecvOutcome, SendOutcome};
use crate::config::AdapterConfig;

pub const PACKET_SIZE: usize = 0x20;
pub const TOKEN_SIZE: usize = 0x10;
pub const MAX_NUMBER_SIZE: usize = 16;

const PROTOCOL_VERSION: u8 = 0;
const CMD_CALL: u8 = 0;
const CMD_WAIT: u8 = 1;
const CMD_GET_NUMBER: u8 = 2;
const HANDSHAKE_MAGIC: [u8; 7] = [PROTOCOL_VERSION, b'M', b'O', b'B', b'I', b'L', b'E'];

/// A phone number as returned by the relay server: ASCII digits/punctuation,
/// never longer than [`MAX_NUMBER_SIZE`].
#[derive(Debug, Clone, Copy)]
pub struct Number {
    bytes: [u8; MAX_NUMBER_SIZE],
    len: u8,
}

impl Number {
    const fn empty() -> Self {
        Number { bytes: [0; MAX_NUMBER_SIZE], len: 0 }
    }

    fn from_slice(s: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_NUMBER_SIZE];
        let n = s.len().min(MAX_NUMBER_SIZE);
        bytes[..n].copy_from_slice(&s[..n]);
        Number { bytes, len: n as u8 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    RecvConnect,
    RecvHandshake,
    Connected,
    RecvCall,
    RecvWait,
    RecvGetNumber,
    Linked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcStep {
    Begin,
    GetNumber,
    Final,
}

/// Outcome of stepping a relay exchange once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll<T> {
    Pending,
    Ready(T),
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Accepted,
    Unavailable,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Accepted,
    Internal,
}

/// Relay client state. `true` is the connection slot's index known to the
/// caller; this struct only tracks the protocol, not the socket itself.
pub struct RelayClient {
    state: State,
    proc_step: ProcStep,
    buffer: [u8; PACKET_SIZE],
    buffer_len: usize,
}

impl Default for RelayClient {
    fn default() -> Self {
        RelayClient {
            state: State::Disconnected,
            proc_step: ProcStep::Begin,
            buffer: [0; PACKET_SIZE],
            buffer_len: 0,
        }
    }
}

impl RelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets protocol state without touching the socket; called whenever
    /// a fresh call/wait attempt begins. Grounded on `mobile_relay_init`.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn recv_reset(&mut self) {
        self.buffer_len = 0;
    }

    /// Accumulates at least `size` bytes into the scratch buffer.
    /// `Some(true)`: ready; `Some(false)`: still waiting; `None`: socket
    /// error. Grounded on `relay_recv`.
    fn recv_at_least<C: Callbacks>(&mut self, cb: &mut C, conn: usize, size: usize) -> Option<bool> {
        if size > PACKET_SIZE {
            return None;
        }
        if self.buffer_len >= size {
            return Some(true);
        }
        match cb.sock_recv(conn, &mut self.buffer[self.buffer_len..size], None) {
            RecvOutcome::Data(n) => {
                self.buffer_len += n;
                Some(self.buffer_len >= size)
            }
            RecvOutcome::Empty | RecvOutcome::NoData => Some(false),
            RecvOutcome::Error | RecvOutcome::PeerClosed => None,
        }
    }

    fn handshake_send<C: Callbacks>(&mut self, cb: &mut C, conn: usize, token: Option<[u8; TOKEN_SIZE]>) -> bool {
        self.buffer[..7].copy_from_slice(&HANDSHAKE_MAGIC);
        let mut len = 8;
        self.buffer[7] = match token {
            Some(t) => {
                self.buffer[8..8 + TOKEN_SIZE].copy_from_slice(&t);
                len += TOKEN_SIZE;
                1
            }
            None => 0,
        };
        matches!(cb.sock_send(conn, &self.buffer[..len], None), SendOutcome::Sent(_))
    }

    /// `Ready(Some(token))` carries a freshly issued token to persist.
    fn handshake_recv<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Poll<Option<[u8; TOKEN_SIZE]>> {
        let recv_size = 8;
        match self.recv_at_least(cb, conn, recv_size) {
            None => return Poll::Error,
            Some(false) => return Poll::Pending,
            Some(true) => {}
        }
        if self.buffer[..7] != HANDSHAKE_MAGIC {
            return Poll::Error;
        }
        match self.buffer[7] {
            0 => Poll::Ready(None),
            1 => match self.recv_at_least(cb, conn, recv_size + TOKEN_SIZE) {
                None => Poll::Error,
                Some(false) => Poll::Pending,
                Some(true) => {
                    let mut token = [0u8; TOKEN_SIZE];
                    token.copy_from_slice(&self.buffer[8..8 + TOKEN_SIZE]);
                    Poll::Ready(Some(token))
                }
            },
            _ => Poll::Error,
        }
    }

    /// Connects to the relay server and authenticates, reusing the stored
    /// token if the host has one. A token the server issues is written back
    /// into `config` immediately, mirroring `mobile_config_set_relay_token`
    /// being called straight from inside `relay_handshake_recv`.
    /// Grounded on `mobile_relay_connect`.
    pub fn connect<C: Callbacks>(&mut self, cb: &mut C, conn: usize, server: &Addr, config: &mut AdapterConfig) -> Poll<()> {
        if self.state == State::Disconnected {
            self.state = State::RecvConnect;
        }
        match self.state {
            State::RecvConnect => match cb.sock_connect(conn, server) {
                ConnectOutcome::Pending => Poll::Pending,
                ConnectOutcome::Error => {
                    warn!("relay: connect failed");
                    self.state = State::Disconnected;
                    Poll::Error
                }
                ConnectOutcome::Connected => {
                    if !self.handshake_send(cb, conn, config.relay_token()) {
                        warn!("relay: handshake send failed");
                        self.state = State::Disconnected;
                        return Poll::Error;
                    }
                    self.recv_reset();
                    self.state = State::RecvHandshake;
                    Poll::Pending
                }
            },
            State::RecvHandshake => match self.handshake_recv(cb, conn) {
                Poll::Pending => Poll::Pending,
                Poll::Error => {
                    self.state = State::Disconnected;
                    Poll::Error
                }
                Poll::Ready(new_token) => {
                    if let Some(token) = new_token {
                        config.set_relay_token(token);
                    }
                    self.state = State::Connected;
                    Poll::Ready(())
                }
            },
            _ => Poll::Ready(()),
        }
    }

    fn call_send<C: Callbacks>(&mut self, cb: &mut C, conn: usize, number: &[u8]) -> bool {
        if number.len() > MAX_NUMBER_SIZE {
            return false;
        }
        self.buffer[0] = PROTOCOL_VERSION;
        self.buffer[1] = CMD_CALL;
        self.buffer[2] = number.len() as u8;
        self.buffer[3..3 + number.len()].copy_from_slice(number);
        matches!(cb.sock_send(conn, &self.buffer[..3 + number.len()], None), SendOutcome::Sent(_))
    }

    fn call_recv<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Poll<CallResult> {
        match self.recv_at_least(cb, conn, 3) {
            None => return Poll::Error,
            Some(false) => return Poll::Pending,
            Some(true) => {}
        }
        if self.buffer[0] != PROTOCOL_VERSION || self.buffer[1] != CMD_CALL {
            return Poll::Error;
        }
        match self.buffer[2] {
            0 => Poll::Ready(CallResult::Accepted),
            1 => Poll::Ready(CallResult::Unavailable),
            2 => Poll::Ready(CallResult::Busy),
            _ => Poll::Error,
        }
    }

    /// Calls `number`. Once `Ready(Accepted)` the connection stays `Linked`
    /// for as long as the caller keeps polling with this same connection
    /// id; any other result returns to `Connected`, allowing a redial.
    /// Grounded on `mobile_relay_call`.
    pub fn call<C: Callbacks>(&mut self, cb: &mut C, conn: usize, number: &[u8]) -> Poll<CallResult> {
        match self.state {
            State::Connected => {
                if !self.call_send(cb, conn, number) {
                    return Poll::Error;
                }
                self.recv_reset();
                self.state = State::RecvCall;
                Poll::Pending
            }
            State::RecvCall => match self.call_recv(cb, conn) {
                Poll::Pending => Poll::Pending,
                Poll::Error => {
                    self.state = State::Connected;
                    Poll::Error
                }
                Poll::Ready(CallResult::Accepted) => {
                    self.state = State::Linked;
                    Poll::Ready(CallResult::Accepted)
                }
                Poll::Ready(other) => {
                    self.state = State::Connected;
                    Poll::Ready(other)
                }
            },
            State::Linked => Poll::Ready(CallResult::Accepted),
            _ => Poll::Error,
        }
    }

    fn wait_send<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> bool {
        self.buffer[0] = PROTOCOL_VERSION;
        self.buffer[1] = CMD_WAIT;
        matches!(cb.sock_send(conn, &self.buffer[..2], None), SendOutcome::Sent(_))
    }

    fn wait_recv<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Poll<(WaitResult, Number)> {
        match self.recv_at_least(cb, conn, 4) {
            None => return Poll::Error,
            Some(false) => return Poll::Pending,
            Some(true) => {}
        }
        if self.buffer[0] != PROTOCOL_VERSION || self.buffer[1] != CMD_WAIT {
            return Poll::Error;
        }
        let result = match self.buffer[2] {
            0 => WaitResult::Accepted,
            1 => WaitResult::Internal,
            _ => return Poll::Error,
        };
        if result != WaitResult::Accepted {
            return Poll::Ready((result, Number::empty()));
        }
        let number_len = self.buffer[3] as usize;
        if number_len == 0 || number_len > MAX_NUMBER_SIZE {
            return Poll::Error;
        }
        match self.recv_at_least(cb, conn, 4 + number_len) {
            None => Poll::Error,
            Some(false) => Poll::Pending,
            Some(true) => Poll::Ready((result, Number::from_slice(&self.buffer[4..4 + number_len]))),
        }
    }

    /// Waits for an incoming call. Once called, no other relay operation
    /// may be performed on this connection until it's closed and restarted.
    /// Grounded on `mobile_relay_wait`.
    pub fn wait<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Poll<(WaitResult, Number)> {
        match self.state {
            State::Connected => {
                if !self.wait_send(cb, conn) {
                    return Poll::Error;
                }
                self.recv_reset();
                self.state = State::RecvWait;
                Poll::Pending
            }
            State::RecvWait => match self.wait_recv(cb, conn) {
                Poll::Pending => Poll::Pending,
                Poll::Error => {
                    self.state = State::Connected;
                    Poll::Error
                }
                Poll::Ready((WaitResult::Accepted, number)) => {
                    self.state = State::Linked;
                    Poll::Ready((WaitResult::Accepted, number))
                }
                Poll::Ready(other) => {
                    self.state = State::Connected;
                    Poll::Ready(other)
                }
            },
            State::Linked => Poll::Ready((WaitResult::Accepted, Number::empty())),
            _ => Poll::Error,
        }
    }

    fn get_number_send<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> bool {
        self.buffer[0] = PROTOCOL_VERSION;
        self.buffer[1] = CMD_GET_NUMBER;
        matches!(cb.sock_send(conn, &self.buffer[..2], None), SendOutcome::Sent(_))
    }

    fn get_number_recv<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Poll<Number> {
        match self.recv_at_least(cb, conn, 3) {
            None => return Poll::Error,
            Some(false) => return Poll::Pending,
            Some(true) => {}
        }
        if self.buffer[0] != PROTOCOL_VERSION || self.buffer[1] != CMD_GET_NUMBER {
            return Poll::Error;
        }
        let number_len = self.buffer[2] as usize;
        if number_len == 0 || number_len > MAX_NUMBER_SIZE {
            return Poll::Error;
        }
        match self.recv_at_least(cb, conn, 3 + number_len) {
            None => Poll::Error,
            Some(false) => Poll::Pending,
            Some(true) => Poll::Ready(Number::from_slice(&self.buffer[3..3 + number_len])),
        }
    }

    /// Queries this adapter's own assigned phone number.
    /// Grounded on `mobile_relay_get_number`.
    pub fn get_number<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Poll<Number> {
        match self.state {
            State::Connected => {
                if !self.get_number_send(cb, conn) {
                    return Poll::Error;
                }
                self.recv_reset();
                self.state = State::RecvGetNumber;
                Poll::Pending
            }
            State::RecvGetNumber => match self.get_number_recv(cb, conn) {
                Poll::Pending => Poll::Pending,
                Poll::Error => {
                    self.state = State::Connected;
                    Poll::Error
                }
                Poll::Ready(number) => {
                    self.state = State::Connected;
                    Poll::Ready(number)
                }
            },
            _ => Poll::Error,
        }
    }

    /// Connect, fetch the local number, then place the call, reporting
    /// both numbers through [`Callbacks::update_number`] as they become
    /// known. Grounded on `mobile_relay_proc_call`.
    pub fn proc_call<C: Callbacks>(
        &mut self,
        cb: &mut C,
        conn: usize,
        server: &Addr,
        config: &mut AdapterConfig,
        number: &[u8],
    ) -> Poll<CallResult> {
        if self.proc_step == ProcStep::Begin {
            match self.connect(cb, conn, server, config) {
                Poll::Pending => return Poll::Pending,
                Poll::Error => return Poll::Error,
                Poll::Ready(()) => self.proc_step = ProcStep::GetNumber,
            }
        }
        if self.proc_step == ProcStep::GetNumber {
            match self.get_number(cb, conn) {
                Poll::Pending => return Poll::Pending,
                Poll::Error => return Poll::Error,
                Poll::Ready(own_number) => {
                    cb.update_number(NumberKind::User, ascii_str(own_number.as_bytes()));
                    self.proc_step = ProcStep::Final;
                }
            }
        }
        match self.call(cb, conn, number) {
            Poll::Ready(CallResult::Accepted) => {
                cb.update_number(NumberKind::Peer, ascii_str(number));
                Poll::Ready(CallResult::Accepted)
            }
            other => other,
        }
    }

    /// Connect, fetch the local number, then wait for an incoming call.
    /// Grounded on `mobile_relay_proc_wait`.
    pub fn proc_wait<C: Callbacks>(
        &mut self,
        cb: &mut C,
        conn: usize,
        server: &Addr,
        config: &mut AdapterConfig,
    ) -> Poll<(WaitResult, Number)> {
        if self.proc_step == ProcStep::Begin {
            match self.connect(cb, conn, server, config) {
                Poll::Pending => return Poll::Pending,
                Poll::Error => return Poll::Error,
                Poll::Ready(()) => self.proc_step = ProcStep::GetNumber,
            }
        }
        if self.proc_step == ProcStep::GetNumber {
            match self.get_number(cb, conn) {
                Poll::Pending => return Poll::Pending,
                Poll::Error => return Poll::Error,
                Poll::Ready(own_number) => {
                    cb.update_number(NumberKind::User, ascii_str(own_number.as_bytes()));
                    self.proc_step = ProcStep::Final;
                }
            }
        }
        match self.wait(cb, conn) {
            Poll::Ready((WaitResult::Accepted, peer_number)) => {
                cb.update_number(NumberKind::Peer, ascii_str(peer_number.as_bytes()));
                Poll::Ready((WaitResult::Accepted, peer_number))
            }
            other => other,
        }
    }
}

/// Numbers are always plain ASCII; invalid bytes are replaced rather than
/// rejected, since this only feeds a host notification callback.
fn ascii_str(bytes: &[u8]) -> &str {
    core::str::from_utf8(bytes).unwrap_or("")
}
