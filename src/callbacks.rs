//! The host-provided callback surface.
//!
//! This is the boundary described in `mobile.h`'s `mobile_board_*`
//! declarations: everything the core does not implement itself. A host
//! embeds this crate by providing a type that implements [`Callbacks`] and
//! driving [`crate::Adapter::transfer`]/[`crate::Adapter::tick`].

use crate::addr::Addr;

/// Socket transport, passed to [`Callbacks::sock_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp,
    Udp,
}

/// Socket address family, passed to [`Callbacks::sock_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Ipv4,
    Ipv6,
}

/// One of the four timers the host must track. Only `Serial` and `Command`
/// are used by this crate today; `Reserved3`/`Reserved4` exist for parity
/// with `MOBILE_MAX_TIMERS` and future commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Serial,
    Command,
    Reserved3,
    Reserved4,
}

/// Which party's phone number [`Callbacks::update_number`] is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    User,
    Peer,
}

/// Outcome of a non-blocking [`Callbacks::sock_connect`] poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Pending,
    Error,
}

/// Outcome of a non-blocking [`Callbacks::sock_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    Error,
}

/// Outcome of a non-blocking [`Callbacks::sock_recv`].
///
/// The `NoData` variant is distinct from `Empty`: it signals "don't treat
/// this as a timeout, just echo back what you already had", used by
/// `TRANSFER_DATA` to reproduce a documented adapter quirk (see
/// `mobile_board_sock_recv`'s contract in `mobile.h`, return value `-10`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(usize),
    Empty,
    Error,
    PeerClosed,
    NoData,
}

/// Everything the emulation core needs from its host: persistence, timers,
/// sockets, and two notification sinks (debug lines and phone-number
/// updates). No method here may block; every socket operation is polled
/// repeatedly by the command processor until it resolves.
pub trait Callbacks {
    /// Appends one line (no trailing newline) to the debug sink.
    fn debug_log(&mut self, line: &str);

    /// Disables delivery of [`crate::Adapter::transfer`] calls until the
    /// matching [`Callbacks::serial_enable`]. Used to bracket mutations of
    /// shared state (`serial.state`, `commands.session_begun`,
    /// `commands.mode_32bit`) against a concurrent byte pump.
    fn serial_disable(&mut self);
    fn serial_enable(&mut self);

    /// Reads `dest.len()` bytes from the persisted 192-byte config blob,
    /// starting at `offset`. Never called with an out-of-range region.
    fn config_read(&mut self, dest: &mut [u8], offset: usize) -> bool;
    /// Writes `src` into the persisted config blob at `offset`.
    fn config_write(&mut self, src: &[u8], offset: usize) -> bool;

    /// Records the current time against `timer`.
    fn time_latch(&mut self, timer: Timer);
    /// True if at least `ms` milliseconds have passed since `timer` was
    /// last latched.
    fn time_check_ms(&mut self, timer: Timer, ms: u32) -> bool;

    /// Opens connection slot `conn` (`0..MOBILE_MAX_CONNECTIONS`). `bind_port
    /// == 0` means an ephemeral port.
    fn sock_open(&mut self, conn: usize, ty: SockType, addr_ty: AddrType, bind_port: u16) -> bool;
    /// Closes a slot opened by `sock_open`.
    fn sock_close(&mut self, conn: usize);
    /// Polls a non-blocking TCP connect (or, for UDP, just records the
    /// default peer address).
    fn sock_connect(&mut self, conn: usize, addr: &Addr) -> ConnectOutcome;
    /// Starts listening with a backlog of one.
    fn sock_listen(&mut self, conn: usize) -> bool;
    /// Polls for an incoming connection; on success the slot now holds the
    /// accepted socket in place of the listener.
    fn sock_accept(&mut self, conn: usize) -> bool;
    /// Sends `data`, optionally to `addr` for an unconnected UDP socket.
    fn sock_send(&mut self, conn: usize, data: &[u8], addr: Option<&Addr>) -> SendOutcome;
    /// Receives into `data`, optionally reporting the origin address. A
    /// `data` buffer of length zero is a liveness probe.
    fn sock_recv(&mut self, conn: usize, data: &mut [u8], addr: Option<&mut Addr>) -> RecvOutcome;

    /// Reports a freshly learned phone number (own or peer's), e.g. for
    /// display in a host UI.
    fn update_number(&mut self, which: NumberKind, digits: &str);
}
