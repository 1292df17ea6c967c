//! The command processor: dispatches a framed request packet to one of the
//! 19 adapter commands and produces the response packet.
//!
//! Grounded on `struct mobile_adapter_commands` and `mobile_commands_process`
//! in `commands.c`. Commands that need a socket round trip (`DIAL_TELEPHONE`,
//! `WAIT_FOR_TELEPHONE_CALL`, `OPEN_TCP_CONNECTION`, `DNS_QUERY`,
//! `TRANSFER_DATA`) are resumable: [`CommandProcessor::process`] may be
//! called many times for the same request, returning `None` until a
//! response is ready.

use log::{debug, trace, warn};

use crate::addr::{is_ip_address, parse_phone_addr, Addr};
use crate::callbacks::{AddrType, Callbacks, ConnectOutcome, RecvOutcome, SendOutcome, SockType, Timer};
use crate::config::AdapterConfig;
use crate::dns::{QueryPoll, Resolver};
use crate::packet::{opcode, Packet, MAX_TRANSFER_SIZE};
use crate::presentation::parse_ipv4;
use crate::relay::{CallResult, Poll as RelayPoll, RelayClient, WaitResult};

/// `MOBILE_MAX_CONNECTIONS`. Slot 0 doubles as the P2P/telephone connection
/// and, once a call has ended, as one of the two post-login internet slots.
pub const MAX_CONNECTIONS: usize = 2;
pub const P2P_CONN: usize = 0;

const ISP_IP: [u8; 4] = [127, 0, 0, 1];
const NINTENDO_MAGIC: &[u8] = b"NINTENDO";

/// DION PDC/CDMAONE and DDI-POCKET ISP/service numbers, plus a Nintendo test
/// number; dialing any of these short-circuits into `CALL_ISP` without ever
/// opening a socket. Grounded on `isp_numbers` in `commands.c`.
const ISP_NUMBERS: [&[u8]; 5] = [b"#9677", b"#9477", b"0077487751", b"0077487752", b"0755311973"];

/// Mirrors `enum mobile_adapter_connection_state` (`commands.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Wait,
    WaitRelay,
    WaitTimeout,
    Call,
    CallRecv,
    CallIsp,
    Internet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialStep {
    Ip,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStep {
    Begin,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenTcpStep {
    Connecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnsStep {
    Check,
}

/// Scratch state for whichever command is currently resuming across ticks.
/// Only one of these is meaningful at a time, tracked by which command is
/// in flight; reset whenever a new request for a different command arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    None,
    Dial(DialStep),
    Wait(WaitStep),
    OpenTcp(OpenTcpStep),
    Dns(DnsStep),
    /// `TRANSFER_DATA` in flight; carries how many payload bytes have been
    /// handed to `sock_send` so far, since a single send may not take the
    /// whole buffer in one tick.
    Transfer(usize),
}

/// Everything the 19 commands need beyond the request packet itself.
/// Grounded on `struct mobile_adapter_commands`.
pub struct CommandProcessor {
    session_begun: bool,
    pub mode_32bit: bool,
    state: ConnState,
    connections: [bool; MAX_CONNECTIONS],
    call_packets_sent: u8,
    /// ISP-assigned DNS servers from the most recent `ISP_LOGIN`, distinct
    /// from [`AdapterConfig`]'s host-overridden `dns1`/`dns2`.
    isp_dns1: Addr,
    isp_dns2: Addr,
    dns2_use: bool,
    step: Step,
    current_command: u8,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        CommandProcessor {
            session_begun: false,
            mode_32bit: false,
            state: ConnState::Disconnected,
            connections: [false; MAX_CONNECTIONS],
            call_packets_sent: 0,
            isp_dns1: Addr::None,
            isp_dns2: Addr::None,
            dns2_use: false,
            step: Step::None,
            current_command: opcode::EMPTY,
        }
    }
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_begun(&self) -> bool {
        self.session_begun
    }

    fn connection_new(&self) -> Option<usize> {
        self.connections.iter().position(|&used| !used)
    }

    fn error_packet(command: u8, code: u8) -> Packet {
        Packet::error(command, code)
    }

    /// Dispatches one request, possibly resuming an in-flight multi-tick
    /// command. Returns `None` while still waiting on a socket or peer.
    /// Grounded on `mobile_commands_process`.
    pub fn process<C: Callbacks>(
        &mut self,
        cb: &mut C,
        config: &mut AdapterConfig,
        relay: &mut RelayClient,
        dns: &mut Resolver,
        request: &Packet,
    ) -> Option<Packet> {
        if request.command != self.current_command {
            self.current_command = request.command;
            self.step = Step::None;
        }

        match request.command {
            opcode::BEGIN_SESSION => Some(self.begin_session(config, request)),
            opcode::END_SESSION => Some(self.end_session(cb, relay)),
            opcode::DIAL_TELEPHONE => self.dial_telephone(cb, config, relay, request),
            opcode::HANG_UP_TELEPHONE => Some(self.hang_up_telephone(cb, relay)),
            opcode::WAIT_FOR_TELEPHONE_CALL => self.wait_for_telephone_call(cb, config, relay),
            opcode::TRANSFER_DATA => self.transfer_data(cb, request),
            opcode::RESET => Some(self.reset(cb, relay)),
            opcode::TELEPHONE_STATUS => Some(self.telephone_status(config)),
            opcode::SIO32_MODE => Some(self.sio32_mode(request)),
            opcode::READ_CONFIGURATION_DATA => Some(self.read_configuration_data(cb, request)),
            opcode::WRITE_CONFIGURATION_DATA => Some(self.write_configuration_data(cb, request)),
            opcode::ISP_LOGIN => Some(self.isp_login(config, request)),
            opcode::ISP_LOGOUT => Some(self.isp_logout(cb)),
            opcode::OPEN_TCP_CONNECTION => self.open_tcp_connection(cb, request),
            opcode::CLOSE_TCP_CONNECTION => Some(self.close_tcp_connection(cb, request)),
            opcode::OPEN_UDP_CONNECTION => Some(Self::error_packet(request.command, 1)),
            opcode::CLOSE_UDP_CONNECTION => Some(Self::error_packet(request.command, 1)),
            opcode::DNS_QUERY => self.dns_query(cb, config, dns, request),
            opcode::FIRMWARE_VERSION => Some(Self::error_packet(request.command, 0)),
            _ => Some(Self::error_packet(request.command, 0)),
        }
    }

    /// `BEGIN_SESSION`: verifies the `"NINTENDO"` magic. Red adapters accept
    /// a shorter 4-byte magic, a documented firmware quirk. Grounded on
    /// `do_begin_session`, which also clears the connection table.
    fn begin_session(&mut self, config: &AdapterConfig, request: &Packet) -> Packet {
        let data = request.data();
        let required = if config.device == crate::config::Device::Red { 4 } else { 8 };
        if data.len() < required || data[..required] != NINTENDO_MAGIC[..required] {
            return Self::error_packet(request.command, 1);
        }
        self.session_begun = true;
        self.state = ConnState::Disconnected;
        self.connections = [false; MAX_CONNECTIONS];
        debug!("commands: session begun");
        Packet::with_data(opcode::BEGIN_SESSION, &NINTENDO_MAGIC[..required])
    }

    /// `END_SESSION`: hangs up the p2p connection and ends the session.
    /// Whether this should also reset `mode_32bit` is untested on hardware;
    /// this preserves it, matching the original's shipped behaviour (see
    /// the `TODO` next to `do_end_session` in `commands.c`).
    fn end_session<C: Callbacks>(&mut self, cb: &mut C, relay: &mut RelayClient) -> Packet {
        self.do_isp_logout(cb);
        self.do_hang_up(cb, relay);
        self.session_begun = false;
        debug!("commands: session ended");
        Packet::empty(opcode::END_SESSION)
    }

    /// Unconditionally tears down the p2p connection and any relay
    /// in-flight state. Grounded on the p2p-closing half of
    /// `do_hang_up_telephone`.
    fn do_hang_up<C: Callbacks>(&mut self, cb: &mut C, relay: &mut RelayClient) {
        if self.connections[P2P_CONN] {
            cb.sock_close(P2P_CONN);
            self.connections[P2P_CONN] = false;
        }
        relay.reset();
        self.state = ConnState::Disconnected;
        self.call_packets_sent = 0;
    }

    /// `HANG_UP_TELEPHONE`: logs out of the ISP first (if logged in), then
    /// requires one of the three call states before closing the p2p slot.
    /// Grounded on `do_hang_up_telephone`.
    fn hang_up_telephone<C: Callbacks>(&mut self, cb: &mut C, relay: &mut RelayClient) -> Packet {
        self.do_isp_logout(cb);
        if !matches!(self.state, ConnState::Call | ConnState::CallRecv | ConnState::CallIsp) {
            return Self::error_packet(opcode::HANG_UP_TELEPHONE, 1);
        }
        self.do_hang_up(cb, relay);
        Packet::empty(opcode::HANG_UP_TELEPHONE)
    }

    /// `DIAL_TELEPHONE`: payload is `[protocol_byte, digits…]`. Checks the
    /// ISP magic-number table first, then a configured relay, then falls
    /// back to treating the 12 remaining digits as a dotted IPv4 address.
    /// Grounded on `command_dial_telephone_begin`.
    fn dial_telephone<C: Callbacks>(
        &mut self,
        cb: &mut C,
        config: &mut AdapterConfig,
        relay: &mut RelayClient,
        request: &Packet,
    ) -> Option<Packet> {
        let command = request.command;

        if !matches!(self.step, Step::Dial(_)) {
            cb.time_latch(Timer::Command);
            if !matches!(self.state, ConnState::Disconnected | ConnState::Wait | ConnState::WaitRelay) {
                return Some(Self::error_packet(command, 1));
            }
            let data = request.data();
            if data.is_empty() {
                return Some(Self::error_packet(command, 2));
            }
            let digits = &data[1..];

            // A p2p socket may still be open from a prior WAIT_FOR_TELEPHONE_CALL.
            if self.connections[P2P_CONN] {
                cb.sock_close(P2P_CONN);
                self.connections[P2P_CONN] = false;
            }
            self.state = ConnState::Disconnected;

            if ISP_NUMBERS.iter().any(|&number| number == digits) {
                self.state = ConnState::CallIsp;
                return Some(Packet::empty(command));
            }

            if !config.relay.is_none() {
                self.connections[P2P_CONN] = true;
                self.step = Step::Dial(DialStep::Relay);
                relay.reset();
                if !cb.sock_open(P2P_CONN, SockType::Tcp, AddrType::Ipv4, 0) {
                    self.connections[P2P_CONN] = false;
                    return Some(Self::error_packet(command, 3));
                }
            } else {
                let Ok(host) = parse_phone_addr(digits) else {
                    return Some(Self::error_packet(command, 3));
                };
                self.connections[P2P_CONN] = true;
                self.step = Step::Dial(DialStep::Ip);
                if !cb.sock_open(P2P_CONN, SockType::Tcp, AddrType::Ipv4, 0) {
                    self.connections[P2P_CONN] = false;
                    return Some(Self::error_packet(command, 3));
                }
                let addr = Addr::V4 { port: config.p2p_port, host };
                match cb.sock_connect(P2P_CONN, &addr) {
                    ConnectOutcome::Connected => {
                        self.state = ConnState::Call;
                        self.call_packets_sent = 0;
                        return Some(Packet::empty(command));
                    }
                    ConnectOutcome::Pending => return None,
                    ConnectOutcome::Error => {
                        cb.sock_close(P2P_CONN);
                        self.connections[P2P_CONN] = false;
                        return Some(Self::error_packet(command, 3));
                    }
                }
            }
        }

        if matches!(self.step, Step::Dial(_)) && cb.time_check_ms(Timer::Command, 60_000) {
            cb.sock_close(P2P_CONN);
            self.connections[P2P_CONN] = false;
            self.step = Step::None;
            return Some(Self::error_packet(command, 3));
        }

        let digits = &request.data()[1..];
        match self.step {
            Step::Dial(DialStep::Ip) => match cb.sock_connect(P2P_CONN, &Addr::None) {
                ConnectOutcome::Connected => {
                    self.state = ConnState::Call;
                    self.call_packets_sent = 0;
                    Some(Packet::empty(command))
                }
                ConnectOutcome::Pending => None,
                ConnectOutcome::Error => {
                    cb.sock_close(P2P_CONN);
                    self.connections[P2P_CONN] = false;
                    Some(Self::error_packet(command, 3))
                }
            },
            Step::Dial(DialStep::Relay) => {
                match relay.proc_call(cb, P2P_CONN, &config.relay, config, digits) {
                    RelayPoll::Pending => None,
                    RelayPoll::Error => {
                        warn!("commands: relay call failed, hanging up");
                        cb.sock_close(P2P_CONN);
                        self.connections[P2P_CONN] = false;
                        relay.reset();
                        Some(Self::error_packet(command, 3))
                    }
                    RelayPoll::Ready(CallResult::Accepted) => {
                        self.state = ConnState::Call;
                        self.call_packets_sent = 0;
                        Some(Packet::empty(command))
                    }
                    RelayPoll::Ready(CallResult::Busy) => Some(Self::error_packet(command, 1)),
                    RelayPoll::Ready(CallResult::Unavailable) => Some(Self::error_packet(command, 3)),
                }
            }
            _ => Some(Self::error_packet(command, 0)),
        }
    }

    /// `WAIT_FOR_TELEPHONE_CALL`: listens directly, or via the relay server
    /// if configured. Grounded on `command_wait_for_telephone_call`.
    fn wait_for_telephone_call<C: Callbacks>(
        &mut self,
        cb: &mut C,
        config: &mut AdapterConfig,
        relay: &mut RelayClient,
    ) -> Option<Packet> {
        let command = opcode::WAIT_FOR_TELEPHONE_CALL;

        if !matches!(self.step, Step::Wait(_)) {
            if self.state != ConnState::Disconnected {
                return Some(Self::error_packet(command, 0));
            }
            self.connections[P2P_CONN] = true;
            if config.relay.is_none() {
                self.state = ConnState::Wait;
                self.step = Step::Wait(WaitStep::Begin);
                if !cb.sock_open(P2P_CONN, SockType::Tcp, AddrType::Ipv4, config.p2p_port) {
                    self.do_hang_up(cb, relay);
                    return Some(Self::error_packet(command, 0));
                }
                if !cb.sock_listen(P2P_CONN) {
                    self.do_hang_up(cb, relay);
                    return Some(Self::error_packet(command, 0));
                }
            } else {
                self.state = ConnState::WaitRelay;
                self.step = Step::Wait(WaitStep::Relay);
                relay.reset();
                if !cb.sock_open(P2P_CONN, SockType::Tcp, AddrType::Ipv4, 0) {
                    self.do_hang_up(cb, relay);
                    return Some(Self::error_packet(command, 0));
                }
            }
        }

        match self.step {
            Step::Wait(WaitStep::Begin) => {
                if !cb.sock_accept(P2P_CONN) {
                    return None;
                }
                self.state = ConnState::Call;
                Some(Packet::empty(command))
            }
            Step::Wait(WaitStep::Relay) => match relay.proc_wait(cb, P2P_CONN, &config.relay, config) {
                RelayPoll::Pending => None,
                RelayPoll::Error => {
                    warn!("commands: relay wait failed, hanging up");
                    self.do_hang_up(cb, relay);
                    Some(Self::error_packet(command, 0))
                }
                RelayPoll::Ready((WaitResult::Accepted, _peer_number)) => {
                    self.state = ConnState::Call;
                    Some(Packet::empty(command))
                }
                RelayPoll::Ready((WaitResult::Internal, _)) => {
                    self.do_hang_up(cb, relay);
                    Some(Self::error_packet(command, 0))
                }
            },
            _ => Some(Self::error_packet(command, 0)),
        }
    }

    /// `TRANSFER_DATA`: ferries accumulated bytes over the active P2P or
    /// internet connection, resuming across ticks until the send completes
    /// (10s stuck-send timeout) and then polling for a reply (internet
    /// connections wait up to 1s for a reply before answering empty).
    /// `data[0]` is always a pass-through header byte — the connection id
    /// for internet connections, a placeholder otherwise — reused verbatim
    /// in the reply; the real payload is `data[1..]`. Grounded on
    /// `command_transfer_data`.
    fn transfer_data<C: Callbacks>(&mut self, cb: &mut C, request: &Packet) -> Option<Packet> {
        let command = opcode::TRANSFER_DATA;

        if !matches!(self.state, ConnState::Call | ConnState::CallRecv | ConnState::Internet) {
            return Some(Self::error_packet(command, 1));
        }
        let data = request.data();
        if data.is_empty() {
            return Some(Self::error_packet(command, 0));
        }
        let internet = self.state == ConnState::Internet;
        let header = data[0];
        let conn = if internet { header as usize } else { P2P_CONN };
        if conn >= MAX_CONNECTIONS || !self.connections[conn] {
            return Some(Self::error_packet(command, 0));
        }

        let payload = &data[1..];
        let send_size = payload.len();

        if !matches!(self.step, Step::Transfer(_)) {
            cb.time_latch(Timer::Command);
            self.step = Step::Transfer(0);
        }
        let Step::Transfer(mut sent_size) = self.step else { unreachable!() };

        if send_size > sent_size {
            match cb.sock_send(conn, &payload[sent_size..], None) {
                SendOutcome::Error => {
                    self.step = Step::None;
                    return Some(Self::error_packet(command, 0));
                }
                SendOutcome::Sent(n) => sent_size += n,
            }

            if send_size > sent_size {
                self.step = Step::Transfer(sent_size);
                if cb.time_check_ms(Timer::Command, 10_000) {
                    self.step = Step::None;
                    return Some(Self::error_packet(command, 0));
                }
                return None;
            }

            if !internet {
                self.call_packets_sent = self.call_packets_sent.saturating_add(1);
            }
        }

        let mut recv_buf = [0u8; MAX_TRANSFER_SIZE];
        let recv_outcome = if internet || self.call_packets_sent > 0 {
            cb.sock_recv(conn, &mut recv_buf, None)
        } else {
            // A liveness probe: no buffer, so any success just means "still
            // connected, nothing to report".
            match cb.sock_recv(conn, &mut [], None) {
                outcome @ (RecvOutcome::Error | RecvOutcome::PeerClosed) => outcome,
                _ => RecvOutcome::Empty,
            }
        };

        if !internet {
            if let RecvOutcome::Data(n) = recv_outcome {
                if n > 0 && self.call_packets_sent > 0 {
                    self.call_packets_sent -= 1;
                }
            }
        }

        if matches!(recv_outcome, RecvOutcome::PeerClosed) && internet {
            self.connections[conn] = false;
            cb.sock_close(conn);
            self.step = Step::None;
            return Some(Packet::with_data(opcode::TRANSFER_DATA_END, &[header]));
        }

        if matches!(recv_outcome, RecvOutcome::NoData) {
            self.step = Step::None;
            return Some(*request);
        }

        if matches!(recv_outcome, RecvOutcome::Error | RecvOutcome::PeerClosed) {
            self.step = Step::None;
            return Some(Self::error_packet(command, 0));
        }

        let recv_size = match recv_outcome {
            RecvOutcome::Data(n) => n,
            _ => 0,
        };

        if internet && send_size == 0 && recv_size == 0 && !cb.time_check_ms(Timer::Command, 1000) {
            return None;
        }

        self.step = Step::None;
        let mut out = [0u8; crate::packet::MAX_DATA_SIZE];
        out[0] = header;
        out[1..1 + recv_size].copy_from_slice(&recv_buf[..recv_size]);
        let mut response = Packet::empty(opcode::TRANSFER_DATA);
        response.set_data(&out[..1 + recv_size]);
        Some(response)
    }

    /// `RESET`: an internal `END_SESSION` followed immediately by a
    /// `BEGIN_SESSION`, so the session stays begun. Grounded on
    /// `command_reset`.
    fn reset<C: Callbacks>(&mut self, cb: &mut C, relay: &mut RelayClient) -> Packet {
        self.do_isp_logout(cb);
        self.do_hang_up(cb, relay);
        for conn in 0..MAX_CONNECTIONS {
            if self.connections[conn] {
                cb.sock_close(conn);
                self.connections[conn] = false;
            }
        }
        self.session_begun = true;
        self.mode_32bit = false;
        Packet::empty(opcode::RESET)
    }

    /// `TELEPHONE_STATUS`: call state, device-specific magic byte, and the
    /// unmetered flag. Grounded on `command_telephone_status`.
    fn telephone_status(&self, config: &AdapterConfig) -> Packet {
        let state_byte: u8 = match self.state {
            ConnState::Call | ConnState::CallIsp | ConnState::Internet => 4,
            ConnState::CallRecv => 5,
            _ => 0,
        };
        let device_byte = match config.device {
            crate::config::Device::Red | crate::config::Device::Yellow => 0x48,
            _ => 0x4D,
        };
        let unmetered_byte = if config.unmetered { 0xF0 } else { 0x00 };
        Packet::with_data(opcode::TELEPHONE_STATUS, &[state_byte, device_byte, unmetered_byte])
    }

    fn sio32_mode(&mut self, request: &Packet) -> Packet {
        if let Some(&flag) = request.data().first() {
            self.mode_32bit = flag != 0;
        }
        Packet::empty(opcode::SIO32_MODE)
    }

    /// Caps a single read/write at `0x80` bytes within the `0x100`-byte
    /// game-visible config window, per `MOBILE_CONFIG_SIZE_REAL`.
    const CONFIG_WINDOW: usize = 0x100;
    const CONFIG_MAX_CHUNK: usize = 0x80;

    fn read_configuration_data<C: Callbacks>(&mut self, cb: &mut C, request: &Packet) -> Packet {
        let data = request.data();
        if data.len() < 2 {
            return Self::error_packet(request.command, 0);
        }
        let offset = data[0] as usize;
        let len = (data[1] as usize).min(Self::CONFIG_MAX_CHUNK);
        if offset + len > Self::CONFIG_WINDOW {
            return Self::error_packet(request.command, 0);
        }
        let mut buf = [0u8; Self::CONFIG_MAX_CHUNK];
        if offset < crate::config::PERSISTED_SIZE {
            let backed = len.min(crate::config::PERSISTED_SIZE - offset);
            if !cb.config_read(&mut buf[..backed], offset) {
                return Self::error_packet(request.command, 0);
            }
        }
        let mut response = Packet::empty(opcode::READ_CONFIGURATION_DATA);
        let mut out = [0u8; crate::packet::MAX_DATA_SIZE];
        out[0] = data[0];
        out[1] = len as u8;
        out[2..2 + len].copy_from_slice(&buf[..len]);
        response.set_data(&out[..2 + len]);
        response
    }

    fn write_configuration_data<C: Callbacks>(&mut self, cb: &mut C, request: &Packet) -> Packet {
        let data = request.data();
        if data.len() < 2 {
            return Self::error_packet(request.command, 0);
        }
        let offset = data[0] as usize;
        let len = data.len() - 1;
        if len > Self::CONFIG_MAX_CHUNK || offset + len > Self::CONFIG_WINDOW {
            return Self::error_packet(request.command, 0);
        }
        if offset < crate::config::PERSISTED_SIZE {
            let backed = len.min(crate::config::PERSISTED_SIZE - offset);
            if !cb.config_write(&data[1..1 + backed], offset) {
                return Self::error_packet(request.command, 0);
            }
        }
        Packet::empty(opcode::WRITE_CONFIGURATION_DATA)
    }

    /// `ISP_LOGIN`: requires `CALL_ISP`. Accepts size-prefixed id/password
    /// fields (credentials are parsed but never used), extracts the two DNS
    /// servers the ISP offered (falling back to host-configured overrides
    /// when the game sent an empty one), transitions to `INTERNET`, and
    /// answers with the phone's own loopback address plus the chosen DNS
    /// pair. Grounded on `command_isp_login`.
    fn isp_login(&mut self, config: &AdapterConfig, request: &Packet) -> Packet {
        let data = request.data();
        let command = request.command;

        if self.state != ConnState::CallIsp {
            return Self::error_packet(command, 1);
        }
        if self.connections[P2P_CONN] {
            return Self::error_packet(command, 3);
        }

        let mut pos = 0usize;
        let Some(&id_len) = data.get(pos) else {
            return Self::error_packet(command, 2);
        };
        pos += 1 + id_len as usize;
        let Some(&pass_len) = data.get(pos) else {
            return Self::error_packet(command, 2);
        };
        pos += 1 + pass_len as usize;

        if data.len() < pos + 8 {
            return Self::error_packet(command, 2);
        }
        let mut isp_dns1 = [0u8; 4];
        let mut isp_dns2 = [0u8; 4];
        isp_dns1.copy_from_slice(&data[pos..pos + 4]);
        isp_dns2.copy_from_slice(&data[pos + 4..pos + 8]);
        let dns1_empty = isp_dns1 == [0; 4];
        let dns2_empty = isp_dns2 == [0; 4];

        self.isp_dns1 = if dns1_empty { Addr::None } else { Addr::V4 { port: crate::dns::DNS_PORT, host: isp_dns1 } };
        self.isp_dns2 = if dns2_empty { Addr::None } else { Addr::V4 { port: crate::dns::DNS_PORT, host: isp_dns2 } };

        let dns1_reply = if dns1_empty { config.dns1.host_v4().unwrap_or([0; 4]) } else { isp_dns1 };
        let dns2_reply = if dns2_empty { config.dns2.host_v4().unwrap_or([0; 4]) } else { isp_dns2 };

        self.dns2_use = false;
        self.state = ConnState::Internet;
        debug!("commands: isp login complete, entering internet mode");

        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&ISP_IP);
        out[4..8].copy_from_slice(&dns1_reply);
        out[8..12].copy_from_slice(&dns2_reply);
        Packet::with_data(opcode::ISP_LOGIN, &out)
    }

    /// Closes any open internet slots and returns to `CALL_ISP`. Shared by
    /// `ISP_LOGOUT` and the hang-up/reset paths. Grounded on `do_isp_logout`.
    fn do_isp_logout<C: Callbacks>(&mut self, cb: &mut C) -> bool {
        if self.state != ConnState::Internet {
            return false;
        }
        for conn in 0..MAX_CONNECTIONS {
            if self.connections[conn] {
                cb.sock_close(conn);
                self.connections[conn] = false;
            }
        }
        self.state = ConnState::CallIsp;
        true
    }

    fn isp_logout<C: Callbacks>(&mut self, cb: &mut C) -> Packet {
        if !self.do_isp_logout(cb) {
            return Self::error_packet(opcode::ISP_LOGOUT, 1);
        }
        Packet::empty(opcode::ISP_LOGOUT)
    }

    /// `OPEN_TCP_CONNECTION`: dials a raw IPv4 address in one of the two
    /// internet connection slots. Grounded on `command_open_tcp_connection`.
    fn open_tcp_connection<C: Callbacks>(&mut self, cb: &mut C, request: &Packet) -> Option<Packet> {
        let command = opcode::OPEN_TCP_CONNECTION;
        let data = request.data();

        if !matches!(self.step, Step::OpenTcp(_)) {
            cb.time_latch(Timer::Command);
            if data.len() < 6 {
                return Some(Self::error_packet(command, 0));
            }
            let Some(conn) = self.connection_new() else {
                return Some(Self::error_packet(command, 0));
            };
            let mut host = [0u8; 4];
            host.copy_from_slice(&data[..4]);
            let port = u16::from_be_bytes([data[4], data[5]]);

            if !cb.sock_open(conn, SockType::Tcp, AddrType::Ipv4, 0) {
                return Some(Self::error_packet(command, 0));
            }
            match cb.sock_connect(conn, &Addr::V4 { port, host }) {
                ConnectOutcome::Connected => {
                    self.connections[conn] = true;
                    return Some(Packet::with_data(command, &[conn as u8]));
                }
                ConnectOutcome::Pending => {
                    self.step = Step::OpenTcp(OpenTcpStep::Connecting);
                    self.connections[conn] = true;
                    return self.open_tcp_connection_poll(cb, conn);
                }
                ConnectOutcome::Error => {
                    cb.sock_close(conn);
                    return Some(Self::error_packet(command, 0));
                }
            }
        }

        let conn = self.connections.iter().position(|&used| used).unwrap_or(0);
        if cb.time_check_ms(Timer::Command, 60_000) {
            cb.sock_close(conn);
            self.connections[conn] = false;
            self.step = Step::None;
            return Some(Self::error_packet(command, 3));
        }
        self.open_tcp_connection_poll(cb, conn)
    }

    fn open_tcp_connection_poll<C: Callbacks>(&mut self, cb: &mut C, conn: usize) -> Option<Packet> {
        match cb.sock_connect(conn, &Addr::None) {
            ConnectOutcome::Connected => {
                self.step = Step::None;
                Some(Packet::with_data(opcode::OPEN_TCP_CONNECTION, &[conn as u8]))
            }
            ConnectOutcome::Pending => None,
            ConnectOutcome::Error => {
                self.connections[conn] = false;
                cb.sock_close(conn);
                self.step = Step::None;
                Some(Self::error_packet(opcode::OPEN_TCP_CONNECTION, 0))
            }
        }
    }

    fn close_tcp_connection<C: Callbacks>(&mut self, cb: &mut C, request: &Packet) -> Packet {
        let command = request.command;
        let Some(&conn) = request.data().first() else {
            return Self::error_packet(command, 0);
        };
        let conn = conn as usize;
        if conn >= MAX_CONNECTIONS || !self.connections[conn] {
            return Self::error_packet(command, 0);
        }
        cb.sock_close(conn);
        self.connections[conn] = false;
        Packet::with_data(command, &[conn as u8])
    }

    /// `DNS_QUERY`: resolves `data()` as a hostname, or parses it directly
    /// as a dotted-decimal address with no socket round trip at all. Falls
    /// back between the ISP-assigned and host-configured DNS server pairs.
    /// Grounded on `command_dns_query` / `dns_get_addr`.
    fn dns_query<C: Callbacks>(
        &mut self,
        cb: &mut C,
        config: &AdapterConfig,
        dns: &mut Resolver,
        request: &Packet,
    ) -> Option<Packet> {
        let command = opcode::DNS_QUERY;
        let host = request.data();

        if is_ip_address(host) {
            return match parse_ipv4(host) {
                Some(ip) => Some(Packet::with_data(command, &ip)),
                None => Some(Self::error_packet(command, 0)),
            };
        }

        if self.step != Step::Dns(DnsStep::Check) {
            trace!("commands: sending dns query");
            let server = self.dns_server(config);
            if server.is_none() || !dns.open(cb, P2P_CONN, &server) || !dns.request_send(cb, P2P_CONN, &server, host)
            {
                cb.sock_close(P2P_CONN);
                self.step = Step::None;
                return Some(Self::error_packet(command, 0));
            }
            self.step = Step::Dns(DnsStep::Check);
        }

        let server = self.dns_server(config);
        match dns.request_recv(cb, P2P_CONN, &server, host) {
            QueryPoll::Pending => None,
            QueryPoll::Answer(ip) => {
                cb.sock_close(P2P_CONN);
                self.step = Step::None;
                self.dns2_use = false;
                Some(Packet::with_data(command, &ip))
            }
            QueryPoll::Error => {
                cb.sock_close(P2P_CONN);
                self.step = Step::None;
                if !self.dns2_use {
                    self.dns2_use = true;
                    if !self.dns_server(config).is_none() {
                        trace!("commands: dns query failed, retrying against secondary server");
                        return self.dns_query(cb, config, dns, request);
                    }
                }
                warn!("commands: dns query failed");
                self.dns2_use = false;
                Some(Self::error_packet(command, 0))
            }
        }
    }

    /// Picks between the configured-override and ISP-assigned DNS pairs,
    /// then between primary/secondary within that pair, per `dns_get_addr`.
    fn dns_server(&self, config: &AdapterConfig) -> Addr {
        let (primary, secondary) = if !config.dns1.is_none() || !config.dns2.is_none() {
            (config.dns1, config.dns2)
        } else {
            (self.isp_dns1, self.isp_dns2)
        };
        if !self.dns2_use && !primary.is_none() {
            primary
        } else {
            secondary
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;
    use crate::callbacks::{NumberKind, Timer};

    struct MockHost {
        config: [u8; crate::config::PERSISTED_SIZE],
    }

    impl MockHost {
        fn new() -> Self {
            MockHost { config: [0; crate::config::PERSISTED_SIZE] }
        }
    }

    impl Callbacks for MockHost {
        fn debug_log(&mut self, _line: &str) {}
        fn serial_disable(&mut self) {}
        fn serial_enable(&mut self) {}
        fn config_read(&mut self, dest: &mut [u8], offset: usize) -> bool {
            dest.copy_from_slice(&self.config[offset..offset + dest.len()]);
            true
        }
        fn config_write(&mut self, src: &[u8], offset: usize) -> bool {
            self.config[offset..offset + src.len()].copy_from_slice(src);
            true
        }
        fn time_latch(&mut self, _timer: Timer) {}
        fn time_check_ms(&mut self, _timer: Timer, _ms: u32) -> bool {
            false
        }
        fn sock_open(&mut self, _conn: usize, _ty: SockType, _addr_ty: AddrType, _bind_port: u16) -> bool {
            true
        }
        fn sock_close(&mut self, _conn: usize) {}
        fn sock_connect(&mut self, _conn: usize, _addr: &Addr) -> ConnectOutcome {
            ConnectOutcome::Connected
        }
        fn sock_listen(&mut self, _conn: usize) -> bool {
            true
        }
        fn sock_accept(&mut self, _conn: usize) -> bool {
            false
        }
        fn sock_send(&mut self, _conn: usize, data: &[u8], _addr: Option<&Addr>) -> SendOutcome {
            SendOutcome::Sent(data.len())
        }
        fn sock_recv(&mut self, _conn: usize, _data: &mut [u8], _addr: Option<&mut Addr>) -> RecvOutcome {
            RecvOutcome::NoData
        }
        fn update_number(&mut self, _which: NumberKind, _digits: &str) {}
    }

    /// A host whose `sock_send` only ever accepts `send_chunk` bytes at a
    /// time, to exercise `TRANSFER_DATA`'s multi-tick resend loop, and whose
    /// `sock_recv` serves from a queue so the reply payload is observable.
    struct PartialSendHost {
        send_chunk: usize,
        sent: alloc::vec::Vec<u8>,
        recv_queue: alloc::vec::Vec<u8>,
        force_timeout: bool,
    }

    impl Callbacks for PartialSendHost {
        fn debug_log(&mut self, _line: &str) {}
        fn serial_disable(&mut self) {}
        fn serial_enable(&mut self) {}
        fn config_read(&mut self, _dest: &mut [u8], _offset: usize) -> bool {
            true
        }
        fn config_write(&mut self, _src: &[u8], _offset: usize) -> bool {
            true
        }
        fn time_latch(&mut self, _timer: Timer) {}
        fn time_check_ms(&mut self, _timer: Timer, _ms: u32) -> bool {
            self.force_timeout
        }
        fn sock_open(&mut self, _conn: usize, _ty: SockType, _addr_ty: AddrType, _bind_port: u16) -> bool {
            true
        }
        fn sock_close(&mut self, _conn: usize) {}
        fn sock_connect(&mut self, _conn: usize, _addr: &Addr) -> ConnectOutcome {
            ConnectOutcome::Connected
        }
        fn sock_listen(&mut self, _conn: usize) -> bool {
            true
        }
        fn sock_accept(&mut self, _conn: usize) -> bool {
            false
        }
        fn sock_send(&mut self, _conn: usize, data: &[u8], _addr: Option<&Addr>) -> SendOutcome {
            let n = data.len().min(self.send_chunk);
            self.sent.extend_from_slice(&data[..n]);
            SendOutcome::Sent(n)
        }
        fn sock_recv(&mut self, _conn: usize, data: &mut [u8], _addr: Option<&mut Addr>) -> RecvOutcome {
            if self.recv_queue.is_empty() {
                return RecvOutcome::Empty;
            }
            let n = data.len().min(self.recv_queue.len());
            data[..n].copy_from_slice(&self.recv_queue[..n]);
            self.recv_queue.drain(..n);
            RecvOutcome::Data(n)
        }
        fn update_number(&mut self, _which: NumberKind, _digits: &str) {}
    }

    #[test]
    fn transfer_data_resumes_partial_send_across_ticks() {
        let mut proc = CommandProcessor::new();
        proc.state = ConnState::Call;
        proc.connections[P2P_CONN] = true;
        let mut host = PartialSendHost {
            send_chunk: 2,
            sent: alloc::vec::Vec::new(),
            recv_queue: alloc::vec![9u8, 9],
            force_timeout: false,
        };
        let req = Packet::with_data(opcode::TRANSFER_DATA, &[0xFF, 1, 2, 3, 4]);

        // Only 2 of the 4 payload bytes go out on the first tick; the
        // command must suspend rather than declare the transfer done.
        assert!(proc.transfer_data(&mut host, &req).is_none());
        assert_eq!(host.sent, alloc::vec![1u8, 2]);

        // The second tick finishes the send (header byte never touches the
        // socket) and then receives the queued reply.
        let resp = proc.transfer_data(&mut host, &req).unwrap();
        assert_eq!(host.sent, alloc::vec![1u8, 2, 3, 4]);
        assert_eq!(resp.command, opcode::TRANSFER_DATA);
        assert_eq!(resp.data()[0], 0xFF);
        assert_eq!(&resp.data()[1..], &[9, 9]);
    }

    #[test]
    fn transfer_data_echoes_request_unchanged_on_no_data_sentinel() {
        let mut proc = CommandProcessor::new();
        proc.state = ConnState::Call;
        proc.connections[P2P_CONN] = true;
        let mut host = MockHost::new();
        let req = Packet::with_data(opcode::TRANSFER_DATA, &[0xAB, 1, 2, 3]);
        let resp = proc.transfer_data(&mut host, &req).unwrap();
        assert_eq!(resp.command, opcode::TRANSFER_DATA);
        assert_eq!(resp.data(), req.data());
    }

    #[test]
    fn transfer_data_internet_empty_recv_keeps_connection_prefix() {
        let mut proc = CommandProcessor::new();
        proc.state = ConnState::Internet;
        proc.connections[1] = true;
        let mut host = PartialSendHost {
            send_chunk: 0,
            sent: alloc::vec::Vec::new(),
            recv_queue: alloc::vec::Vec::new(),
            force_timeout: true,
        };
        let req = Packet::with_data(opcode::TRANSFER_DATA, &[1]);
        let resp = proc.transfer_data(&mut host, &req).unwrap();
        assert_eq!(resp.data(), &[1]);
    }

    #[test]
    fn begin_session_requires_nintendo_magic() {
        let mut proc = CommandProcessor::new();
        let mut config = AdapterConfig::default();
        let bad = Packet::with_data(opcode::BEGIN_SESSION, b"wrong!!!");
        assert_eq!(proc.begin_session(&mut config, &bad).command, opcode::ERROR);

        let good = Packet::with_data(opcode::BEGIN_SESSION, NINTENDO_MAGIC);
        let resp = proc.begin_session(&mut config, &good);
        assert_eq!(resp.command, opcode::BEGIN_SESSION);
        assert!(proc.session_begun());
    }

    #[test]
    fn unknown_command_yields_error_packet() {
        let mut proc = CommandProcessor::new();
        let mut host = MockHost::new();
        let mut config = AdapterConfig::default();
        let mut relay = RelayClient::new();
        let mut dns = Resolver::new();
        let req = Packet::empty(opcode::FIRMWARE_VERSION);
        let resp = proc.process(&mut host, &mut config, &mut relay, &mut dns, &req).unwrap();
        assert_eq!(resp.command, opcode::ERROR);
    }

    #[test]
    fn dial_telephone_by_ip_connects_immediately() {
        let mut proc = CommandProcessor::new();
        let mut host = MockHost::new();
        let mut config = AdapterConfig::default();
        let mut relay = RelayClient::new();
        let req = Packet::with_data(opcode::DIAL_TELEPHONE, b"\x00127000000001");
        let resp = proc.dial_telephone(&mut host, &mut config, &mut relay, &req).unwrap();
        assert_eq!(resp.command, opcode::DIAL_TELEPHONE);
        assert!(resp.data().is_empty());
    }

    #[test]
    fn dial_telephone_matches_isp_magic_number_without_a_socket() {
        let mut proc = CommandProcessor::new();
        let mut host = MockHost::new();
        let mut config = AdapterConfig::default();
        let mut relay = RelayClient::new();
        let mut payload = alloc::vec![0u8];
        payload.extend_from_slice(b"#9677");
        let req = Packet::with_data(opcode::DIAL_TELEPHONE, &payload);
        let resp = proc.dial_telephone(&mut host, &mut config, &mut relay, &req).unwrap();
        assert_eq!(resp.command, opcode::DIAL_TELEPHONE);
        assert!(resp.data().is_empty());
    }

    #[test]
    fn dns_query_parses_inline_ipv4_without_a_socket() {
        let mut proc = CommandProcessor::new();
        let mut host = MockHost::new();
        let config = AdapterConfig::default();
        let mut dns = Resolver::new();
        let req = Packet::with_data(opcode::DNS_QUERY, b"1.2.3.4");
        let resp = proc.dns_query(&mut host, &config, &mut dns, &req).unwrap();
        assert_eq!(resp.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn read_configuration_data_caps_at_0x80_bytes() {
        let mut proc = CommandProcessor::new();
        let mut host = MockHost::new();
        let req = Packet::with_data(opcode::READ_CONFIGURATION_DATA, &[0, 0xFF]);
        let resp = proc.read_configuration_data(&mut host, &req);
        assert_eq!(resp.data()[1], 0x80);
    }

    #[test]
    fn end_session_preserves_32bit_mode_but_clears_session_and_calls() {
        let mut proc = CommandProcessor::new();
        let mut host = MockHost::new();
        let mut config = AdapterConfig::default();
        let mut relay = RelayClient::new();
        let mut dns = Resolver::new();

        let good = Packet::with_data(opcode::BEGIN_SESSION, NINTENDO_MAGIC);
        proc.process(&mut host, &mut config, &mut relay, &mut dns, &good);
        proc.mode_32bit = true;

        let req = Packet::empty(opcode::END_SESSION);
        let resp = proc.process(&mut host, &mut config, &mut relay, &mut dns, &req).unwrap();
        assert_eq!(resp.command, opcode::END_SESSION);
        assert!(!proc.session_begun());
        assert!(proc.mode_32bit);
    }
}
