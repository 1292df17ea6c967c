//! The top-level handle a host embeds: one per emulated adapter.
//!
//! Ties the serial framer, command processor, relay client, resolver and
//! configuration together behind two entry points a host calls on its own
//! schedule: [`Adapter::transfer`] for each byte shifted over the link
//! cable, and [`Adapter::tick`] for periodic maintenance. Grounded on
//! `struct mobile_adapter` and the top-level functions in `mobile.c`.

use log::debug;

use crate::callbacks::Callbacks;
use crate::commands::CommandProcessor;
use crate::config::{self, AdapterConfig};
use crate::debug::Tracer;
use crate::dns::Resolver;
use crate::relay::RelayClient;
use crate::scheduler;
use crate::serial::SerialFramer;

/// One emulated Game Boy Mobile Adapter GB.
pub struct Adapter {
    pub config: AdapterConfig,
    serial: SerialFramer,
    commands: CommandProcessor,
    relay: RelayClient,
    dns: Resolver,
    tracer: Tracer,
}

impl Default for Adapter {
    fn default() -> Self {
        Adapter {
            config: AdapterConfig::default(),
            serial: SerialFramer::new(),
            commands: CommandProcessor::new(),
            relay: RelayClient::new(),
            dns: Resolver::new(),
            tracer: Tracer::new(),
        }
    }
}

impl Adapter {
    pub fn new(config: AdapterConfig) -> Self {
        Adapter { config, ..Self::default() }
    }

    /// Verifies the persisted config blob (clearing it if corrupt or
    /// uninitialized), latches the serial timer, and enables serial
    /// delivery. Grounded on `mobile_init`.
    pub fn init<C: Callbacks>(&mut self, cb: &mut C) {
        if !config::verify_persisted(cb) {
            debug!("adapter: persisted config missing or corrupt, clearing");
            config::clear_persisted(cb);
        }
        cb.time_latch(crate::callbacks::Timer::Serial);
        debug!("adapter: initialized");
        cb.serial_enable();
    }

    /// Shifts one byte in, returns one byte out. Grounded on
    /// `mobile_transfer`.
    pub fn transfer<C: Callbacks>(&mut self, cb: &mut C, c: u8) -> u8 {
        cb.time_latch(crate::callbacks::Timer::Serial);
        self.serial.mark_active();

        if self.serial.is_waiting() && self.commands.mode_32bit != self.serial.mode_32bit {
            return 0xD2;
        }

        self.serial.transfer(c, self.commands.session_begun(), self.config.device_byte())
    }

    /// Runs one maintenance pass: processes a ready command, flips 32-bit
    /// mode, or resets the link as timeouts dictate. A host should call
    /// this regularly, independent of [`Self::transfer`]. Grounded on
    /// `mobile_loop`.
    pub fn tick<C: Callbacks>(&mut self, cb: &mut C) {
        let config = &mut self.config;
        let relay = &mut self.relay;
        let dns = &mut self.dns;
        let tracer = &mut self.tracer;

        scheduler::tick(cb, &mut self.serial, &mut self.commands, |cb, serial, commands| {
            let request = serial.take_request();
            tracer.log_command(cb, &request, false);
            if let Some(response) = commands.process(cb, config, relay, dns, &request) {
                tracer.log_command(cb, &response, true);
                serial.set_response(&response);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;
    use crate::callbacks::{AddrType, ConnectOutcome, NumberKind, RecvOutcome, SendOutcome, SockType, Timer};
    use alloc::vec::Vec;

    struct TestHost {
        config: [u8; config::PERSISTED_SIZE],
        serial_enabled: bool,
    }

    impl TestHost {
        fn new() -> Self {
            TestHost { config: [0; config::PERSISTED_SIZE], serial_enabled: false }
        }
    }

    impl Callbacks for TestHost {
        fn debug_log(&mut self, _line: &str) {}
        fn serial_disable(&mut self) {
            self.serial_enabled = false;
        }
        fn serial_enable(&mut self) {
            self.serial_enabled = true;
        }
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

    fn feed(adapter: &mut Adapter, host: &mut TestHost, bytes: &[u8]) -> Vec<u8> {
        bytes.iter().map(|&b| adapter.transfer(host, b)).collect()
    }

    #[test]
    fn init_clears_corrupt_persisted_config() {
        let mut host = TestHost::new();
        host.config[0] = 0xFF;
        let mut adapter = Adapter::default();
        adapter.init(&mut host);
        assert!(config::verify_persisted(&mut host));
        assert!(host.serial_enabled);
    }

    #[test]
    fn full_begin_session_round_trip_via_transfer_and_tick() {
        let mut host = TestHost::new();
        let mut adapter = Adapter::default();
        adapter.init(&mut host);

        // magic, header(BEGIN_SESSION, 0, 0, len=8), "NINTENDO", checksum,
        // device ack, idle-check filler, idle confirm.
        let mut bytes = alloc::vec::Vec::new();
        bytes.extend_from_slice(&[0x99, 0x66, 0x10, 0, 0, 8]);
        bytes.extend_from_slice(b"NINTENDO");
        let checksum: u16 = bytes[2..].iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
        bytes.push((checksum >> 8) as u8);
        bytes.push(checksum as u8);
        bytes.push(0x80);
        bytes.push(0x00);
        bytes.push(0x4B);

        feed(&mut adapter, &mut host, &bytes);
        assert!(adapter.serial.awaiting_response());

        adapter.tick(&mut host);
        assert!(adapter.commands.session_begun());
        assert!(!adapter.serial.awaiting_response());
    }

    #[test]
    fn mode_mismatch_echoes_idle_byte_without_touching_serial_state() {
        let mut host = TestHost::new();
        let mut adapter = Adapter::default();
        adapter.init(&mut host);
        adapter.commands.mode_32bit = true;
        assert_eq!(adapter.transfer(&mut host, 0x00), 0xD2);
    }
}
