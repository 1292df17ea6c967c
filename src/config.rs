//! Runtime adapter configuration and persisted-blob bookkeeping.
//!
//! Two distinct things live here, mirroring the split between `config.c`
//! and the `config_clear`/`config_verify` statics in `mobile.c`:
//!
//! - [`AdapterConfig`]: in-memory settings a host sets once at startup
//!   (device variant, DNS overrides, p2p port, relay address/token). Never
//!   touches [`crate::Callbacks::config_read`]/`config_write` itself.
//! - [`verify_persisted`]/[`clear_persisted`]: the 192-byte `"MA"`-tagged,
//!   checksummed blob that *is* read/written through those callbacks, and
//!   which the game accesses piecemeal via `READ_CONFIGURATION_DATA`/
//!   `WRITE_CONFIGURATION_DATA`. The core only touches it as a whole at
//!   [`crate::Adapter::init`] time, to decide whether to zero it.

use crate::addr::Addr;
use crate::callbacks::Callbacks;

/// Device variant being emulated. Values match `enum mobile_adapter_device`
/// in `mobile.h`; the low two values are the Game Boy's own identifiers and
/// are never latched as `adapter`, only compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Device {
    GameBoy = 0,
    GameBoyAdvance = 1,
    Blue = 8,
    Yellow = 9,
    Green = 10,
    Red = 11,
}

/// Bit OR-ed into the wire device byte to signal an unmetered connection to
/// Pokémon Crystal (Japan); see `MOBILE_CONFIG_DEVICE_UNMETERED`.
pub const DEVICE_UNMETERED_BIT: u8 = 0x80;

/// Default peer-to-peer port, `MOBILE_DEFAULT_P2P_PORT`.
pub const DEFAULT_P2P_PORT: u16 = 1027;

pub const RELAY_TOKEN_SIZE: usize = 0x10;

/// In-memory configuration, set once by the host and consulted by the
/// command processor. Grounded on `struct mobile_adapter_config`
/// (`mobile.h`) and the setters in `config.c`.
#[derive(Debug, Clone, Copy)]
pub struct AdapterConfig {
    pub device: Device,
    pub unmetered: bool,
    pub dns1: Addr,
    pub dns2: Addr,
    pub p2p_port: u16,
    pub relay: Addr,
    relay_token: [u8; RELAY_TOKEN_SIZE],
    relay_token_init: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            device: Device::Blue,
            unmetered: false,
            dns1: Addr::None,
            dns2: Addr::None,
            p2p_port: DEFAULT_P2P_PORT,
            relay: Addr::None,
            relay_token: [0; RELAY_TOKEN_SIZE],
            relay_token_init: false,
        }
    }
}

impl AdapterConfig {
    /// Device byte as transmitted on the wire, with the unmetered bit OR-ed
    /// in if set.
    pub fn device_byte(&self) -> u8 {
        self.device as u8 | if self.unmetered { DEVICE_UNMETERED_BIT } else { 0 }
    }

    pub fn set_device(&mut self, device: Device, unmetered: bool) {
        self.device = device;
        self.unmetered = unmetered;
    }

    pub fn set_dns(&mut self, dns1: Addr, dns2: Addr) {
        self.dns1 = dns1;
        self.dns2 = dns2;
    }

    /// Ignores a port of zero, matching `mobile_config_set_p2p_port`'s
    /// guard against accidentally clearing the port.
    pub fn set_p2p_port(&mut self, port: u16) {
        if port != 0 {
            self.p2p_port = port;
        }
    }

    pub fn set_relay(&mut self, relay: Addr) {
        self.relay = relay;
    }

    pub fn set_relay_token(&mut self, token: [u8; RELAY_TOKEN_SIZE]) {
        self.relay_token = token;
        self.relay_token_init = true;
    }

    /// Returns the stored relay token, if the server has ever issued one.
    pub fn relay_token(&self) -> Option<[u8; RELAY_TOKEN_SIZE]> {
        self.relay_token_init.then_some(self.relay_token)
    }
}

/// Size of the persisted configuration blob, `MOBILE_CONFIG_SIZE_INTERNAL`.
/// The game-visible window (`READ/WRITE_CONFIGURATION_DATA`) additionally
/// bounds itself to `MOBILE_CONFIG_SIZE_REAL = 0x100`, independent of this
/// smaller on-disk size; everything beyond offset `PERSISTED_SIZE` the game
/// may address is simply never backed by the checksum below.
pub const PERSISTED_SIZE: usize = 0xC0;

const MAGIC: [u8; 2] = *b"MA";

/// Verifies the persisted blob's `"MA"` magic and trailing 16-bit
/// big-endian checksum over the first `PERSISTED_SIZE - 2` bytes.
/// Grounded on `config_verify` in `mobile.c`.
pub fn verify_persisted<C: Callbacks>(cb: &mut C) -> bool {
    let mut buf = [0u8; PERSISTED_SIZE];
    if !cb.config_read(&mut buf, 0) {
        return false;
    }
    if buf[0..2] != MAGIC {
        return false;
    }
    let checksum: u16 = buf[..PERSISTED_SIZE - 2]
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    let stored = u16::from_be_bytes([buf[PERSISTED_SIZE - 2], buf[PERSISTED_SIZE - 1]]);
    checksum == stored
}

/// Zeroes the persisted blob. Grounded on `config_clear` in `mobile.c`.
pub fn clear_persisted<C: Callbacks>(cb: &mut C) {
    let buf = [0u8; PERSISTED_SIZE];
    cb.config_write(&buf, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_blue_adapter_defaults() {
        let cfg = AdapterConfig::default();
        assert_eq!(cfg.device, Device::Blue);
        assert_eq!(cfg.p2p_port, 1027);
        assert!(cfg.relay_token().is_none());
    }

    #[test]
    fn zero_port_is_ignored() {
        let mut cfg = AdapterConfig::default();
        cfg.set_p2p_port(0);
        assert_eq!(cfg.p2p_port, 1027);
        cfg.set_p2p_port(4000);
        assert_eq!(cfg.p2p_port, 4000);
    }

    #[test]
    fn device_byte_carries_unmetered_bit() {
        let mut cfg = AdapterConfig::default();
        cfg.set_device(Device::Red, true);
        assert_eq!(cfg.device_byte(), Device::Red as u8 | DEVICE_UNMETERED_BIT);
    }
}
