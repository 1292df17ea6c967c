//! Emulation core for the Game Boy Mobile Adapter GB.
//!
//! This crate implements the peripheral's serial protocol, command
//! processor, relay client and DNS resolver against a host-supplied
//! [`Callbacks`](callbacks::Callbacks) implementation. It performs no
//! socket I/O, timekeeping, or persistence itself; all of that is
//! delegated to the host through the callback trait.
#![no_std]
#![allow(clippy::upper_case_acronyms)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod addr;
pub mod adapter;
pub mod callbacks;
pub mod commands;
pub mod config;
pub mod debug;
pub mod dns;
pub mod error;
pub mod packet;
pub mod presentation;
pub mod relay;
pub mod scheduler;
pub mod serial;

pub use adapter::Adapter;
pub use callbacks::{AddrType, Callbacks, NumberKind, SockType};
pub use config::{AdapterConfig, Device};
pub use error::{CommandError, SerialError};
pub use packet::{Packet, MAX_DATA_SIZE};
