//! The maintenance scheduler: decides what (if anything) should happen
//! outside of a byte actually arriving over serial.
//!
//! Grounded on `mobile_action_get`/`mobile_action_process`/`mobile_loop` in
//! `mobile.c`. A host is expected to call [`tick`] (via
//! [`crate::Adapter::tick`]) on a regular cadence, independent of
//! [`crate::Adapter::transfer`].

use log::{trace, warn};

use crate::callbacks::{Callbacks, Timer};
use crate::commands::CommandProcessor;
use crate::serial::SerialFramer;

/// Idle-reset period: if nothing has come over serial in this long and no
/// session is open, resync by resetting the framer. `MOBILE_SERIAL_TIMEOUT`.
const SERIAL_IDLE_RESET_MS: u32 = 500;
/// Per-byte session timeout: if a session is open but stalls this long,
/// the link partner is assumed gone. Verified against real hardware.
const SERIAL_SESSION_TIMEOUT_MS: u32 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    ProcessCommand,
    Change32BitMode,
    DropConnection,
    Reset,
    ResetSerial,
}

/// Decides the next maintenance action without performing it. Grounded on
/// `mobile_action_get`.
pub fn action_get<C: Callbacks>(cb: &mut C, serial: &SerialFramer, commands: &CommandProcessor) -> Action {
    if commands.session_begun() && cb.time_check_ms(Timer::Serial, SERIAL_SESSION_TIMEOUT_MS) {
        return Action::DropConnection;
    }

    if serial.active() && !commands.session_begun() && cb.time_check_ms(Timer::Serial, SERIAL_SESSION_TIMEOUT_MS) {
        return Action::Reset;
    }

    if serial.awaiting_response() {
        return Action::ProcessCommand;
    }

    if serial.is_waiting() && commands.mode_32bit != serial.mode_32bit {
        return Action::Change32BitMode;
    }

    if !serial.active() && !commands.session_begun() && cb.time_check_ms(Timer::Serial, SERIAL_IDLE_RESET_MS) {
        return Action::ResetSerial;
    }

    Action::None
}

/// Applies `action`, mutating `serial`/`commands` and latching timers as
/// needed. `process_command` is invoked only for [`Action::ProcessCommand`]
/// and is responsible for pulling the request out of `serial`, running it
/// through the command processor, and feeding any response back into
/// `serial` itself (mirrors `command_handle` wrapping
/// `mobile_commands_process`). Grounded on `mobile_action_process`.
pub fn action_process<C: Callbacks>(
    cb: &mut C,
    serial: &mut SerialFramer,
    commands: &mut CommandProcessor,
    action: Action,
    mut process_command: impl FnMut(&mut C, &mut SerialFramer, &mut CommandProcessor),
) {
    match action {
        Action::ProcessCommand => {
            if !serial.awaiting_response() {
                return;
            }
            process_command(cb, serial, commands);
        }

        Action::Change32BitMode => {
            cb.serial_disable();
            serial.mode_32bit = commands.mode_32bit;
            cb.serial_enable();
        }

        Action::DropConnection => {
            warn!("scheduler: session timed out, dropping connection");
            cb.serial_disable();
            serial.reset();
            *commands = CommandProcessor::new();
            serial.mode_32bit = commands.mode_32bit;
            serial.clear_active();
            cb.time_latch(Timer::Serial);
            cb.serial_enable();
        }

        Action::Reset => {
            warn!("scheduler: serial idle with no session, resetting");
            cb.serial_disable();
            commands.mode_32bit = false;
            serial.mode_32bit = false;
            serial.clear_active();
            cb.time_latch(Timer::Serial);
            cb.serial_enable();
        }

        Action::ResetSerial => {
            trace!("scheduler: periodic serial resync");
            cb.serial_disable();
            cb.time_latch(Timer::Serial);
            cb.serial_enable();
        }

        Action::None => {}
    }
}

/// One full maintenance pass: decide, then apply. Grounded on `mobile_loop`.
pub fn tick<C: Callbacks>(
    cb: &mut C,
    serial: &mut SerialFramer,
    commands: &mut CommandProcessor,
    process_command: impl FnMut(&mut C, &mut SerialFramer, &mut CommandProcessor),
) {
    let action = action_get(cb, serial, commands);
    action_process(cb, serial, commands, action, process_command);
}
