//! Capability traits the controller drives peripherals through.
//!
//! Drivers invoke the registered callbacks from their own threads; the
//! callbacks translate raw events and hand them to the controller, which
//! serializes everything through its event queue.

use crate::PeripheralResult;
use fuelflux_core::{DisplayMessage, KeyCode, UserId, Volume};

pub type KeyCallback = Box<dyn Fn(KeyCode) + Send>;
pub type CardCallback = Box<dyn Fn(&UserId) + Send>;
pub type PumpStateCallback = Box<dyn Fn(bool) + Send>;
pub type FlowCallback = Box<dyn Fn(Volume) + Send>;

/// Base contract shared by every peripheral.
pub trait Peripheral: Send {
    fn initialize(&mut self) -> PeripheralResult<()>;
    fn shutdown(&mut self);
    fn is_connected(&self) -> bool;
}

/// Four-line text display.
///
/// `shutdown` followed by `initialize` must restore a working display;
/// the controller relies on that to recover from display faults.
pub trait Display: Peripheral {
    fn show(&mut self, message: &DisplayMessage);
    fn clear(&mut self);
    fn set_backlight(&mut self, enabled: bool);
}

/// Keypad.
pub trait Keyboard: Peripheral {
    fn set_key_callback(&mut self, callback: KeyCallback);
    fn enable_input(&mut self, enabled: bool);
}

/// NFC card reader.
///
/// Reading is gated by the controller: enabled only while the device is
/// waiting for a card, so an active transaction or PIN entry is never
/// interrupted by a stray read.
pub trait CardReader: Peripheral {
    fn set_card_callback(&mut self, callback: CardCallback);
    fn enable_reading(&mut self, enabled: bool);
}

/// Pump relay.
///
/// `start`/`stop` are idempotent; the state callback fires only on an
/// actual change. Shutdown must leave the relay off.
pub trait Pump: Peripheral {
    fn start(&mut self);
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn set_state_callback(&mut self, callback: PumpStateCallback);
}

/// Pulse-counting flow meter.
///
/// `current_volume` resets to zero on `reset_counter`; `total_volume`
/// accumulates across measurements and resets only with the counter.
pub trait FlowMeter: Peripheral {
    fn start_measurement(&mut self);
    fn stop_measurement(&mut self);
    fn reset_counter(&mut self);
    fn current_volume(&self) -> Volume;
    fn total_volume(&self) -> Volume;
    fn set_flow_callback(&mut self, callback: FlowCallback);
}
