//! The heart of the FuelFlux device: the transaction state machine, the
//! serialized event queue, and the controller that binds peripherals,
//! portal, cache, and store together.
//!
//! Concurrency model: plain OS threads around one queue. Peripheral
//! drivers, timers, and watchdogs only ever *post* events; a single
//! event-loop thread pops them and runs every state transition, so all
//! session state is totally ordered.

mod controller;
mod display;
mod events;
mod machine;

pub use controller::{Controller, ControllerConfig};
pub use display::{display_message, format_volume, DisplayContext};
pub use events::EventQueue;
pub use machine::{transition, Action, StateMachine, INACTIVITY_TIMEOUT};
