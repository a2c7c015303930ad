//! Peripheral capability contracts.
//!
//! The controller depends only on the traits here; real drivers (SPI
//! displays, GPIO pumps, NFC readers) live behind them and are out of
//! scope for this crate. The `sim` module provides in-memory
//! implementations that honor the same contracts, used by tests and the
//! console demo.

pub mod sim;

mod error;
mod traits;

pub use error::{PeripheralError, PeripheralResult};
pub use traits::{
    CardCallback, CardReader, Display, FlowCallback, FlowMeter, KeyCallback, Keyboard, Peripheral,
    Pump, PumpStateCallback,
};
