//! Shared foundation for the FuelFlux pump controller.
//!
//! This crate holds the domain vocabulary every other crate speaks
//! (states, events, roles, transactions), the device configuration, and
//! the logging bootstrap. It has no knowledge of peripherals, storage, or
//! the portal protocol.

mod config;
mod error;
mod logging;
mod types;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use types::{
    DisplayMessage, Event, IntakeDirection, IntakeTransaction, KeyCode, MessageMethod, Price,
    RefuelTransaction, SystemState, TankInfo, TankNumber, UserCacheEntry, UserId, UserInfo,
    UserRole, Volume, STD_BACKEND_ERROR, STD_CONTROLLER_ERROR,
};

/// Current wall-clock time as UNIX milliseconds.
///
/// All transaction timestamps on the wire use this representation.
pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
