//! Portal API client for the FuelFlux controller.
//!
//! The [`Backend`] trait is the capability the rest of the system depends
//! on; [`HttpBackend`] implements it over blocking HTTP, and
//! [`StubBackend`] is the scripted double used by tests and the console
//! demo.
//!
//! Failures are classified into two families the callers care about:
//! **network** errors (transport failures and the synthetic `-1` error
//! object) preserve the ability to retry or fall back to the local cache,
//! while **application** errors are terminal for the attempt.

mod error;
mod http;
mod session;
mod stub;

pub use error::{BackendError, BackendResult, COMMUNICATION_ERROR_TEXT, NETWORK_ERROR_CODE};
pub use http::HttpBackend;
pub use stub::{RecordedCall, StubAuth, StubBackend};

use fuelflux_core::{IntakeDirection, TankNumber, UserRole, Volume};

/// A tank the portal authorized for the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTankInfo {
    pub id_tank: TankNumber,
    pub name_tank: String,
}

/// One cardholder record from the portal's card list.
#[derive(Debug, Clone, PartialEq)]
pub struct UserCard {
    pub uid: String,
    pub role_id: i64,
    pub allowance: f64,
}

/// Capability contract for talking to the portal.
///
/// Implementations keep the session (bearer token, role, allowance,
/// tanks) behind a mutex; getters return copies.
pub trait Backend: Send + Sync {
    /// UID of this pump controller.
    fn controller_uid(&self) -> String;

    /// Open a session for the given card/PIN UID.
    ///
    /// Rejected when already authorized. On success the token, role,
    /// allowance, price, and tank list are recorded atomically; on
    /// failure nothing changes except `last_error`.
    fn authorize(&self, uid: &str) -> BackendResult<()>;

    /// Close the session.
    ///
    /// Local state is cleared unconditionally and immediately; the
    /// portal request is fire-and-forget.
    fn deauthorize(&self);

    /// Report a refuel. Customer sessions only.
    fn refuel(&self, tank: TankNumber, volume: Volume) -> BackendResult<()>;

    /// Report a fuel intake. Operator sessions only.
    fn intake(
        &self,
        tank: TankNumber,
        volume: Volume,
        direction: IntakeDirection,
    ) -> BackendResult<()>;

    /// Replay a previously serialized refuel payload (backlog resend).
    fn refuel_payload(&self, payload: &str) -> BackendResult<()>;

    /// Replay a previously serialized intake payload (backlog resend).
    fn intake_payload(&self, payload: &str) -> BackendResult<()>;

    /// Fetch a page of cardholder records. Controller sessions only.
    fn fetch_cards(&self, first: u32, number: u32) -> BackendResult<Vec<UserCard>>;

    fn is_authorized(&self) -> bool;
    fn token(&self) -> Option<String>;
    fn role(&self) -> UserRole;
    fn allowance(&self) -> Volume;
    fn price(&self) -> f64;
    fn fuel_tanks(&self) -> Vec<BackendTankInfo>;

    /// Operator-facing text of the last failure, empty when none.
    fn last_error(&self) -> String;

    /// Whether the last failure was a network error.
    fn is_network_error(&self) -> bool;
}
