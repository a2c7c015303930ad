//! Session state shared by backend implementations.

use crate::{BackendError, BackendTankInfo};
use fuelflux_core::Volume;

/// Mutable session state behind the backend's mutex.
///
/// Reads hand out copies; nothing borrows into the lock.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub token: Option<String>,
    pub authorized_uid: Option<String>,
    pub role_id: i64,
    pub allowance: Volume,
    pub price: f64,
    pub tanks: Vec<BackendTankInfo>,
    pub last_error: Option<BackendError>,
}

impl SessionState {
    pub fn is_authorized(&self) -> bool {
        self.token.is_some()
    }

    /// Forget the session. `last_error` is cleared too: a deliberate
    /// deauthorize is not a failure.
    pub fn clear(&mut self) {
        self.token = None;
        self.authorized_uid = None;
        self.role_id = 0;
        self.allowance = 0.0;
        self.price = 0.0;
        self.tanks.clear();
        self.last_error = None;
    }

}
