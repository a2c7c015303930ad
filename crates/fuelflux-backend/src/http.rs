//! Blocking HTTP implementation of the [`Backend`] capability.

use crate::error::{BackendError, BackendResult};
use crate::session::SessionState;
use crate::{Backend, BackendTankInfo, UserCard};
use fuelflux_core::{
    now_unix_ms, IntakeDirection, MessageMethod, TankNumber, UserRole, Volume,
};
use fuelflux_executor::BoundedExecutor;
use fuelflux_store::MessageStore;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Portal client over blocking HTTP.
///
/// One instance holds one session. The controller uses a dedicated
/// instance for user sessions; the cache manager owns another so the
/// synchronization token never collides with a user token.
pub struct HttpBackend {
    base_url: String,
    controller_uid: String,
    http: reqwest::blocking::Client,
    state: Mutex<SessionState>,
    storage: Option<Arc<MessageStore>>,
    executor: Option<Arc<BoundedExecutor>>,
}

impl HttpBackend {
    /// Create a client for the given portal base URL.
    ///
    /// * `storage` - when present, failed refuel/intake reports are
    ///   recorded there (backlog on network error, dead otherwise).
    /// * `executor` - when present, async deauthorize requests are
    ///   submitted to it; otherwise each spawns a short-lived thread.
    pub fn new(
        base_url: &str,
        controller_uid: &str,
        storage: Option<Arc<MessageStore>>,
        executor: Option<Arc<BoundedExecutor>>,
    ) -> BackendResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| BackendError::Precondition(format!("invalid base URL: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(BackendError::Precondition(format!(
                "unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }

        let http = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Precondition(format!("HTTP client: {e}")))?;

        info!(base_url, controller_uid, "Backend initialized");

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            controller_uid: controller_uid.to_string(),
            http,
            state: Mutex::new(SessionState::default()),
            storage,
            executor,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("lock poisoned")
    }

    fn request(&self, endpoint: &str, body: &Value, bearer: Option<&str>) -> BackendResult<Value> {
        send_request(&self.http, &self.base_url, endpoint, body, bearer)
    }

    /// Persist a failed reportable transaction: backlog when the failure
    /// was a network error, dead queue when the portal rejected it.
    fn record_failed_report(
        &self,
        uid: &str,
        method: MessageMethod,
        body: &Value,
        err: &BackendError,
    ) {
        let Some(storage) = &self.storage else {
            return;
        };
        if uid.is_empty() {
            return;
        }
        let data = body.to_string();
        let result = if err.is_network() {
            storage.add_backlog(uid, method, &data)
        } else {
            storage.add_dead(uid, method, &data)
        };
        if let Err(store_err) = result {
            error!(uid, error = %store_err, "Failed to persist offline report");
        }
    }

    fn replay_payload(&self, payload: &str, endpoint: &str) -> BackendResult<()> {
        let token = {
            let mut state = self.lock();
            if !state.is_authorized() {
                let err = BackendError::Precondition("not authorized".to_string());
                state.last_error = Some(err.clone());
                return Err(err);
            }
            state.token.clone().unwrap_or_default()
        };

        let body: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                let err = BackendError::Precondition(format!("invalid payload: {e}"));
                self.lock().last_error = Some(err.clone());
                return Err(err);
            }
        };

        match self.request(endpoint, &body, Some(&token)) {
            Ok(_) => {
                self.lock().last_error = None;
                Ok(())
            }
            Err(err) => {
                warn!(endpoint, error = %err, "Failed to replay stored report");
                self.lock().last_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl Backend for HttpBackend {
    fn controller_uid(&self) -> String {
        self.controller_uid.clone()
    }

    fn authorize(&self, uid: &str) -> BackendResult<()> {
        {
            let mut state = self.lock();
            if state.is_authorized() {
                warn!("Already authorized; deauthorize first");
                let err = BackendError::Precondition("already authorized".to_string());
                state.last_error = Some(err.clone());
                return Err(err);
            }
        }

        info!(uid, "Authorizing card");
        let body = json!({
            "CardUid": uid,
            "PumpControllerUid": self.controller_uid,
        });
        let result = self
            .request("/api/pump/authorize", &body, None)
            .and_then(|value| parse_authorize(&value));

        let mut state = self.lock();
        match result {
            Ok(auth) => {
                state.token = Some(auth.token);
                state.authorized_uid = Some(uid.to_string());
                state.role_id = auth.role_id;
                state.allowance = auth.allowance;
                state.price = auth.price;
                state.tanks = auth.tanks;
                state.last_error = None;
                info!(
                    role_id = state.role_id,
                    allowance = state.allowance,
                    price = state.price,
                    tanks = state.tanks.len(),
                    "Authorization successful"
                );
                Ok(())
            }
            Err(err) => {
                warn!(uid, error = %err, "Authorization failed");
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn deauthorize(&self) {
        let token = {
            let mut state = self.lock();
            if !state.is_authorized() {
                debug!("Deauthorize with no active session");
                return;
            }
            let token = state.token.clone();
            state.clear();
            token
        };
        let Some(token) = token else { return };

        info!("Deauthorizing (async)");
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let job = move || {
            match send_request(
                &http,
                &base_url,
                "/api/pump/deauthorize",
                &json!({}),
                Some(&token),
            ) {
                Ok(_) => info!("Async deauthorization successful"),
                Err(err) => {
                    warn!(error = %err, "Async deauthorization failed (local state already cleared)")
                }
            }
        };

        // The portal ages sessions out on its own, so a dropped request
        // costs nothing.
        match &self.executor {
            Some(executor) => {
                if !executor.submit(job) {
                    warn!("Deauthorize request dropped: executor unavailable");
                }
            }
            None => {
                std::thread::spawn(job);
            }
        }
    }

    fn refuel(&self, tank: TankNumber, volume: Volume) -> BackendResult<()> {
        let (token, uid) = {
            let mut state = self.lock();
            if let Err(err) = report_preconditions(&state, UserRole::Customer, tank) {
                state.last_error = Some(err.clone());
                return Err(err);
            }
            if volume < 0.0 {
                let err =
                    BackendError::Precondition(format!("volume {volume} must be non-negative"));
                state.last_error = Some(err.clone());
                return Err(err);
            }
            if volume > state.allowance {
                let err = BackendError::Precondition(format!(
                    "volume {volume} exceeds allowance {}",
                    state.allowance
                ));
                state.last_error = Some(err.clone());
                return Err(err);
            }
            (
                state.token.clone().unwrap_or_default(),
                state.authorized_uid.clone().unwrap_or_default(),
            )
        };

        let body = json!({
            "TankNumber": tank,
            "FuelVolume": volume,
            "TimeAt": now_unix_ms(),
        });
        info!(tank, volume, "Refueling report");

        match self.request("/api/pump/refuel", &body, Some(&token)) {
            Ok(_) => {
                let mut state = self.lock();
                state.allowance = (state.allowance - volume).max(0.0);
                state.last_error = None;
                info!("Refueling report accepted");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Failed to send refueling report");
                self.record_failed_report(&uid, MessageMethod::Refuel, &body, &err);
                self.lock().last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn intake(
        &self,
        tank: TankNumber,
        volume: Volume,
        direction: IntakeDirection,
    ) -> BackendResult<()> {
        let (token, uid) = {
            let mut state = self.lock();
            if let Err(err) = report_preconditions(&state, UserRole::Operator, tank) {
                state.last_error = Some(err.clone());
                return Err(err);
            }
            if volume < 0.0 {
                let err =
                    BackendError::Precondition(format!("volume {volume} must be non-negative"));
                state.last_error = Some(err.clone());
                return Err(err);
            }
            (
                state.token.clone().unwrap_or_default(),
                state.authorized_uid.clone().unwrap_or_default(),
            )
        };

        let body = json!({
            "TankNumber": tank,
            "IntakeVolume": volume,
            "Direction": direction.wire_value(),
            "TimeAt": now_unix_ms(),
        });
        info!(tank, volume, direction = direction.wire_value(), "Fuel intake report");

        match self.request("/api/pump/fuel-intake", &body, Some(&token)) {
            Ok(_) => {
                self.lock().last_error = None;
                info!("Fuel intake report accepted");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Failed to send fuel intake report");
                self.record_failed_report(&uid, MessageMethod::Intake, &body, &err);
                self.lock().last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn refuel_payload(&self, payload: &str) -> BackendResult<()> {
        self.replay_payload(payload, "/api/pump/refuel")
    }

    fn intake_payload(&self, payload: &str) -> BackendResult<()> {
        self.replay_payload(payload, "/api/pump/fuel-intake")
    }

    fn fetch_cards(&self, first: u32, number: u32) -> BackendResult<Vec<UserCard>> {
        let token = {
            let mut state = self.lock();
            if !state.is_authorized() {
                let err = BackendError::Precondition("not authorized".to_string());
                state.last_error = Some(err.clone());
                return Err(err);
            }
            state.token.clone().unwrap_or_default()
        };

        let endpoint = format!("/api/pump/cards?first={first}&number={number}");
        let body = json!({ "PumpControllerUid": self.controller_uid });
        debug!(first, number, "Fetching user cards");

        let result = self
            .request(&endpoint, &body, Some(&token))
            .and_then(|value| parse_cards(&value));

        match result {
            Ok(cards) => {
                self.lock().last_error = None;
                debug!(count = cards.len(), "Fetched user cards");
                Ok(cards)
            }
            Err(err) => {
                warn!(error = %err, "Failed to fetch user cards");
                self.lock().last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn is_authorized(&self) -> bool {
        self.lock().is_authorized()
    }

    fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    fn role(&self) -> UserRole {
        UserRole::from_id(self.lock().role_id)
    }

    fn allowance(&self) -> Volume {
        self.lock().allowance
    }

    fn price(&self) -> f64 {
        self.lock().price
    }

    fn fuel_tanks(&self) -> Vec<BackendTankInfo> {
        self.lock().tanks.clone()
    }

    fn last_error(&self) -> String {
        self.lock()
            .last_error
            .as_ref()
            .map(BackendError::display_text)
            .unwrap_or_default()
    }

    fn is_network_error(&self) -> bool {
        self.lock()
            .last_error
            .as_ref()
            .map(BackendError::is_network)
            .unwrap_or(false)
    }
}

/// POST a JSON body and classify the outcome.
///
/// Transport failures, non-2xx statuses, and unparseable bodies all come
/// back as [`BackendError::Network`]; a parsed object with
/// `CodeError != 0` comes back as [`BackendError::Application`].
fn send_request(
    http: &reqwest::blocking::Client,
    base_url: &str,
    endpoint: &str,
    body: &Value,
    bearer: Option<&str>,
) -> BackendResult<Value> {
    let url = format!("{base_url}{endpoint}");
    debug!(%url, "Portal request");

    let mut builder = http.post(&url).json(body);
    if let Some(token) = bearer {
        builder = builder.bearer_auth(token);
    }

    let response = builder
        .send()
        .map_err(|e| BackendError::Network(e.to_string()))?;
    let status = response.status();
    let text = response
        .text()
        .map_err(|e| BackendError::Network(e.to_string()))?;

    if !status.is_success() {
        warn!(%status, "Portal returned HTTP error");
        return Err(BackendError::Network(format!("HTTP status {status}")));
    }

    let value = if text.is_empty() || text == "null" {
        Value::Null
    } else {
        serde_json::from_str(&text)
            .map_err(|e| BackendError::Network(format!("unparseable response: {e}")))?
    };

    if let Some(err) = classify_error(&value) {
        return Err(err);
    }
    Ok(value)
}

/// Detect the portal's error-object convention: `CodeError != 0`.
pub(crate) fn classify_error(value: &Value) -> Option<BackendError> {
    let code = value.get("CodeError")?.as_i64()?;
    if code == 0 {
        return None;
    }
    let text = value
        .get("TextError")
        .and_then(Value::as_str)
        .unwrap_or("Неизвестная ошибка")
        .to_string();
    Some(BackendError::Application { code, text })
}

pub(crate) struct AuthData {
    pub token: String,
    pub role_id: i64,
    pub allowance: f64,
    pub price: f64,
    pub tanks: Vec<BackendTankInfo>,
}

/// Validate and extract an authorize response.
///
/// `Token` and `RoleId` are required; `Allowance`, `Price`, and
/// `fuelTanks` may be absent or null.
pub(crate) fn parse_authorize(value: &Value) -> BackendResult<AuthData> {
    if !value.is_object() {
        return Err(BackendError::InvalidResponse(
            "authorize response is not an object".to_string(),
        ));
    }

    let token = value
        .get("Token")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::InvalidResponse("missing or invalid Token".to_string()))?
        .to_string();

    let role_id = value
        .get("RoleId")
        .and_then(Value::as_i64)
        .ok_or_else(|| BackendError::InvalidResponse("missing or invalid RoleId".to_string()))?;

    let allowance = value.get("Allowance").and_then(Value::as_f64).unwrap_or(0.0);
    let price = value.get("Price").and_then(Value::as_f64).unwrap_or(0.0);

    let tanks = value
        .get("fuelTanks")
        .and_then(Value::as_array)
        .map(|array| {
            array
                .iter()
                .map(|tank| BackendTankInfo {
                    id_tank: tank.get("idTank").and_then(Value::as_i64).unwrap_or(0) as i32,
                    name_tank: tank
                        .get("nameTank")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(AuthData {
        token,
        role_id,
        allowance,
        price,
        tanks,
    })
}

/// Validate and extract a cards-page response.
///
/// The body must be a JSON array; elements whose `Uid` is not a string
/// are skipped.
pub(crate) fn parse_cards(value: &Value) -> BackendResult<Vec<UserCard>> {
    let array = value.as_array().ok_or_else(|| {
        BackendError::InvalidResponse("cards response is not an array".to_string())
    })?;

    let cards = array
        .iter()
        .filter_map(|card| {
            let uid = card.get("Uid").and_then(Value::as_str)?;
            Some(UserCard {
                uid: uid.to_string(),
                role_id: card.get("RoleId").and_then(Value::as_i64).unwrap_or(0),
                allowance: card.get("Allowance").and_then(Value::as_f64).unwrap_or(0.0),
            })
        })
        .collect();

    Ok(cards)
}

/// Session-level checks shared by refuel and intake reports.
fn report_preconditions(
    state: &SessionState,
    required_role: UserRole,
    tank: TankNumber,
) -> BackendResult<()> {
    if !state.is_authorized() {
        return Err(BackendError::Precondition("not authorized".to_string()));
    }
    if UserRole::from_id(state.role_id) != required_role {
        return Err(BackendError::Precondition(format!(
            "role {} is not allowed",
            state.role_id
        )));
    }
    if !state.tanks.iter().any(|t| t.id_tank == tank) {
        return Err(BackendError::Precondition(format!(
            "tank {tank} not in authorized tanks"
        )));
    }
    Ok(())
}
