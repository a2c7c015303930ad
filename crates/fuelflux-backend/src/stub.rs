//! Scripted backend double for tests and the console demo.

use crate::error::{BackendError, BackendResult};
use crate::session::SessionState;
use crate::{Backend, BackendTankInfo, UserCard};
use fuelflux_core::{IntakeDirection, TankNumber, UserRole, Volume};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Session data a scripted authorize hands out.
#[derive(Debug, Clone)]
pub struct StubAuth {
    pub role_id: i64,
    pub allowance: f64,
    pub price: f64,
    pub tanks: Vec<BackendTankInfo>,
}

impl Default for StubAuth {
    fn default() -> Self {
        Self {
            role_id: 1,
            allowance: 0.0,
            price: 0.0,
            tanks: Vec::new(),
        }
    }
}

/// Every portal call the stub has seen, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Authorize(String),
    Deauthorize,
    Refuel {
        tank: TankNumber,
        volume: Volume,
    },
    Intake {
        tank: TankNumber,
        volume: Volume,
        direction: IntakeDirection,
    },
    RefuelPayload(String),
    IntakePayload(String),
    FetchCards {
        first: u32,
        number: u32,
    },
}

struct Script {
    authorize: VecDeque<Result<StubAuth, BackendError>>,
    default_authorize: Result<StubAuth, BackendError>,
    refuel: VecDeque<BackendResult<()>>,
    default_refuel: BackendResult<()>,
    intake: VecDeque<BackendResult<()>>,
    default_intake: BackendResult<()>,
    refuel_payload: VecDeque<BackendResult<()>>,
    default_refuel_payload: BackendResult<()>,
    intake_payload: VecDeque<BackendResult<()>>,
    default_intake_payload: BackendResult<()>,
    fetch_cards: VecDeque<BackendResult<Vec<UserCard>>>,
    default_fetch_cards: BackendResult<Vec<UserCard>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            authorize: VecDeque::new(),
            default_authorize: Ok(StubAuth::default()),
            refuel: VecDeque::new(),
            default_refuel: Ok(()),
            intake: VecDeque::new(),
            default_intake: Ok(()),
            refuel_payload: VecDeque::new(),
            default_refuel_payload: Ok(()),
            intake_payload: VecDeque::new(),
            default_intake_payload: Ok(()),
            fetch_cards: VecDeque::new(),
            default_fetch_cards: Ok(Vec::new()),
        }
    }
}

/// Scripted, recording implementation of [`Backend`].
///
/// Outcomes are consumed from per-operation queues; when a queue is
/// empty the configured default applies. Every call is recorded for
/// later assertions.
pub struct StubBackend {
    controller_uid: String,
    state: Mutex<SessionState>,
    script: Mutex<Script>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubBackend {
    pub fn new(controller_uid: &str) -> Self {
        Self {
            controller_uid: controller_uid.to_string(),
            state: Mutex::new(SessionState::default()),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("lock poisoned")
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().expect("lock poisoned").push(call);
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock poisoned").clear();
    }

    // Script configuration -------------------------------------------------

    pub fn enqueue_authorize(&self, outcome: Result<StubAuth, BackendError>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .authorize
            .push_back(outcome);
    }

    pub fn set_default_authorize(&self, outcome: Result<StubAuth, BackendError>) {
        self.script.lock().expect("lock poisoned").default_authorize = outcome;
    }

    pub fn enqueue_refuel(&self, outcome: BackendResult<()>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .refuel
            .push_back(outcome);
    }

    pub fn set_default_refuel(&self, outcome: BackendResult<()>) {
        self.script.lock().expect("lock poisoned").default_refuel = outcome;
    }

    pub fn enqueue_intake(&self, outcome: BackendResult<()>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .intake
            .push_back(outcome);
    }

    pub fn enqueue_refuel_payload(&self, outcome: BackendResult<()>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .refuel_payload
            .push_back(outcome);
    }

    pub fn set_default_refuel_payload(&self, outcome: BackendResult<()>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .default_refuel_payload = outcome;
    }

    pub fn enqueue_intake_payload(&self, outcome: BackendResult<()>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .intake_payload
            .push_back(outcome);
    }

    pub fn set_default_intake_payload(&self, outcome: BackendResult<()>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .default_intake_payload = outcome;
    }

    pub fn enqueue_fetch_cards(&self, outcome: BackendResult<Vec<UserCard>>) {
        self.script
            .lock()
            .expect("lock poisoned")
            .fetch_cards
            .push_back(outcome);
    }

    pub fn set_default_fetch_cards(&self, outcome: BackendResult<Vec<UserCard>>) {
        self.script.lock().expect("lock poisoned").default_fetch_cards = outcome;
    }
}

impl Backend for StubBackend {
    fn controller_uid(&self) -> String {
        self.controller_uid.clone()
    }

    fn authorize(&self, uid: &str) -> BackendResult<()> {
        self.record(RecordedCall::Authorize(uid.to_string()));
        {
            let state = self.lock();
            if state.is_authorized() {
                return Err(BackendError::Precondition("already authorized".to_string()));
            }
        }

        let outcome = {
            let mut script = self.script.lock().expect("lock poisoned");
            script
                .authorize
                .pop_front()
                .unwrap_or_else(|| script.default_authorize.clone())
        };

        let mut state = self.lock();
        match outcome {
            Ok(auth) => {
                state.token = Some(format!("stub-token-{uid}"));
                state.authorized_uid = Some(uid.to_string());
                state.role_id = auth.role_id;
                state.allowance = auth.allowance;
                state.price = auth.price;
                state.tanks = auth.tanks;
                state.last_error = None;
                Ok(())
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn deauthorize(&self) {
        self.record(RecordedCall::Deauthorize);
        self.lock().clear();
    }

    fn refuel(&self, tank: TankNumber, volume: Volume) -> BackendResult<()> {
        self.record(RecordedCall::Refuel { tank, volume });
        let outcome = {
            let mut script = self.script.lock().expect("lock poisoned");
            script
                .refuel
                .pop_front()
                .unwrap_or_else(|| script.default_refuel.clone())
        };
        let mut state = self.lock();
        match outcome {
            Ok(()) => {
                state.allowance = (state.allowance - volume).max(0.0);
                state.last_error = None;
                Ok(())
            }
            Err(err) => {
                state.last_error = Some(err.clone());
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
        self.record(RecordedCall::Intake {
            tank,
            volume,
            direction,
        });
        let outcome = {
            let mut script = self.script.lock().expect("lock poisoned");
            script
                .intake
                .pop_front()
                .unwrap_or_else(|| script.default_intake.clone())
        };
        let mut state = self.lock();
        match outcome {
            Ok(()) => {
                state.last_error = None;
                Ok(())
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn refuel_payload(&self, payload: &str) -> BackendResult<()> {
        self.record(RecordedCall::RefuelPayload(payload.to_string()));
        let outcome = {
            let mut script = self.script.lock().expect("lock poisoned");
            script
                .refuel_payload
                .pop_front()
                .unwrap_or_else(|| script.default_refuel_payload.clone())
        };
        if let Err(err) = &outcome {
            self.lock().last_error = Some(err.clone());
        }
        outcome
    }

    fn intake_payload(&self, payload: &str) -> BackendResult<()> {
        self.record(RecordedCall::IntakePayload(payload.to_string()));
        let outcome = {
            let mut script = self.script.lock().expect("lock poisoned");
            script
                .intake_payload
                .pop_front()
                .unwrap_or_else(|| script.default_intake_payload.clone())
        };
        if let Err(err) = &outcome {
            self.lock().last_error = Some(err.clone());
        }
        outcome
    }

    fn fetch_cards(&self, first: u32, number: u32) -> BackendResult<Vec<UserCard>> {
        self.record(RecordedCall::FetchCards { first, number });
        let outcome = {
            let mut script = self.script.lock().expect("lock poisoned");
            script
                .fetch_cards
                .pop_front()
                .unwrap_or_else(|| script.default_fetch_cards.clone())
        };
        if let Err(err) = &outcome {
            self.lock().last_error = Some(err.clone());
        }
        outcome
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
