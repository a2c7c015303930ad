//! The transaction Mealy machine.
//!
//! [`transition`] is a pure, total function from (state, event) to
//! (next state, action intent); the [`StateMachine`] owns the current
//! state, the inactivity clock, and the one-shot override slot the
//! error-recovery action uses to choose its outcome at runtime.
//!
//! The machine never performs side effects itself: actions are intents
//! the controller executes between the table lookup and the state
//! update, with no machine lock held.

use crate::events::EventQueue;
use fuelflux_core::{Event, SystemState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Inactivity budget before an idle session is torn down.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Side-effect intent attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do (self-loops and pure state moves).
    None,
    /// Clear the numeric input buffer.
    ClearInput,
    /// Start the pump, then clear the input buffer.
    StartRefueling,
    /// Stop the pump; the dispensed volume still gets reported.
    CancelRefueling,
    /// Tear down the current session.
    EndSession,
    /// Attempt device recovery; on success the action overrides the
    /// target state back to `Waiting`.
    RecoverFromError,
}

/// The transition table.
///
/// Total by construction: any pair not named below self-loops with no
/// action.
pub fn transition(state: SystemState, event: Event) -> (SystemState, Action) {
    use Event as E;
    use SystemState::*;

    match (state, event) {
        // A peripheral fault interrupts anything.
        (_, E::Error) => (Error, Action::None),

        (Waiting, E::CardPresented) => (Authorization, Action::None),
        (Waiting, E::PinEntryStarted) => (PinEntry, Action::None),
        (Waiting, E::PinEntered) => (Authorization, Action::None),

        (PinEntry, E::CardPresented) => (Authorization, Action::None),
        (PinEntry, E::PinEntered) => (Authorization, Action::None),
        (PinEntry, E::CancelPressed) => (Waiting, Action::EndSession),
        (PinEntry, E::Timeout) => (Waiting, Action::EndSession),

        // Authorization blocks on the portal; cancel and timeout are
        // ignored until it resolves.
        (Authorization, E::AuthorizationSuccess) => (TankSelection, Action::None),
        (Authorization, E::AuthorizationFailed) => (NotAuthorized, Action::None),

        (NotAuthorized, E::CancelPressed) => (Waiting, Action::EndSession),
        (NotAuthorized, E::Timeout) => (Waiting, Action::EndSession),

        (TankSelection, E::TankSelected) => (VolumeEntry, Action::ClearInput),
        (TankSelection, E::IntakeSelected) => (IntakeDirectionSelection, Action::ClearInput),
        (TankSelection, E::CancelPressed) => (Waiting, Action::EndSession),
        (TankSelection, E::Timeout) => (Waiting, Action::EndSession),

        (VolumeEntry, E::VolumeEntered) => (Refueling, Action::StartRefueling),
        (VolumeEntry, E::CancelPressed) => (Waiting, Action::EndSession),
        (VolumeEntry, E::Timeout) => (Waiting, Action::EndSession),

        // A cancel mid-pump still routes through data transmission so
        // whatever was dispensed gets reported.
        (Refueling, E::RefuelingStopped) => (RefuelDataTransmission, Action::None),
        (Refueling, E::CancelPressed) => (RefuelDataTransmission, Action::CancelRefueling),
        (Refueling, E::CancelNoFuel) => (RefuelDataTransmission, Action::CancelRefueling),

        (RefuelDataTransmission, E::DataTransmissionComplete) => {
            (RefuelingComplete, Action::None)
        }

        (RefuelingComplete, E::CardPresented) => (Authorization, Action::None),
        (RefuelingComplete, E::PinEntryStarted) => (PinEntry, Action::None),
        (RefuelingComplete, E::PinEntered) => (Authorization, Action::None),
        (RefuelingComplete, E::CancelPressed) => (Waiting, Action::EndSession),
        (RefuelingComplete, E::Timeout) => (Waiting, Action::EndSession),

        (IntakeDirectionSelection, E::IntakeDirectionSelected) => {
            (IntakeVolumeEntry, Action::ClearInput)
        }
        (IntakeDirectionSelection, E::CancelPressed) => (Waiting, Action::EndSession),
        (IntakeDirectionSelection, E::Timeout) => (Waiting, Action::EndSession),

        (IntakeVolumeEntry, E::IntakeVolumeEntered) => {
            (IntakeDataTransmission, Action::ClearInput)
        }
        (IntakeVolumeEntry, E::CancelPressed) => (Waiting, Action::EndSession),
        (IntakeVolumeEntry, E::Timeout) => (Waiting, Action::EndSession),

        (IntakeDataTransmission, E::DataTransmissionComplete) => (IntakeComplete, Action::None),

        (IntakeComplete, E::CancelPressed) => (Waiting, Action::EndSession),
        (IntakeComplete, E::Timeout) => (Waiting, Action::EndSession),

        (Error, E::CancelPressed) => (Error, Action::RecoverFromError),
        (Error, E::ErrorRecovery) => (Error, Action::RecoverFromError),

        // Ignore in place.
        (state, _) => (state, Action::None),
    }
}

/// States where the inactivity timer must stay silent: the device is
/// either idle already or in the middle of a blocking portal call or an
/// active pump run.
pub(crate) fn timeout_enabled(state: SystemState) -> bool {
    !matches!(
        state,
        SystemState::Waiting
            | SystemState::Authorization
            | SystemState::Refueling
            | SystemState::RefuelDataTransmission
            | SystemState::IntakeDataTransmission
    )
}

struct MachineInner {
    current: SystemState,
    previous: SystemState,
    last_activity: Instant,
    override_target: Option<SystemState>,
}

/// Holder of the machine's mutable state.
pub struct StateMachine {
    inner: Arc<Mutex<MachineInner>>,
    timer_running: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MachineInner {
                current: SystemState::Waiting,
                previous: SystemState::Waiting,
                last_activity: Instant::now(),
                override_target: None,
            })),
            timer_running: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner> {
        self.inner.lock().expect("lock poisoned")
    }

    pub fn current_state(&self) -> SystemState {
        self.lock().current
    }

    pub fn previous_state(&self) -> SystemState {
        self.lock().previous
    }

    pub fn is_in_state(&self, state: SystemState) -> bool {
        self.lock().current == state
    }

    /// Reset the inactivity clock. Called on every key press.
    pub fn update_activity_time(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Arm the one-shot override consumed by the transition in flight.
    ///
    /// Only the error-recovery action uses this: it decides between
    /// staying in `Error` and returning to `Waiting` based on whether
    /// reinitialization worked.
    pub fn set_override(&self, target: SystemState) {
        self.lock().override_target = Some(target);
    }

    pub(crate) fn clear_override(&self) {
        self.lock().override_target = None;
    }

    /// Commit a transition: consume any override, record the previous
    /// state, and stamp activity. Returns the final state.
    pub(crate) fn apply(&self, from: SystemState, target: SystemState) -> SystemState {
        let mut inner = self.lock();
        let to = inner.override_target.take().unwrap_or(target);
        inner.previous = from;
        inner.current = to;
        inner.last_activity = Instant::now();
        to
    }

    /// Back to `Waiting`. Returns `true` when the state actually changed.
    pub fn reset(&self) -> bool {
        let mut inner = self.lock();
        let changed = inner.current != SystemState::Waiting;
        inner.previous = inner.current;
        inner.current = SystemState::Waiting;
        inner.override_target = None;
        inner.last_activity = Instant::now();
        if changed {
            info!("State machine reset to Waiting");
        }
        changed
    }

    /// Start the inactivity-timer thread.
    ///
    /// Polls roughly once per second and posts `Timeout` to the queue
    /// when a non-blocking state has been idle past `timeout`. No-op when
    /// the thread is already running.
    pub fn start_inactivity_timer(&self, queue: Arc<EventQueue>, timeout: Duration) {
        if self.timer_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let running = Arc::clone(&self.timer_running);
        let inner = Arc::clone(&self.inner);
        let poll = if timeout < Duration::from_secs(1) {
            Duration::from_millis(20)
        } else {
            Duration::from_secs(1)
        };

        let handle = std::thread::Builder::new()
            .name("inactivity-timer".to_string())
            .spawn(move || {
                debug!("Inactivity timer started");
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(poll);
                    let (state, last_activity) = {
                        let inner = inner.lock().expect("lock poisoned");
                        (inner.current, inner.last_activity)
                    };
                    if !timeout_enabled(state) {
                        continue;
                    }
                    let idle = last_activity.elapsed();
                    if idle >= timeout {
                        info!(idle_secs = idle.as_secs(), "Inactivity timeout");
                        queue.post(Event::Timeout);
                    }
                }
                debug!("Inactivity timer stopped");
            })
            .expect("failed to spawn inactivity timer");
        *self.timer.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stop and join the inactivity-timer thread. Idempotent.
    pub fn stop_inactivity_timer(&self) {
        if !self.timer_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.timer.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        self.stop_inactivity_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_total() {
        for &state in SystemState::ALL.iter() {
            for &event in Event::ALL.iter() {
                // Every pair resolves; unlisted pairs self-loop.
                let (next, _) = transition(state, event);
                let _ = next;
            }
        }
    }

    #[test]
    fn unlisted_pairs_self_loop() {
        let (next, action) = transition(SystemState::Waiting, Event::VolumeEntered);
        assert_eq!(next, SystemState::Waiting);
        assert_eq!(action, Action::None);

        let (next, _) = transition(SystemState::Refueling, Event::Timeout);
        assert_eq!(next, SystemState::Refueling);

        let (next, _) = transition(SystemState::Authorization, Event::CancelPressed);
        assert_eq!(next, SystemState::Authorization);
    }

    #[test]
    fn happy_refuel_path() {
        use Event as E;
        use SystemState::*;

        assert_eq!(transition(Waiting, E::CardPresented).0, Authorization);
        assert_eq!(transition(Authorization, E::AuthorizationSuccess).0, TankSelection);
        assert_eq!(transition(TankSelection, E::TankSelected).0, VolumeEntry);
        assert_eq!(transition(VolumeEntry, E::VolumeEntered).0, Refueling);
        assert_eq!(
            transition(Refueling, E::RefuelingStopped).0,
            RefuelDataTransmission
        );
        assert_eq!(
            transition(RefuelDataTransmission, E::DataTransmissionComplete).0,
            RefuelingComplete
        );
    }

    #[test]
    fn intake_path() {
        use Event as E;
        use SystemState::*;

        assert_eq!(
            transition(TankSelection, E::IntakeSelected).0,
            IntakeDirectionSelection
        );
        assert_eq!(
            transition(IntakeDirectionSelection, E::IntakeDirectionSelected).0,
            IntakeVolumeEntry
        );
        assert_eq!(
            transition(IntakeVolumeEntry, E::IntakeVolumeEntered).0,
            IntakeDataTransmission
        );
        assert_eq!(
            transition(IntakeDataTransmission, E::DataTransmissionComplete).0,
            IntakeComplete
        );
    }

    #[test]
    fn failed_authorization_goes_to_not_authorized() {
        assert_eq!(
            transition(SystemState::Authorization, Event::AuthorizationFailed).0,
            SystemState::NotAuthorized
        );
        assert_eq!(
            transition(SystemState::NotAuthorized, Event::CancelPressed).0,
            SystemState::Waiting
        );
    }

    #[test]
    fn cancel_mid_refuel_still_transmits() {
        let (next, action) = transition(SystemState::Refueling, Event::CancelPressed);
        assert_eq!(next, SystemState::RefuelDataTransmission);
        assert_eq!(action, Action::CancelRefueling);

        let (next, action) = transition(SystemState::Refueling, Event::CancelNoFuel);
        assert_eq!(next, SystemState::RefuelDataTransmission);
        assert_eq!(action, Action::CancelRefueling);
    }

    #[test]
    fn any_state_reaches_error() {
        for &state in SystemState::ALL.iter() {
            assert_eq!(transition(state, Event::Error).0, SystemState::Error);
        }
    }

    #[test]
    fn error_recovery_stays_in_error_without_override() {
        let (next, action) = transition(SystemState::Error, Event::CancelPressed);
        assert_eq!(next, SystemState::Error);
        assert_eq!(action, Action::RecoverFromError);
    }

    #[test]
    fn timeout_gate_matches_blocking_states() {
        use SystemState::*;
        for &state in SystemState::ALL.iter() {
            let expected = !matches!(
                state,
                Waiting | Authorization | Refueling | RefuelDataTransmission
                    | IntakeDataTransmission
            );
            assert_eq!(timeout_enabled(state), expected, "state {state:?}");
        }
    }

    #[test]
    fn timeout_transitions_only_from_enabled_states() {
        // Property: a Timeout never moves a state the gate protects.
        for &state in SystemState::ALL.iter() {
            let (next, _) = transition(state, Event::Timeout);
            if !timeout_enabled(state) {
                assert_eq!(next, state, "blocking state {state:?} moved on Timeout");
            }
        }
    }

    #[test]
    fn override_is_consumed_once() {
        let machine = StateMachine::new();
        machine.set_override(SystemState::Waiting);
        let to = machine.apply(SystemState::Error, SystemState::Error);
        assert_eq!(to, SystemState::Waiting);

        // Next apply sees no override.
        let to = machine.apply(SystemState::Waiting, SystemState::PinEntry);
        assert_eq!(to, SystemState::PinEntry);
        assert_eq!(machine.previous_state(), SystemState::Waiting);
    }

    #[test]
    fn clear_override_discards_stale_value() {
        let machine = StateMachine::new();
        machine.set_override(SystemState::Waiting);
        machine.clear_override();
        let to = machine.apply(SystemState::Error, SystemState::Error);
        assert_eq!(to, SystemState::Error);
    }

    #[test]
    fn reset_returns_to_waiting() {
        let machine = StateMachine::new();
        machine.apply(SystemState::Waiting, SystemState::Refueling);
        assert!(machine.reset());
        assert_eq!(machine.current_state(), SystemState::Waiting);
        assert!(!machine.reset());
    }

    #[test]
    fn inactivity_timer_posts_timeout_in_enabled_state() {
        let machine = StateMachine::new();
        let queue = Arc::new(EventQueue::new());
        machine.apply(SystemState::Waiting, SystemState::TankSelection);

        machine.start_inactivity_timer(Arc::clone(&queue), Duration::from_millis(50));
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut fired = false;
        while Instant::now() < deadline {
            if queue.try_pop() == Some(Event::Timeout) {
                fired = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        machine.stop_inactivity_timer();
        assert!(fired);
    }

    #[test]
    fn inactivity_timer_silent_in_blocking_state() {
        let machine = StateMachine::new();
        let queue = Arc::new(EventQueue::new());
        // Waiting is a blocking state for the timer.
        machine.start_inactivity_timer(Arc::clone(&queue), Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(200));
        machine.stop_inactivity_timer();
        assert!(queue.is_empty());
    }
}
