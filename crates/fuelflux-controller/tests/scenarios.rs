//! End-to-end scenarios over the full controller with simulation
//! peripherals, a scripted backend, and an in-memory store.
//!
//! The tests drive the event queue synchronously: every stimulus is
//! followed by a drain, so each assertion sees a settled state.

use fuelflux_backend::{
    Backend, BackendError, BackendTankInfo, RecordedCall, StubAuth, StubBackend,
};
use fuelflux_cache::{CacheManager, CacheManagerConfig};
use fuelflux_controller::{Controller, ControllerConfig};
use fuelflux_core::{Event, IntakeDirection, KeyCode, MessageMethod, SystemState, UserRole};
use fuelflux_peripherals::sim::{SimCardReader, SimDisplay, SimFlowMeter, SimKeyboard, SimPump};
use fuelflux_peripherals::{Peripheral, Pump};
use fuelflux_store::MessageStore;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    controller: Arc<Controller>,
    backend: Arc<StubBackend>,
    store: Arc<MessageStore>,
    display: SimDisplay,
    keyboard: SimKeyboard,
    card_reader: SimCardReader,
    pump: SimPump,
    flow_meter: SimFlowMeter,
}

impl Rig {
    fn with_config(config: ControllerConfig) -> Self {
        let backend = Arc::new(StubBackend::new("CTRL-UID"));
        let store = Arc::new(MessageStore::open_in_memory().unwrap());

        // The cache manager owns its own portal session; its stub fails
        // fast so the background population never interferes.
        let sync_backend = Arc::new(StubBackend::new("CTRL-UID"));
        sync_backend.set_default_authorize(Err(BackendError::Network("offline".into())));
        let cache_manager = Arc::new(CacheManager::new(
            Arc::clone(&store),
            sync_backend as Arc<dyn Backend>,
            CacheManagerConfig::default(),
        ));

        let controller = Controller::new(
            config,
            Arc::clone(&backend) as Arc<dyn Backend>,
            Some(Arc::clone(&store)),
            Some(cache_manager),
        );

        let display = SimDisplay::new();
        let keyboard = SimKeyboard::new();
        let card_reader = SimCardReader::new();
        let pump = SimPump::new();
        let flow_meter = SimFlowMeter::new();

        controller.set_display(Box::new(display.clone()));
        controller.set_keyboard(Box::new(keyboard.clone()));
        controller.set_card_reader(Box::new(card_reader.clone()));
        controller.set_pump(Box::new(pump.clone()));
        controller.set_flow_meter(Box::new(flow_meter.clone()));

        Self {
            controller,
            backend,
            store,
            display,
            keyboard,
            card_reader,
            pump,
            flow_meter,
        }
    }

    fn new() -> Self {
        Self::with_config(ControllerConfig::new("SER-1"))
    }

    fn start(&self) {
        assert!(self.controller.initialize());
        self.drain();
    }

    fn drain(&self) {
        self.controller.process_pending_events();
    }

    fn press(&self, key: KeyCode) {
        self.keyboard.press(key);
        self.drain();
    }

    /// Type a string of digits followed by Start.
    fn enter(&self, digits: &str) {
        for ch in digits.chars() {
            self.keyboard.press(digit_key(ch));
        }
        self.keyboard.press(KeyCode::Start);
        self.drain();
    }

    fn present_card(&self, uid: &str) {
        self.card_reader.present_card(uid);
        self.drain();
    }

    fn state(&self) -> SystemState {
        self.controller.current_state()
    }
}

fn digit_key(ch: char) -> KeyCode {
    match ch {
        '0' => KeyCode::Key0,
        '1' => KeyCode::Key1,
        '2' => KeyCode::Key2,
        '3' => KeyCode::Key3,
        '4' => KeyCode::Key4,
        '5' => KeyCode::Key5,
        '6' => KeyCode::Key6,
        '7' => KeyCode::Key7,
        '8' => KeyCode::Key8,
        '9' => KeyCode::Key9,
        _ => panic!("not a digit: {ch}"),
    }
}

fn customer_auth(allowance: f64) -> StubAuth {
    StubAuth {
        role_id: 1,
        allowance,
        price: 45.5,
        tanks: vec![BackendTankInfo {
            id_tank: 1,
            name_tank: "A".into(),
        }],
    }
}

fn operator_auth() -> StubAuth {
    StubAuth {
        role_id: 2,
        allowance: 0.0,
        price: 0.0,
        tanks: vec![BackendTankInfo {
            id_tank: 1,
            name_tank: "A".into(),
        }],
    }
}

// =============================================================================
// Happy customer refuel
// =============================================================================

#[test]
fn happy_customer_refuel() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    assert_eq!(rig.state(), SystemState::Waiting);
    assert!(rig.card_reader.reading_enabled());

    rig.present_card("CUST-1");
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert_eq!(rig.controller.current_user().role, UserRole::Customer);
    assert!(!rig.card_reader.reading_enabled());

    rig.enter("1");
    assert_eq!(rig.state(), SystemState::VolumeEntry);
    assert_eq!(rig.controller.selected_tank(), 1);

    rig.enter("50");
    assert_eq!(rig.state(), SystemState::Refueling);
    assert!(rig.pump.is_running());

    // Pump until the target volume is reached; the controller stops the
    // pump and the stopped pump drives the state machine onward.
    rig.flow_meter.feed_until(50.0, 12.5);
    assert!(!rig.pump.is_running());
    rig.drain();

    assert_eq!(rig.state(), SystemState::RefuelingComplete);
    assert!(rig.card_reader.reading_enabled());

    let calls = rig.backend.calls();
    let refuels: Vec<_> = calls
        .iter()
        .filter(|c| matches!(c, RecordedCall::Refuel { .. }))
        .collect();
    assert_eq!(
        refuels,
        vec![&RecordedCall::Refuel {
            tank: 1,
            volume: 50.0
        }]
    );
    let deauths = calls
        .iter()
        .filter(|c| matches!(c, RecordedCall::Deauthorize))
        .count();
    assert_eq!(deauths, 1);

    // The cached allowance followed the refuel: authorized at 100,
    // deducted by 50.
    assert_eq!(
        rig.store.cache_get("CUST-1").unwrap().unwrap().allowance,
        50.0
    );

    let shown = rig.display.last_message();
    assert_eq!(shown.line1, "Заправка завершена");
    assert_eq!(shown.line2, "50.00 л");
}

// =============================================================================
// Happy operator intake
// =============================================================================

#[test]
fn happy_operator_intake() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(operator_auth()));
    rig.start();

    rig.present_card("OP-1");
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert_eq!(rig.controller.current_user().role, UserRole::Operator);

    rig.enter("1");
    assert_eq!(rig.state(), SystemState::IntakeDirectionSelection);

    rig.enter("1");
    assert_eq!(rig.state(), SystemState::IntakeVolumeEntry);

    rig.enter("100");
    assert_eq!(rig.state(), SystemState::IntakeComplete);

    let calls = rig.backend.calls();
    assert!(calls.contains(&RecordedCall::Intake {
        tank: 1,
        volume: 100.0,
        direction: IntakeDirection::In,
    }));

    let shown = rig.display.last_message();
    assert_eq!(shown.line1, "Приём завершён");
    assert_eq!(shown.line2, "100.00 л");
    assert_eq!(shown.line4, "Приём топлива");

    // The operator session closes on cancel; only then is the portal
    // session given back.
    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::Waiting);
    assert!(rig.backend.calls().contains(&RecordedCall::Deauthorize));
}

// =============================================================================
// Network-error fallback to the allowance cache
// =============================================================================

#[test]
fn cache_fallback_refuel_lands_in_backlog() {
    let rig = Rig::new();
    rig.backend
        .enqueue_authorize(Err(BackendError::Network("portal unreachable".into())));
    rig.store.cache_update("OFFLINE-1", 123.0, 1).unwrap();
    rig.start();

    rig.present_card("OFFLINE-1");
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert!(rig.controller.authorized_from_cache());
    assert!(rig.controller.available_tanks().is_empty());

    // Without a tank list from the portal, any positive tank is allowed.
    rig.enter("7");
    assert_eq!(rig.state(), SystemState::VolumeEntry);

    rig.enter("10");
    assert_eq!(rig.state(), SystemState::Refueling);
    rig.flow_meter.feed_until(10.0, 2.5);
    rig.drain();
    assert_eq!(rig.state(), SystemState::RefuelingComplete);

    // No online report and no deauthorize for a cache session.
    assert_eq!(
        rig.backend.calls(),
        vec![RecordedCall::Authorize("OFFLINE-1".into())]
    );

    let item = rig.store.next_backlog().unwrap().unwrap();
    assert_eq!(item.uid, "OFFLINE-1");
    assert_eq!(item.method, MessageMethod::Refuel);
    let payload: serde_json::Value = serde_json::from_str(&item.data).unwrap();
    assert_eq!(payload["TankNumber"], 7);
    assert_eq!(payload["FuelVolume"], 10.0);
    assert!(payload["TimeAt"].as_i64().unwrap() > 0);

    assert_eq!(
        rig.store.cache_get("OFFLINE-1").unwrap().unwrap().allowance,
        113.0
    );
}

// =============================================================================
// Cancel mid-pump still reports the dispensed volume
// =============================================================================

#[test]
fn cancel_mid_refuel_reports_partial_volume() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    rig.present_card("CUST-1");
    rig.enter("1");
    rig.enter("50");
    assert_eq!(rig.state(), SystemState::Refueling);

    rig.flow_meter.feed(3.7);
    rig.drain();
    assert_eq!(rig.state(), SystemState::Refueling);
    assert!(rig.pump.is_running());

    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::RefuelingComplete);
    assert!(!rig.pump.is_running());

    assert!(rig.backend.calls().contains(&RecordedCall::Refuel {
        tank: 1,
        volume: 3.7
    }));
    assert_eq!(rig.display.last_message().line2, "3.70 л");
}

// =============================================================================
// Failed authorization, then recovery to a fresh session
// =============================================================================

#[test]
fn failed_authorization_shows_reason_then_cancel_restores_waiting() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Err(BackendError::Application {
        code: 1,
        text: "Карта не найдена".into(),
    }));
    rig.start();

    rig.present_card("BAD-1");
    assert_eq!(rig.state(), SystemState::NotAuthorized);
    let shown = rig.display.last_message();
    assert_eq!(shown.line1, "Авторизация отклонена");
    assert_eq!(shown.line2, "Карта не найдена");

    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::Waiting);
    assert!(rig.controller.current_user().uid.is_empty());
    assert!(rig.card_reader.reading_enabled());
}

// =============================================================================
// PIN entry
// =============================================================================

#[test]
fn pin_entry_authorizes_with_typed_digits() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(10.0)));
    rig.start();

    rig.press(KeyCode::Key1);
    assert_eq!(rig.state(), SystemState::PinEntry);
    // NFC stays off while a PIN is being typed.
    assert!(!rig.card_reader.reading_enabled());

    rig.keyboard.press(KeyCode::Key2);
    rig.keyboard.press(KeyCode::Key3);
    rig.keyboard.press(KeyCode::Key4);
    rig.drain();
    assert_eq!(rig.display.last_message().line2, "****");

    rig.press(KeyCode::Start);
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert_eq!(
        rig.backend.calls()[0],
        RecordedCall::Authorize("1234".into())
    );
    // The PIN never survives authorization.
    assert!(rig.controller.current_input().is_empty());
}

#[test]
fn clear_key_edits_pin() {
    let rig = Rig::new();
    rig.start();

    rig.press(KeyCode::Key1);
    rig.press(KeyCode::Key2);
    rig.press(KeyCode::Clear);
    assert_eq!(rig.controller.current_input(), "1");
    assert_eq!(rig.display.last_message().line2, "*");
}

// =============================================================================
// Volume validation
// =============================================================================

#[test]
fn volume_above_allowance_is_rejected() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(20.0)));
    rig.start();

    rig.present_card("CUST-1");
    rig.enter("1");
    assert_eq!(rig.state(), SystemState::VolumeEntry);

    rig.enter("50");
    // Rejected: input cleared, no state change, pump untouched.
    assert_eq!(rig.state(), SystemState::VolumeEntry);
    assert!(rig.controller.current_input().is_empty());
    assert!(!rig.pump.is_running());

    rig.enter("20");
    assert_eq!(rig.state(), SystemState::Refueling);
}

#[test]
fn max_key_fills_allowance() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    rig.present_card("CUST-1");
    rig.enter("1");
    rig.press(KeyCode::Max);
    assert_eq!(rig.controller.current_input(), "100");
}

#[test]
fn unknown_tank_is_rejected() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    rig.present_card("CUST-1");
    rig.enter("9");
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert!(rig.controller.current_input().is_empty());
}

// =============================================================================
// Timeouts and watchdogs
// =============================================================================

#[test]
fn inactivity_timeout_returns_to_waiting() {
    let mut config = ControllerConfig::new("SER-1");
    config.inactivity_timeout = Duration::from_millis(50);
    let rig = Rig::with_config(config);
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    rig.present_card("CUST-1");
    assert_eq!(rig.state(), SystemState::TankSelection);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        std::thread::sleep(Duration::from_millis(20));
        rig.drain();
        if rig.state() == SystemState::Waiting {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timeout never fired"
        );
    }

    // Session torn down: user gone and portal session closed.
    assert!(rig.controller.current_user().uid.is_empty());
    assert!(rig.backend.calls().contains(&RecordedCall::Deauthorize));
}

#[test]
fn no_flow_watchdog_cancels_refueling() {
    let mut config = ControllerConfig::new("SER-1");
    config.no_flow_timeout = Duration::from_millis(50);
    let rig = Rig::with_config(config);
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    rig.present_card("CUST-1");
    rig.enter("1");
    rig.enter("50");
    assert_eq!(rig.state(), SystemState::Refueling);
    assert!(rig.pump.is_running());

    // No flow arrives at all; the watchdog cancels the run.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        std::thread::sleep(Duration::from_millis(20));
        rig.drain();
        if rig.state() == SystemState::RefuelingComplete {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "watchdog never fired"
        );
    }

    assert!(!rig.pump.is_running());
    // Zero liters were dispensed and zero liters get reported.
    assert!(rig.backend.calls().contains(&RecordedCall::Refuel {
        tank: 1,
        volume: 0.0
    }));
}

// =============================================================================
// Display reset and device recovery
// =============================================================================

#[test]
fn display_reset_preserves_logical_state() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.start();

    rig.present_card("CUST-1");
    assert_eq!(rig.state(), SystemState::TankSelection);

    rig.press(KeyCode::DisplayReset);
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert!(rig.display.is_connected());
    // The repaint shows the same state again.
    assert_eq!(
        rig.display.last_message().line1,
        "Выберите цистерну и нажмите Старт (A)"
    );
}

#[test]
fn failed_peripheral_puts_device_in_error_and_cancel_recovers() {
    let rig = Rig::new();
    rig.display.fail_next_initialize();

    assert!(!rig.controller.initialize());
    rig.drain();
    assert_eq!(rig.state(), SystemState::Error);

    // Cancel triggers reinitialization; the display now comes up.
    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::Waiting);
    assert!(rig.display.is_connected());
}

#[test]
fn exhausted_reinit_budget_is_fatal() {
    let mut config = ControllerConfig::new("SER-1");
    config.max_reinit_attempts = 1;
    let rig = Rig::with_config(config);
    rig.start();

    rig.controller.post_event(Event::Error);
    rig.drain();
    assert_eq!(rig.state(), SystemState::Error);

    // First recovery attempt fails and consumes the budget.
    rig.display.fail_next_initialize();
    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::Error);

    // Second attempt exceeds the budget: permanent failure.
    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::Error);
    assert_eq!(rig.display.last_message().line2, "Устройство неисправно");

    // The device ignores further input but stays alive.
    rig.press(KeyCode::Stop);
    assert_eq!(rig.state(), SystemState::Error);
}

// =============================================================================
// Sequential sessions
// =============================================================================

#[test]
fn second_customer_can_refuel_from_completion_screen() {
    let rig = Rig::new();
    rig.backend.enqueue_authorize(Ok(customer_auth(100.0)));
    rig.backend.enqueue_authorize(Ok(customer_auth(30.0)));
    rig.start();

    rig.present_card("CUST-1");
    rig.enter("1");
    rig.enter("50");
    rig.flow_meter.feed_until(50.0, 25.0);
    rig.drain();
    assert_eq!(rig.state(), SystemState::RefuelingComplete);

    // A new card on the completion screen starts the next session.
    rig.present_card("CUST-2");
    assert_eq!(rig.state(), SystemState::TankSelection);
    assert_eq!(rig.controller.current_user().allowance, 30.0);

    rig.enter("1");
    rig.enter("30");
    rig.flow_meter.feed_until(30.0, 15.0);
    rig.drain();
    assert_eq!(rig.state(), SystemState::RefuelingComplete);

    let refuels: Vec<_> = rig
        .backend
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RecordedCall::Refuel { .. }))
        .collect();
    assert_eq!(refuels.len(), 2);
}
