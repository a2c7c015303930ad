//! In-memory peripheral simulations.
//!
//! Each simulation is a cloneable handle over shared state: the
//! controller owns one clone as the peripheral, the test keeps another to
//! inject input and observe output. Callbacks are invoked synchronously
//! on the caller's thread, with no internal data lock held, so a callback
//! may freely call back into the owning peripheral set.

use crate::{
    CardCallback, CardReader, Display, FlowCallback, FlowMeter, KeyCallback, Keyboard, Peripheral,
    PeripheralError, PeripheralResult, Pump, PumpStateCallback,
};
use fuelflux_core::{DisplayMessage, KeyCode, UserId, Volume};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

fn take_fail_flag(flag: &AtomicBool, name: &str) -> PeripheralResult<()> {
    if flag.swap(false, Ordering::SeqCst) {
        Err(PeripheralError::InitFailed(format!(
            "{name} simulated failure"
        )))
    } else {
        Ok(())
    }
}

// =============================================================================
// Display
// =============================================================================

#[derive(Default)]
struct SimDisplayInner {
    connected: AtomicBool,
    backlight: AtomicBool,
    fail_next_initialize: AtomicBool,
    last_message: Mutex<DisplayMessage>,
    history: Mutex<Vec<DisplayMessage>>,
}

/// Display simulation that records everything it is told to show.
#[derive(Clone, Default)]
pub struct SimDisplay {
    inner: Arc<SimDisplayInner>,
}

impl SimDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// The message currently "on screen".
    pub fn last_message(&self) -> DisplayMessage {
        self.inner.last_message.lock().expect("lock poisoned").clone()
    }

    /// Every message shown, in order.
    pub fn history(&self) -> Vec<DisplayMessage> {
        self.inner.history.lock().expect("lock poisoned").clone()
    }

    /// Make the next `initialize` fail once.
    pub fn fail_next_initialize(&self) {
        self.inner.fail_next_initialize.store(true, Ordering::SeqCst);
    }
}

impl Peripheral for SimDisplay {
    fn initialize(&mut self) -> PeripheralResult<()> {
        take_fail_flag(&self.inner.fail_next_initialize, "display")?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Display for SimDisplay {
    fn show(&mut self, message: &DisplayMessage) {
        *self.inner.last_message.lock().expect("lock poisoned") = message.clone();
        self.inner
            .history
            .lock()
            .expect("lock poisoned")
            .push(message.clone());
    }

    fn clear(&mut self) {
        *self.inner.last_message.lock().expect("lock poisoned") = DisplayMessage::default();
    }

    fn set_backlight(&mut self, enabled: bool) {
        self.inner.backlight.store(enabled, Ordering::SeqCst);
    }
}

// =============================================================================
// Keyboard
// =============================================================================

#[derive(Default)]
struct SimKeyboardInner {
    connected: AtomicBool,
    enabled: AtomicBool,
    fail_next_initialize: AtomicBool,
    callback: Mutex<Option<KeyCallback>>,
}

/// Keyboard simulation; tests press keys through the handle.
#[derive(Clone, Default)]
pub struct SimKeyboard {
    inner: Arc<SimKeyboardInner>,
}

impl SimKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a key press, respecting the enable gate.
    pub fn press(&self, key: KeyCode) {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            debug!(?key, "Key ignored: input disabled");
            return;
        }
        let callback = self.inner.callback.lock().expect("lock poisoned");
        if let Some(cb) = callback.as_ref() {
            cb(key);
        }
    }

    pub fn fail_next_initialize(&self) {
        self.inner.fail_next_initialize.store(true, Ordering::SeqCst);
    }
}

impl Peripheral for SimKeyboard {
    fn initialize(&mut self) -> PeripheralResult<()> {
        take_fail_flag(&self.inner.fail_next_initialize, "keyboard")?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Keyboard for SimKeyboard {
    fn set_key_callback(&mut self, callback: KeyCallback) {
        *self.inner.callback.lock().expect("lock poisoned") = Some(callback);
    }

    fn enable_input(&mut self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }
}

// =============================================================================
// Card reader
// =============================================================================

#[derive(Default)]
struct SimCardReaderInner {
    connected: AtomicBool,
    enabled: AtomicBool,
    fail_next_initialize: AtomicBool,
    callback: Mutex<Option<CardCallback>>,
}

/// Card reader simulation; tests present cards through the handle.
#[derive(Clone, Default)]
pub struct SimCardReader {
    inner: Arc<SimCardReaderInner>,
}

impl SimCardReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Present a card. Ignored while reading is disabled.
    pub fn present_card(&self, uid: &str) {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            debug!(uid, "Card ignored: reading disabled");
            return;
        }
        let callback = self.inner.callback.lock().expect("lock poisoned");
        if let Some(cb) = callback.as_ref() {
            let uid: UserId = uid.to_string();
            cb(&uid);
        }
    }

    pub fn reading_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn fail_next_initialize(&self) {
        self.inner.fail_next_initialize.store(true, Ordering::SeqCst);
    }
}

impl Peripheral for SimCardReader {
    fn initialize(&mut self) -> PeripheralResult<()> {
        take_fail_flag(&self.inner.fail_next_initialize, "card reader")?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl CardReader for SimCardReader {
    fn set_card_callback(&mut self, callback: CardCallback) {
        *self.inner.callback.lock().expect("lock poisoned") = Some(callback);
    }

    fn enable_reading(&mut self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }
}

// =============================================================================
// Pump
// =============================================================================

#[derive(Default)]
struct SimPumpInner {
    connected: AtomicBool,
    running: AtomicBool,
    fail_next_initialize: AtomicBool,
    callback: Mutex<Option<PumpStateCallback>>,
}

/// Pump relay simulation.
///
/// Start/stop are idempotent; the state callback fires only on an actual
/// change, synchronously on the caller's thread.
#[derive(Clone, Default)]
pub struct SimPump {
    inner: Arc<SimPumpInner>,
}

impl SimPump {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_running(&self, running: bool) {
        let was = self.inner.running.swap(running, Ordering::SeqCst);
        if was == running {
            return;
        }
        let callback = self.inner.callback.lock().expect("lock poisoned");
        if let Some(cb) = callback.as_ref() {
            cb(running);
        }
    }

    pub fn fail_next_initialize(&self) {
        self.inner.fail_next_initialize.store(true, Ordering::SeqCst);
    }
}

impl Peripheral for SimPump {
    fn initialize(&mut self) -> PeripheralResult<()> {
        take_fail_flag(&self.inner.fail_next_initialize, "pump")?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        // The relay must end in a safe state.
        self.set_running(false);
        self.inner.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl Pump for SimPump {
    fn start(&mut self) {
        self.set_running(true);
    }

    fn stop(&mut self) {
        self.set_running(false);
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn set_state_callback(&mut self, callback: PumpStateCallback) {
        *self.inner.callback.lock().expect("lock poisoned") = Some(callback);
    }
}

// =============================================================================
// Flow meter
// =============================================================================

#[derive(Default)]
struct SimFlowMeterInner {
    connected: AtomicBool,
    measuring: AtomicBool,
    fail_next_initialize: AtomicBool,
    current: Mutex<Volume>,
    total: Mutex<Volume>,
    callback: Mutex<Option<FlowCallback>>,
}

/// Flow meter simulation; tests feed volume increments through the handle.
#[derive(Clone, Default)]
pub struct SimFlowMeter {
    inner: Arc<SimFlowMeterInner>,
}

impl SimFlowMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add dispensed volume and report the new counter value.
    ///
    /// Ignored while measurement is stopped, like pulses on a real meter
    /// whose counter input is gated off.
    pub fn feed(&self, delta: Volume) {
        if !self.inner.measuring.load(Ordering::SeqCst) {
            return;
        }
        let current = {
            let mut current = self.inner.current.lock().expect("lock poisoned");
            *current += delta;
            let mut total = self.inner.total.lock().expect("lock poisoned");
            *total += delta;
            *current
        };
        let callback = self.inner.callback.lock().expect("lock poisoned");
        if let Some(cb) = callback.as_ref() {
            cb(current);
        }
    }

    /// Feed flow in `step`-sized increments until `target` is reached.
    pub fn feed_until(&self, target: Volume, step: Volume) {
        while self.inner.measuring.load(Ordering::SeqCst) {
            let current = *self.inner.current.lock().expect("lock poisoned");
            if current >= target {
                break;
            }
            let delta = step.min(target - current);
            self.feed(delta);
        }
    }

    pub fn fail_next_initialize(&self) {
        self.inner.fail_next_initialize.store(true, Ordering::SeqCst);
    }
}

impl Peripheral for SimFlowMeter {
    fn initialize(&mut self) -> PeripheralResult<()> {
        take_fail_flag(&self.inner.fail_next_initialize, "flow meter")?;
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.measuring.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl FlowMeter for SimFlowMeter {
    fn start_measurement(&mut self) {
        self.inner.measuring.store(true, Ordering::SeqCst);
    }

    fn stop_measurement(&mut self) {
        self.inner.measuring.store(false, Ordering::SeqCst);
    }

    fn reset_counter(&mut self) {
        *self.inner.current.lock().expect("lock poisoned") = 0.0;
        *self.inner.total.lock().expect("lock poisoned") = 0.0;
    }

    fn current_volume(&self) -> Volume {
        *self.inner.current.lock().expect("lock poisoned")
    }

    fn total_volume(&self) -> Volume {
        *self.inner.total.lock().expect("lock poisoned")
    }

    fn set_flow_callback(&mut self, callback: FlowCallback) {
        *self.inner.callback.lock().expect("lock poisoned") = Some(callback);
    }
}
