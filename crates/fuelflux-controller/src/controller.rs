//! The device controller.
//!
//! Owns the peripherals, the portal backend, the durable store, the
//! cache manager, and the state machine. All producers (peripheral
//! callbacks, timers, watchdogs) post into the serialized event queue;
//! the event-loop thread is the only place transitions and session
//! mutations happen.

use crate::display::{display_message, DisplayContext};
use crate::events::EventQueue;
use crate::machine::{transition, Action, StateMachine, INACTIVITY_TIMEOUT};
use fuelflux_backend::Backend;
use fuelflux_cache::CacheManager;
use fuelflux_core::{
    now_unix_ms, DisplayMessage, Event, IntakeDirection, IntakeTransaction, KeyCode,
    MessageMethod, RefuelTransaction, SystemState, TankInfo, TankNumber, UserInfo, UserRole,
    Volume,
};
use fuelflux_peripherals::{CardReader, Display, FlowMeter, Keyboard, Pump};
use fuelflux_store::MessageStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INPUT_MAX_LEN: usize = 10;
const EVENT_POLL: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Controller tuning knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Device serial shown on the display and reported to the portal.
    pub controller_id: String,
    /// How long the pump may run without flow before the refuel is
    /// cancelled.
    pub no_flow_timeout: Duration,
    /// Idle budget before an abandoned session is torn down.
    pub inactivity_timeout: Duration,
    /// Reinitialization attempts allowed within `reinit_window` before
    /// the device is declared permanently failed.
    pub max_reinit_attempts: usize,
    pub reinit_window: Duration,
}

impl ControllerConfig {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            no_flow_timeout: Duration::from_secs(30),
            inactivity_timeout: INACTIVITY_TIMEOUT,
            max_reinit_attempts: 10,
            reinit_window: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Default)]
struct Peripherals {
    display: Mutex<Option<Box<dyn Display + Send>>>,
    keyboard: Mutex<Option<Box<dyn Keyboard + Send>>>,
    card_reader: Mutex<Option<Box<dyn CardReader + Send>>>,
    pump: Mutex<Option<Box<dyn Pump + Send>>>,
    flow_meter: Mutex<Option<Box<dyn FlowMeter + Send>>>,
}

struct SessionData {
    user: UserInfo,
    available_tanks: Vec<TankInfo>,
    selected_tank: TankNumber,
    entered_volume: Volume,
    current_input: String,
    intake_direction: IntakeDirection,
    current_refuel_volume: Volume,
    target_refuel_volume: Volume,
    authorized_from_cache: bool,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            user: UserInfo::default(),
            available_tanks: Vec::new(),
            selected_tank: 0,
            entered_volume: 0.0,
            current_input: String::new(),
            intake_direction: IntakeDirection::In,
            current_refuel_volume: 0.0,
            target_refuel_volume: 0.0,
            authorized_from_cache: false,
        }
    }
}

struct FlowMonitor {
    pump_running: bool,
    no_flow_posted: bool,
    last_flow_update: Instant,
}

impl Default for FlowMonitor {
    fn default() -> Self {
        Self {
            pump_running: false,
            no_flow_posted: false,
            last_flow_update: Instant::now(),
        }
    }
}

/// The device controller. Create with [`Controller::new`], hand it
/// peripherals, then `initialize` and `run`.
pub struct Controller {
    config: ControllerConfig,
    machine: StateMachine,
    queue: Arc<EventQueue>,
    backend: Arc<dyn Backend>,
    store: Option<Arc<MessageStore>>,
    cache_manager: Option<Arc<CacheManager>>,
    peripherals: Peripherals,
    session: Mutex<SessionData>,
    flow: Mutex<FlowMonitor>,
    last_error: Mutex<String>,
    running: AtomicBool,
    loop_started: AtomicBool,
    loop_exited: AtomicBool,
    fatal: AtomicBool,
    reinit_attempts: Mutex<Vec<Instant>>,
    watchdog_running: Arc<AtomicBool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    weak_self: Mutex<Weak<Controller>>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        backend: Arc<dyn Backend>,
        store: Option<Arc<MessageStore>>,
        cache_manager: Option<Arc<CacheManager>>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            config,
            machine: StateMachine::new(),
            queue: Arc::new(EventQueue::new()),
            backend,
            store,
            cache_manager,
            peripherals: Peripherals::default(),
            session: Mutex::new(SessionData::default()),
            flow: Mutex::new(FlowMonitor::default()),
            last_error: Mutex::new(String::new()),
            running: AtomicBool::new(false),
            loop_started: AtomicBool::new(false),
            loop_exited: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            reinit_attempts: Mutex::new(Vec::new()),
            watchdog_running: Arc::new(AtomicBool::new(false)),
            watchdog: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *controller.weak_self.lock().expect("lock poisoned") = Arc::downgrade(&controller);
        controller
    }

    fn session(&self) -> MutexGuard<'_, SessionData> {
        self.session.lock().expect("lock poisoned")
    }

    // ==========================================
    // Peripheral wiring
    // ==========================================

    pub fn set_display(&self, display: Box<dyn Display + Send>) {
        *self.peripherals.display.lock().expect("lock poisoned") = Some(display);
    }

    pub fn set_keyboard(&self, keyboard: Box<dyn Keyboard + Send>) {
        *self.peripherals.keyboard.lock().expect("lock poisoned") = Some(keyboard);
    }

    pub fn set_card_reader(&self, card_reader: Box<dyn CardReader + Send>) {
        *self.peripherals.card_reader.lock().expect("lock poisoned") = Some(card_reader);
    }

    pub fn set_pump(&self, pump: Box<dyn Pump + Send>) {
        *self.peripherals.pump.lock().expect("lock poisoned") = Some(pump);
    }

    pub fn set_flow_meter(&self, flow_meter: Box<dyn FlowMeter + Send>) {
        *self.peripherals.flow_meter.lock().expect("lock poisoned") = Some(flow_meter);
    }

    fn setup_peripheral_callbacks(&self) {
        let weak = self.weak_self.lock().expect("lock poisoned").clone();

        if let Some(keyboard) = self
            .peripherals
            .keyboard
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            let weak = weak.clone();
            keyboard.set_key_callback(Box::new(move |key| {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_key_press(key);
                }
            }));
            keyboard.enable_input(true);
        }

        if let Some(reader) = self
            .peripherals
            .card_reader
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            let weak = weak.clone();
            reader.set_card_callback(Box::new(move |uid| {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_card_presented(uid);
                }
            }));
            // Disabled until the machine enters a card-accepting state.
            reader.enable_reading(false);
        }

        if let Some(pump) = self
            .peripherals
            .pump
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            let weak = weak.clone();
            pump.set_state_callback(Box::new(move |is_running| {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_pump_state_changed(is_running);
                }
            }));
        }

        if let Some(meter) = self
            .peripherals
            .flow_meter
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            let weak = weak.clone();
            meter.set_flow_callback(Box::new(move |volume| {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_flow_update(volume);
                }
            }));
        }
    }

    fn initialize_peripherals(&self) -> bool {
        let mut ok = true;
        let mut first_error: Option<&str> = None;

        macro_rules! init_one {
            ($slot:expr, $label:expr, $message:expr) => {
                if let Some(peripheral) = $slot.lock().expect("lock poisoned").as_mut() {
                    if let Err(err) = peripheral.initialize() {
                        error!(peripheral = $label, error = %err, "Failed to initialize peripheral");
                        if first_error.is_none() {
                            first_error = Some($message);
                        }
                        ok = false;
                    }
                }
            };
        }

        init_one!(self.peripherals.display, "display", "Ошибка дисплея");
        init_one!(self.peripherals.keyboard, "keyboard", "Ошибка клавиатуры");
        init_one!(
            self.peripherals.card_reader,
            "card reader",
            "Ошибка считывателя карт"
        );
        init_one!(self.peripherals.pump, "pump", "Ошибка насоса");
        init_one!(
            self.peripherals.flow_meter,
            "flow meter",
            "Ошибка расходомера"
        );

        if !ok {
            warn!("Initialization failed, cleaning up partially initialized peripherals");
            self.shutdown_peripherals();
            self.set_last_error(first_error.unwrap_or("Критическая ошибка инициализации"));
        }
        ok
    }

    fn shutdown_peripherals(&self) {
        if let Some(display) = self
            .peripherals
            .display
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            display.shutdown();
        }
        if let Some(keyboard) = self
            .peripherals
            .keyboard
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            keyboard.shutdown();
        }
        if let Some(reader) = self
            .peripherals
            .card_reader
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            reader.shutdown();
        }
        if let Some(pump) = self
            .peripherals
            .pump
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            pump.shutdown();
        }
        if let Some(meter) = self
            .peripherals
            .flow_meter
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            meter.shutdown();
        }
    }

    // ==========================================
    // Lifecycle
    // ==========================================

    /// Initialize peripherals, wire callbacks, and start the background
    /// threads.
    ///
    /// Returns `false` when a peripheral failed; the controller still
    /// enters the run loop in `Error` state so the operator can attempt
    /// recovery with Cancel.
    pub fn initialize(&self) -> bool {
        info!(controller_id = %self.config.controller_id, "Initializing controller");

        self.last_error.lock().expect("lock poisoned").clear();
        let ok = self.initialize_peripherals();
        self.setup_peripheral_callbacks();

        self.machine.reset();
        self.on_enter_state(SystemState::Waiting);

        if let Some(cache_manager) = &self.cache_manager {
            if cache_manager.start() {
                info!("Cache manager started");
            } else {
                warn!("Cache manager already running");
            }
        }

        // Run even after a failed initialization: the device sits in
        // Error state waiting for recovery instead of going dark.
        self.running.store(true, Ordering::SeqCst);
        self.machine
            .start_inactivity_timer(Arc::clone(&self.queue), self.config.inactivity_timeout);
        self.start_no_flow_monitor();

        if !ok {
            error!("Initialization completed with errors");
            self.dispatch_event(Event::Error);
        } else {
            info!("Initialization complete");
        }
        ok
    }

    /// The event loop. Blocks until [`Controller::shutdown`].
    pub fn run(&self) {
        info!("Starting main loop");
        self.loop_started.store(true, Ordering::SeqCst);
        self.loop_exited.store(false, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            if let Some(event) = self.queue.pop_timeout(EVENT_POLL) {
                self.process_event(event);
            }
        }

        self.loop_exited.store(true, Ordering::SeqCst);
        info!("Main loop stopped");
    }

    /// Stop background threads, drain nothing further, release
    /// peripherals. Pending backlog items stay persisted for the next
    /// process.
    pub fn shutdown(&self) {
        info!("Shutting down");

        if let Some(cache_manager) = &self.cache_manager {
            cache_manager.stop();
            info!("Cache manager stopped");
        }

        if self.running.swap(false, Ordering::SeqCst) {
            if self.loop_started.load(Ordering::SeqCst) {
                let deadline = Instant::now() + SHUTDOWN_GRACE;
                while !self.loop_exited.load(Ordering::SeqCst) && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
                if !self.loop_exited.load(Ordering::SeqCst) {
                    error!("Event loop did not exit within the shutdown grace period");
                }
            }
            self.machine.stop_inactivity_timer();
            self.stop_no_flow_monitor();
            self.shutdown_peripherals();
        }
        info!("Shutdown complete");
    }

    /// Tear down and re-initialize all peripherals after an error.
    ///
    /// Only safe to call from the event-loop thread. Drops all queued
    /// events but does not stop the loop. Attempts are budgeted; an
    /// exhausted budget declares the device permanently failed.
    pub fn reinitialize_device(&self) -> bool {
        warn!("Reinitializing device after error");

        {
            let mut attempts = self.reinit_attempts.lock().expect("lock poisoned");
            let window = self.config.reinit_window;
            attempts.retain(|t| t.elapsed() < window);
            if attempts.len() >= self.config.max_reinit_attempts {
                error!("Reinitialization budget exhausted, device permanently failed");
                self.fatal.store(true, Ordering::SeqCst);
                self.show_message(&DisplayMessage::new(
                    "ОШИБКА",
                    "Устройство неисправно",
                    "Требуется обслуживание",
                    self.config.controller_id.clone(),
                ));
                return false;
            }
            attempts.push(Instant::now());
        }

        self.last_error.lock().expect("lock poisoned").clear();
        // Drop events from the torn-down peripherals; the loop keeps
        // running to process the recovery outcome.
        self.queue.clear();

        self.shutdown_peripherals();
        let ok = self.initialize_peripherals();
        // Re-wire callbacks even after a failed attempt so the operator
        // keeps a working Cancel key to retry with.
        self.setup_peripheral_callbacks();

        self.reset_session_data();
        self.session().current_input.clear();

        if ok {
            info!("Device reinitialization complete");
        } else {
            error!("Device reinitialization failed");
        }
        ok
    }

    // ==========================================
    // Event intake and dispatch
    // ==========================================

    /// Post an event into the serialized queue. Callable from any
    /// thread.
    pub fn post_event(&self, event: Event) {
        self.queue.post(event);
    }

    /// Process queued events until the queue is empty. This is the same
    /// code path `run` uses; tests and single-step tooling drive it
    /// directly for determinism.
    pub fn process_pending_events(&self) {
        while let Some(event) = self.queue.try_pop() {
            self.process_event(event);
        }
    }

    fn process_event(&self, event: Event) {
        if self.fatal.load(Ordering::SeqCst) {
            debug!(?event, "Event ignored: device permanently failed");
            return;
        }
        match event {
            // Display reset is a hardware affair; logical state is
            // untouched.
            Event::DisplayReset => self.reinitialize_display(),
            // A display-refresh hint; consecutive hints collapse into
            // one repaint.
            Event::InputUpdated => {
                self.queue.discard_pending_input_updated();
                self.update_display();
            }
            event => self.dispatch_event(event),
        }
    }

    fn dispatch_event(&self, event: Event) {
        let from = self.machine.current_state();
        let (target, action) = transition(from, event);

        self.machine.clear_override();
        self.run_action(action);
        let to = self.machine.apply(from, target);

        debug!(?from, ?to, ?event, "Transition");
        if to != from {
            self.on_enter_state(to);
        }
    }

    fn run_action(&self, action: Action) {
        match action {
            Action::None => {}
            Action::ClearInput => self.clear_input(),
            Action::StartRefueling => {
                self.start_refueling();
                self.clear_input();
            }
            Action::CancelRefueling => self.stop_refueling(),
            Action::EndSession => self.end_current_session(),
            Action::RecoverFromError => {
                if self.reinitialize_device() {
                    self.machine.set_override(SystemState::Waiting);
                }
            }
        }
    }

    fn on_enter_state(&self, state: SystemState) {
        // Card reading only while the device is inviting a card.
        let card_reading = matches!(
            state,
            SystemState::Waiting | SystemState::RefuelingComplete
        );
        self.enable_card_reading(card_reading);

        self.update_display();

        match state {
            SystemState::Authorization => {
                // The "authorizing" prompt is already on screen; the
                // blocking portal call happens after.
                let input = self.session().current_input.clone();
                self.request_authorization(&input);
                self.clear_input();
            }
            SystemState::RefuelDataTransmission => {
                // Session data survives so the dispensed volume stays
                // visible in RefuelingComplete.
                self.complete_refueling();
                self.queue.post(Event::DataTransmissionComplete);
            }
            SystemState::IntakeDataTransmission => {
                self.complete_intake_operation();
                self.queue.post(Event::DataTransmissionComplete);
            }
            _ => {}
        }
    }

    // ==========================================
    // Input handling
    // ==========================================

    pub fn handle_key_press(&self, key: KeyCode) {
        debug!(?key, "Key pressed");
        self.machine.update_activity_time();
        let state = self.machine.current_state();

        if let Some(digit) = key.digit() {
            if matches!(
                state,
                SystemState::Waiting
                    | SystemState::RefuelingComplete
                    | SystemState::IntakeComplete
            ) {
                self.session().current_input.clear();
            }
            self.add_digit_to_input(digit);
            if matches!(
                state,
                SystemState::Waiting | SystemState::RefuelingComplete
            ) {
                self.post_event(Event::PinEntryStarted);
            }
            return;
        }

        match key {
            KeyCode::Max => {
                // Max-volume shortcut applies to customers entering a
                // refuel volume; anywhere else the key is ignored.
                if state == SystemState::VolumeEntry
                    && self.session().user.role == UserRole::Customer
                {
                    self.set_max_value();
                }
            }
            KeyCode::Clear => self.remove_last_digit(),
            KeyCode::Start => self.process_numeric_input(),
            KeyCode::Stop => self.post_event(Event::CancelPressed),
            KeyCode::DisplayReset => self.post_event(Event::DisplayReset),
            _ => {}
        }
    }

    pub fn handle_card_presented(&self, uid: &str) {
        info!(uid, "Card presented");
        self.session().current_input = uid.to_string();
        self.post_event(Event::CardPresented);
    }

    fn add_digit_to_input(&self, digit: char) {
        {
            let mut session = self.session();
            if session.current_input.len() >= INPUT_MAX_LEN {
                return;
            }
            session.current_input.push(digit);
        }
        self.post_event(Event::InputUpdated);
    }

    fn remove_last_digit(&self) {
        {
            let mut session = self.session();
            if session.current_input.pop().is_none() {
                return;
            }
        }
        self.post_event(Event::InputUpdated);
    }

    fn clear_input(&self) {
        self.session().current_input.clear();
        self.post_event(Event::InputUpdated);
    }

    /// Clear the buffer without a display refresh, so an error message
    /// on screen is not overwritten.
    fn clear_input_silent(&self) {
        self.session().current_input.clear();
    }

    fn set_max_value(&self) {
        {
            let mut session = self.session();
            session.current_input = (session.user.allowance as i64).to_string();
        }
        self.post_event(Event::InputUpdated);
    }

    fn process_numeric_input(&self) {
        let input = self.session().current_input.clone();
        if input.is_empty() {
            return;
        }

        match self.machine.current_state() {
            SystemState::PinEntry => self.post_event(Event::PinEntered),

            SystemState::TankSelection => {
                let tank: TankNumber = input.parse().unwrap_or(0);
                if tank > 0 && self.is_tank_valid(tank) {
                    self.select_tank(tank);
                } else {
                    self.clear_input();
                }
            }

            SystemState::IntakeDirectionSelection => match input.as_str() {
                "1" => self.select_intake_direction(IntakeDirection::In),
                "2" => self.select_intake_direction(IntakeDirection::Out),
                _ => self.clear_input(),
            },

            SystemState::VolumeEntry => {
                let volume: Volume = input.parse().unwrap_or(0.0);
                if volume > 0.0 {
                    self.enter_volume(volume);
                } else {
                    self.clear_input();
                }
            }

            SystemState::IntakeVolumeEntry => {
                let volume: Volume = input.parse().unwrap_or(0.0);
                if volume > 0.0 {
                    self.enter_intake_volume(volume);
                } else {
                    self.clear_input();
                }
            }

            _ => {}
        }
    }

    // ==========================================
    // Tank and volume operations
    // ==========================================

    /// A cache-authorized session has no tank list from the portal, so
    /// any positive tank number is accepted; online sessions must pick
    /// from the authorized list.
    pub fn is_tank_valid(&self, tank: TankNumber) -> bool {
        let session = self.session();
        if session.authorized_from_cache {
            return tank > 0;
        }
        session.available_tanks.iter().any(|t| t.number == tank)
    }

    fn select_tank(&self, tank: TankNumber) {
        let role = {
            let mut session = self.session();
            session.selected_tank = tank;
            session.user.role
        };
        if role == UserRole::Operator {
            self.post_event(Event::IntakeSelected);
        } else {
            self.post_event(Event::TankSelected);
        }
    }

    fn select_intake_direction(&self, direction: IntakeDirection) {
        self.session().intake_direction = direction;
        self.clear_input();
        self.post_event(Event::IntakeDirectionSelected);
    }

    /// Tank capacity as known to the device. The portal's tank record
    /// carries no capacity, so this is zero (unknown) unless a future
    /// backend provides one.
    fn tank_capacity(&self, _tank: TankNumber) -> Volume {
        0.0
    }

    fn enter_volume(&self, volume: Volume) {
        if volume <= 0.0 {
            self.clear_input();
            return;
        }

        let capacity = self.tank_capacity(self.session().selected_tank);
        if capacity > 0.0 && volume > capacity {
            self.clear_input();
            return;
        }

        {
            let session = self.session();
            if session.user.role == UserRole::Customer && volume > session.user.allowance {
                drop(session);
                self.clear_input();
                return;
            }
        }

        {
            let mut session = self.session();
            session.entered_volume = volume;
            session.target_refuel_volume = volume;
        }
        self.post_event(Event::VolumeEntered);
    }

    fn enter_intake_volume(&self, volume: Volume) {
        if volume <= 0.0 {
            self.clear_input();
            return;
        }
        self.session().entered_volume = volume;
        self.post_event(Event::IntakeVolumeEntered);
    }

    // ==========================================
    // Authorization
    // ==========================================

    fn request_authorization(&self, uid: &str) {
        match self.backend.authorize(uid) {
            Ok(()) => {
                let role = self.backend.role();
                let allowance = self.backend.allowance();
                let price = self.backend.price();
                let tanks = self.backend.fuel_tanks();
                {
                    let mut session = self.session();
                    session.authorized_from_cache = false;
                    session.user = UserInfo {
                        uid: uid.to_string(),
                        role,
                        allowance,
                        price,
                    };
                    session.available_tanks = tanks
                        .iter()
                        .map(|t| TankInfo {
                            number: t.id_tank,
                            name: t.name_tank.clone(),
                        })
                        .collect();
                }

                if let Some(cache_manager) = &self.cache_manager {
                    cache_manager.update(uid, allowance, role.id());
                }

                self.post_event(Event::AuthorizationSuccess);
            }
            Err(err) => {
                // A known user keeps working while the portal is down;
                // the report goes to the backlog instead.
                if err.is_network() {
                    if let Some(store) = &self.store {
                        if let Ok(Some(entry)) = store.cache_get(uid) {
                            warn!(uid, "Authorized from cache due to network error");
                            let mut session = self.session();
                            session.authorized_from_cache = true;
                            session.user = UserInfo {
                                uid: entry.uid,
                                role: UserRole::from_id(entry.role_id),
                                allowance: entry.allowance,
                                price: 0.0,
                            };
                            session.available_tanks.clear();
                            drop(session);
                            self.post_event(Event::AuthorizationSuccess);
                            return;
                        }
                    }
                }

                warn!(uid, error = %err, "Authorization failed");
                self.set_last_error(&err.display_text());
                self.post_event(Event::AuthorizationFailed);
            }
        }
    }

    // ==========================================
    // Pump and meter orchestration
    // ==========================================

    pub fn handle_pump_state_changed(&self, is_running: bool) {
        info!(is_running, "Pump state changed");

        if is_running {
            {
                let mut flow = self.flow.lock().expect("lock poisoned");
                flow.pump_running = true;
                flow.no_flow_posted = false;
                flow.last_flow_update = Instant::now();
            }
            if let Some(meter) = self
                .peripherals
                .flow_meter
                .lock()
                .expect("lock poisoned")
                .as_mut()
            {
                meter.reset_counter();
                meter.start_measurement();
            }
        } else {
            {
                let mut flow = self.flow.lock().expect("lock poisoned");
                flow.pump_running = false;
                flow.no_flow_posted = false;
            }
            if let Some(meter) = self
                .peripherals
                .flow_meter
                .lock()
                .expect("lock poisoned")
                .as_mut()
            {
                meter.stop_measurement();
            }
            self.post_event(Event::RefuelingStopped);
        }
    }

    pub fn handle_flow_update(&self, volume: Volume) {
        let target = {
            let mut session = self.session();
            session.current_refuel_volume = volume;
            session.target_refuel_volume
        };

        self.flow.lock().expect("lock poisoned").last_flow_update = Instant::now();

        if target > 0.0 && volume >= target {
            if let Some(pump) = self
                .peripherals
                .pump
                .lock()
                .expect("lock poisoned")
                .as_mut()
            {
                pump.stop();
            }
        }

        self.post_event(Event::InputUpdated);
    }

    fn start_refueling(&self) {
        if let Some(pump) = self
            .peripherals
            .pump
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            pump.start();
        }
        self.post_event(Event::RefuelingStarted);
    }

    fn stop_refueling(&self) {
        if let Some(pump) = self
            .peripherals
            .pump
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            pump.stop();
        }
        self.post_event(Event::RefuelingStopped);
    }

    // ==========================================
    // Transaction reporting
    // ==========================================

    fn complete_refueling(&self) {
        let (transaction, from_cache, role) = {
            let session = self.session();
            (
                RefuelTransaction {
                    user_id: session.user.uid.clone(),
                    tank_number: session.selected_tank,
                    volume: session.current_refuel_volume,
                    timestamp_ms: now_unix_ms(),
                },
                session.authorized_from_cache,
                session.user.role,
            )
        };

        self.log_refuel_transaction(&transaction, from_cache, role);

        // Close the portal session; the dispensed volume stays in the
        // controller session for the completion screen.
        if !from_cache && self.backend.is_authorized() {
            self.backend.deauthorize();
        }
    }

    fn log_refuel_transaction(&self, tx: &RefuelTransaction, from_cache: bool, role: UserRole) {
        if from_cache {
            let Some(store) = &self.store else {
                error!("Cache-authorized refuel with no storage attached");
                return;
            };
            let payload = serde_json::json!({
                "TankNumber": tx.tank_number,
                "FuelVolume": tx.volume,
                "TimeAt": tx.timestamp_ms,
            });
            if let Err(err) =
                store.add_backlog(&tx.user_id, MessageMethod::Refuel, &payload.to_string())
            {
                error!(uid = %tx.user_id, error = %err, "Failed to save offline refuel report");
            }
            if role == UserRole::Customer {
                if let Some(cache_manager) = &self.cache_manager {
                    cache_manager.deduct(&tx.user_id, tx.volume);
                }
            }
            return;
        }

        // The backend itself records a failed report into the backlog or
        // dead queue depending on the error class.
        let _ = self.backend.refuel(tx.tank_number, tx.volume);
        if role == UserRole::Customer {
            if let Some(cache_manager) = &self.cache_manager {
                cache_manager.deduct(&tx.user_id, tx.volume);
            }
        }
    }

    fn complete_intake_operation(&self) {
        let (transaction, from_cache) = {
            let session = self.session();
            (
                IntakeTransaction {
                    operator_id: session.user.uid.clone(),
                    tank_number: session.selected_tank,
                    volume: session.entered_volume,
                    direction: session.intake_direction,
                    timestamp_ms: now_unix_ms(),
                },
                session.authorized_from_cache,
            )
        };
        self.log_intake_transaction(&transaction, from_cache);
    }

    fn log_intake_transaction(&self, tx: &IntakeTransaction, from_cache: bool) {
        if from_cache {
            let Some(store) = &self.store else {
                error!("Cache-authorized intake with no storage attached");
                return;
            };
            let payload = serde_json::json!({
                "TankNumber": tx.tank_number,
                "IntakeVolume": tx.volume,
                "Direction": tx.direction.wire_value(),
                "TimeAt": tx.timestamp_ms,
            });
            if let Err(err) =
                store.add_backlog(&tx.operator_id, MessageMethod::Intake, &payload.to_string())
            {
                error!(uid = %tx.operator_id, error = %err, "Failed to save offline intake report");
            }
            return;
        }

        let _ = self
            .backend
            .intake(tx.tank_number, tx.volume, tx.direction);
    }

    // ==========================================
    // Session teardown
    // ==========================================

    fn end_current_session(&self) {
        let from_cache = self.session().authorized_from_cache;
        self.reset_session_data();
        self.clear_input_silent();

        if let Some(pump) = self
            .peripherals
            .pump
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            if pump.is_running() {
                pump.stop();
            }
        }
        if let Some(meter) = self
            .peripherals
            .flow_meter
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            meter.stop_measurement();
        }

        // A cache-authorized session never had a portal token to give
        // back.
        if !from_cache && self.backend.is_authorized() {
            self.backend.deauthorize();
        }
    }

    fn reset_session_data(&self) {
        *self.session() = SessionData::default();
    }

    // ==========================================
    // Display
    // ==========================================

    fn update_display(&self) {
        let state = self.machine.current_state();
        let message = {
            let session = self.session();
            let last_error = self.last_error.lock().expect("lock poisoned").clone();
            let time_string = current_time_string();
            let ctx = DisplayContext {
                user: &session.user,
                available_tanks: &session.available_tanks,
                selected_tank: session.selected_tank,
                entered_volume: session.entered_volume,
                current_input: &session.current_input,
                intake_direction: session.intake_direction,
                current_refuel_volume: session.current_refuel_volume,
                last_error: &last_error,
                time_string: &time_string,
                device_serial: &self.config.controller_id,
            };
            display_message(state, &ctx)
        };
        self.show_message(&message);
    }

    fn show_message(&self, message: &DisplayMessage) {
        if let Some(display) = self
            .peripherals
            .display
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            display.show(message);
        }
    }

    fn reinitialize_display(&self) {
        info!("Display reset requested");
        let ok = {
            let mut display = self.peripherals.display.lock().expect("lock poisoned");
            match display.as_mut() {
                Some(display) => {
                    display.shutdown();
                    display.initialize().is_ok()
                }
                None => return,
            }
        };
        if ok {
            self.update_display();
            info!("Display reinitialized");
        } else {
            error!("Failed to reinitialize display");
        }
    }

    fn enable_card_reading(&self, enabled: bool) {
        if let Some(reader) = self
            .peripherals
            .card_reader
            .lock()
            .expect("lock poisoned")
            .as_mut()
        {
            reader.enable_reading(enabled);
            debug!(enabled, "Card reading");
        }
    }

    fn set_last_error(&self, message: &str) {
        *self.last_error.lock().expect("lock poisoned") = message.to_string();
    }

    // ==========================================
    // No-flow watchdog
    // ==========================================

    fn start_no_flow_monitor(&self) {
        if self.watchdog_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak_self.lock().expect("lock poisoned").clone();
        let running = Arc::clone(&self.watchdog_running);

        let handle = std::thread::Builder::new()
            .name("no-flow-monitor".to_string())
            .spawn(move || {
                debug!("No-flow monitor started");
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(200));
                    let Some(controller) = weak.upgrade() else {
                        break;
                    };

                    let should_cancel = {
                        let mut flow = controller.flow.lock().expect("lock poisoned");
                        if flow.pump_running
                            && !flow.no_flow_posted
                            && flow.last_flow_update.elapsed() >= controller.config.no_flow_timeout
                        {
                            flow.no_flow_posted = true;
                            true
                        } else {
                            false
                        }
                    };

                    if should_cancel
                        && controller.machine.current_state() == SystemState::Refueling
                    {
                        warn!("Pump running without flow, cancelling refueling");
                        controller.queue.post(Event::CancelNoFuel);
                    }
                }
                debug!("No-flow monitor stopped");
            })
            .expect("failed to spawn no-flow monitor");
        *self.watchdog.lock().expect("lock poisoned") = Some(handle);
    }

    fn stop_no_flow_monitor(&self) {
        if !self.watchdog_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.watchdog.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }

    // ==========================================
    // Observers
    // ==========================================

    pub fn current_state(&self) -> SystemState {
        self.machine.current_state()
    }

    pub fn current_input(&self) -> String {
        self.session().current_input.clone()
    }

    pub fn current_user(&self) -> UserInfo {
        self.session().user.clone()
    }

    pub fn available_tanks(&self) -> Vec<TankInfo> {
        self.session().available_tanks.clone()
    }

    pub fn selected_tank(&self) -> TankNumber {
        self.session().selected_tank
    }

    pub fn entered_volume(&self) -> Volume {
        self.session().entered_volume
    }

    pub fn current_refuel_volume(&self) -> Volume {
        self.session().current_refuel_volume
    }

    pub fn authorized_from_cache(&self) -> bool {
        self.session().authorized_from_cache
    }

    pub fn last_error_message(&self) -> String {
        self.last_error.lock().expect("lock poisoned").clone()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_no_flow_monitor();
    }
}

fn current_time_string() -> String {
    chrono::Local::now().format("%H:%M %d.%m.%Y").to_string()
}
