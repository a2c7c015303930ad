//! User allowance cache manager.
//!
//! Keeps the local cardholder cache fresh so known users can still be
//! served while the portal is unreachable. A single background worker
//! populates the cache on start, then daily at the configured hour (or
//! sooner after a failure), and can be triggered on demand. Per-refuel
//! deductions and per-authorization updates go straight to the active
//! table.
//!
//! The manager owns a dedicated backend instance: the synchronization
//! session's token must never collide with a concurrent user session on
//! the user-facing backend.

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, TimeZone, Utc};
use fuelflux_backend::Backend;
use fuelflux_core::UserRole;
use fuelflux_store::MessageStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for population cadence.
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// Local hour of the daily population.
    pub update_hour: u32,
    /// Delay before retrying a failed population.
    pub retry_interval: Duration,
    /// Page size for `fetch_cards`.
    pub fetch_batch_size: u32,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            update_hour: 2,
            retry_interval: Duration::from_secs(60 * 60),
            fetch_batch_size: 100,
        }
    }
}

struct Shared {
    trigger: bool,
    next_scheduled: DateTime<Local>,
    last_success: bool,
    last_population_time: Option<DateTime<Utc>>,
}

/// Background manager of the user allowance cache.
pub struct CacheManager {
    cache: Arc<MessageStore>,
    backend: Arc<dyn Backend>,
    config: CacheManagerConfig,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Create a manager over the given cache store and dedicated backend.
    pub fn new(
        cache: Arc<MessageStore>,
        backend: Arc<dyn Backend>,
        config: CacheManagerConfig,
    ) -> Self {
        let next = next_daily_update(config.update_hour);
        Self {
            cache,
            backend,
            config,
            shared: Arc::new((
                Mutex::new(Shared {
                    trigger: false,
                    next_scheduled: next,
                    last_success: false,
                    last_population_time: None,
                }),
                Condvar::new(),
            )),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread and trigger an immediate population.
    ///
    /// Returns `false` when already running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let cache = Arc::clone(&self.cache);
        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);

        let handle = std::thread::Builder::new()
            .name("cache-manager".to_string())
            .spawn(move || {
                worker_loop(&cache, backend.as_ref(), &config, &shared, &running, &shutdown)
            })
            .expect("failed to spawn cache manager worker");
        *self.worker.lock().expect("lock poisoned") = Some(handle);

        self.trigger_population();
        true
    }

    /// Stop the worker thread. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.shared.1.notify_all();
        if let Some(handle) = self.worker.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Request an immediate population.
    pub fn trigger_population(&self) {
        let (lock, cv) = &*self.shared;
        lock.lock().expect("lock poisoned").trigger = true;
        cv.notify_one();
    }

    /// Whether the most recent population succeeded.
    pub fn last_population_success(&self) -> bool {
        self.shared.0.lock().expect("lock poisoned").last_success
    }

    /// When the most recent population finished, if any.
    pub fn last_population_time(&self) -> Option<DateTime<Utc>> {
        self.shared
            .0
            .lock()
            .expect("lock poisoned")
            .last_population_time
    }

    /// Upsert one user in the active cache table.
    pub fn update(&self, uid: &str, allowance: f64, role_id: i64) -> bool {
        match self.cache.cache_update(uid, allowance, role_id) {
            Ok(()) => true,
            Err(err) => {
                error!(uid, error = %err, "Cache update failed");
                false
            }
        }
    }

    /// Deduct dispensed volume from a cached allowance, clamped at zero.
    ///
    /// A missing uid is a no-op.
    pub fn deduct(&self, uid: &str, amount: f64) -> bool {
        let entry = match self.cache.cache_get(uid) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(uid, "Deduct skipped: uid not cached");
                return false;
            }
            Err(err) => {
                error!(uid, error = %err, "Cache read failed");
                return false;
            }
        };
        let new_allowance = (entry.allowance - amount).max(0.0);
        self.update(uid, new_allowance, entry.role_id)
    }

    /// Run one population synchronously. Exposed for tests and tooling;
    /// the worker thread uses the same code path.
    pub fn populate_once(&self) -> bool {
        populate(
            &self.cache,
            self.backend.as_ref(),
            &self.config,
            &self.shutdown,
        )
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    cache: &MessageStore,
    backend: &dyn Backend,
    config: &CacheManagerConfig,
    shared: &(Mutex<Shared>, Condvar),
    running: &AtomicBool,
    shutdown: &AtomicBool,
) {
    info!("Cache manager worker started");
    let (lock, cv) = shared;

    while running.load(Ordering::SeqCst) {
        {
            let mut state = lock.lock().expect("lock poisoned");
            while !state.trigger && running.load(Ordering::SeqCst) {
                let now = Local::now();
                if now >= state.next_scheduled {
                    break;
                }
                let wait = (state.next_scheduled - now)
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                let (guard, _) = cv
                    .wait_timeout(state, wait)
                    .expect("lock poisoned");
                state = guard;
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }
            state.trigger = false;
        }

        info!("Starting cache population");
        let success = populate(cache, backend, config, shutdown);

        let mut state = lock.lock().expect("lock poisoned");
        state.last_population_time = Some(Utc::now());
        state.last_success = success;
        if success {
            state.next_scheduled = next_daily_update(config.update_hour);
            info!(next = %state.next_scheduled, "Cache population completed");
        } else {
            state.next_scheduled = Local::now()
                + ChronoDuration::from_std(config.retry_interval)
                    .unwrap_or_else(|_| ChronoDuration::minutes(60));
            warn!(next = %state.next_scheduled, "Cache population failed, retry scheduled");
        }
    }

    info!("Cache manager worker stopped");
}

/// Run a population end to end.
///
/// Opens a synchronization session as the controller's own UID, verifies
/// the controller role, pages through the cardholder list into the
/// standby table, and commits the flip. Every failure path aborts the
/// population and best-effort deauthorizes.
fn populate(
    cache: &MessageStore,
    backend: &dyn Backend,
    config: &CacheManagerConfig,
    shutdown: &AtomicBool,
) -> bool {
    let controller_uid = backend.controller_uid();
    if controller_uid.is_empty() {
        error!("Controller UID not available");
        return false;
    }

    info!(controller_uid, "Opening synchronization session");
    if let Err(err) = backend.authorize(&controller_uid) {
        error!(error = %err, "Failed to open synchronization session");
        return false;
    }

    if backend.role() != UserRole::Controller {
        error!(
            role = backend.role().id(),
            "Synchronization session returned wrong role (expected controller)"
        );
        backend.deauthorize();
        return false;
    }

    if let Err(err) = cache.begin_population() {
        error!(error = %err, "Failed to begin cache population");
        backend.deauthorize();
        return false;
    }

    let batch = config.fetch_batch_size;
    let mut first = 0u32;
    let mut total = 0usize;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            warn!("Cache population interrupted by shutdown");
            cache.abort_population();
            backend.deauthorize();
            return false;
        }

        debug!(first, batch, "Fetching user cards");
        let cards = match backend.fetch_cards(first, batch) {
            Ok(cards) => cards,
            Err(err) => {
                error!(error = %err, "Failed to fetch user cards");
                cache.abort_population();
                backend.deauthorize();
                return false;
            }
        };

        if cards.is_empty() {
            break;
        }

        for card in &cards {
            if let Err(err) = cache.add_population_entry(&card.uid, card.allowance, card.role_id)
            {
                error!(uid = %card.uid, error = %err, "Failed to add cache entry");
                cache.abort_population();
                backend.deauthorize();
                return false;
            }
        }

        total += cards.len();
        if (cards.len() as u32) < batch {
            break;
        }
        first += batch;
    }

    if let Err(err) = cache.commit_population() {
        error!(error = %err, "Failed to commit cache population");
        backend.deauthorize();
        return false;
    }

    info!(total, "Cache population loaded");

    // Best effort: the portal ages the session out if this fails.
    backend.deauthorize();
    true
}

/// Next occurrence of `hour:00` local time, strictly in the future.
///
/// Falls back to now + 24 h when the local-time conversion fails (DST
/// gaps and similar).
fn next_daily_update(hour: u32) -> DateTime<Local> {
    let now = Local::now();
    let today = now.date_naive();
    let target = today
        .and_hms_opt(hour, 0, 0)
        .map(|naive| Local.from_local_datetime(&naive));

    match target {
        Some(LocalResult::Single(target)) | Some(LocalResult::Ambiguous(target, _)) => {
            if target <= now {
                target + ChronoDuration::hours(24)
            } else {
                target
            }
        }
        _ => now + ChronoDuration::hours(24),
    }
}
