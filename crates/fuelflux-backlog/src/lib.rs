//! Backlog worker: redelivers stored transactions when connectivity
//! returns.
//!
//! A single thread wakes on an interval and drains the backlog in FIFO
//! order. For each item it authorizes as the transaction's owner, replays
//! the stored payload, and deauthorizes. A network error anywhere stops
//! the pass and leaves the item in place for the next round, while an
//! application error is terminal and moves the item to the dead queue.
//!
//! Exactly-once is not attempted; the portal deduplicates on its side.

use fuelflux_backend::Backend;
use fuelflux_core::MessageMethod;
use fuelflux_store::{MessageStore, StoredMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default pause between drain passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Background drainer of the durable backlog.
pub struct BacklogWorker {
    storage: Arc<MessageStore>,
    backend: Arc<dyn Backend>,
    interval: Duration,
    running: Arc<AtomicBool>,
    gate: Arc<(Mutex<()>, Condvar)>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BacklogWorker {
    pub fn new(storage: Arc<MessageStore>, backend: Arc<dyn Backend>, interval: Duration) -> Self {
        Self {
            storage,
            backend,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            gate: Arc::new((Mutex::new(()), Condvar::new())),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread. No-op when already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let storage = Arc::clone(&self.storage);
        let backend = Arc::clone(&self.backend);
        let interval = self.interval;
        let running = Arc::clone(&self.running);
        let gate = Arc::clone(&self.gate);

        let handle = std::thread::Builder::new()
            .name("backlog-worker".to_string())
            .spawn(move || {
                info!("Backlog worker started");
                while running.load(Ordering::SeqCst) {
                    let _ = drain_backlog(&storage, backend.as_ref());
                    let (lock, cv) = &*gate;
                    let guard = lock.lock().expect("lock poisoned");
                    let _ = cv.wait_timeout(guard, interval).expect("lock poisoned");
                }
                info!("Backlog worker stopped");
            })
            .expect("failed to spawn backlog worker");
        *self.worker.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stop the worker thread. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.gate.1.notify_all();
        if let Some(handle) = self.worker.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one drain pass synchronously.
    ///
    /// Returns `true` when the backlog is empty afterwards, `false` when
    /// the pass stopped early on a network error.
    pub fn process_once(&self) -> bool {
        drain_backlog(&self.storage, self.backend.as_ref())
    }
}

impl Drop for BacklogWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_backlog(storage: &MessageStore, backend: &dyn Backend) -> bool {
    loop {
        let item = match storage.next_backlog() {
            Ok(Some(item)) => item,
            Ok(None) => return true,
            Err(err) => {
                error!(error = %err, "Failed to read backlog");
                return false;
            }
        };

        if !process_item(storage, backend, &item) {
            return false;
        }
    }
}

/// Deliver one backlog item. Returns `false` when the pass must stop.
fn process_item(storage: &MessageStore, backend: &dyn Backend, item: &StoredMessage) -> bool {
    debug!(id = item.id, uid = %item.uid, method = item.method.as_str(), "Resending backlog item");

    if let Err(err) = backend.authorize(&item.uid) {
        if err.is_network() {
            debug!(uid = %item.uid, "Portal unreachable, leaving backlog for next pass");
            return false;
        }
        // The portal refused the owner outright: the item can never be
        // delivered under this uid.
        warn!(uid = %item.uid, error = %err, "Backlog owner rejected, moving item to dead queue");
        if let Err(store_err) = storage.add_dead(&item.uid, item.method, &item.data) {
            error!(error = %store_err, "Failed to record dead message");
        }
        if let Err(store_err) = storage.remove_backlog(item.id) {
            error!(error = %store_err, "Failed to remove backlog item");
            return false;
        }
        backend.deauthorize();
        return true;
    }

    let sent = match item.method {
        MessageMethod::Refuel => backend.refuel_payload(&item.data),
        MessageMethod::Intake => backend.intake_payload(&item.data),
    };

    let mut stop_pass = false;
    match sent {
        Ok(()) => {
            if let Err(store_err) = storage.remove_backlog(item.id) {
                error!(error = %store_err, "Failed to remove delivered backlog item");
                stop_pass = true;
            } else {
                info!(id = item.id, uid = %item.uid, "Backlog item delivered");
            }
        }
        Err(err) if err.is_network() => {
            debug!(uid = %item.uid, "Portal unreachable mid-item, will retry");
            stop_pass = true;
        }
        Err(err) => {
            warn!(uid = %item.uid, error = %err, "Portal rejected backlog item, moving to dead queue");
            if let Err(store_err) = storage.add_dead(&item.uid, item.method, &item.data) {
                error!(error = %store_err, "Failed to record dead message");
            }
            if let Err(store_err) = storage.remove_backlog(item.id) {
                error!(error = %store_err, "Failed to remove rejected backlog item");
                stop_pass = true;
            }
        }
    }

    backend.deauthorize();
    !stop_pass
}
