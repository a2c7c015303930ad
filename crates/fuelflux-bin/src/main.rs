//! FuelFlux pump controller binary.
//!
//! Wires the store, backends, cache manager, backlog worker, and
//! controller together and runs the event loop until a termination
//! signal arrives. Peripheral drivers are attached here; this build uses
//! the simulation set, which integration swaps for hardware drivers.

use anyhow::Context;
use clap::Parser;
use fuelflux_backend::HttpBackend;
use fuelflux_backlog::BacklogWorker;
use fuelflux_cache::{CacheManager, CacheManagerConfig};
use fuelflux_controller::{Controller, ControllerConfig};
use fuelflux_core::{init_logging, Config};
use fuelflux_executor::BoundedExecutor;
use fuelflux_peripherals::sim::{SimCardReader, SimDisplay, SimFlowMeter, SimKeyboard, SimPump};
use fuelflux_store::MessageStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Deauthorize executor sizing: one worker is enough for a device that
/// closes at most one session at a time.
const DEAUTH_WORKERS: usize = 1;
const DEAUTH_QUEUE: usize = 100;

/// FuelFlux pump controller.
#[derive(Parser)]
#[command(name = "fuelflux")]
#[command(about = "Fuel dispensing controller")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "fuelflux/config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Controller UID override.
    #[arg(long, env = "FUELFLUX_CONTROLLER_ID")]
    controller_id: Option<String>,

    /// Portal base URL override.
    #[arg(long)]
    backend_url: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = Config::load(&cli.config).context("failed to load configuration")?;
    if let Some(controller_id) = cli.controller_id {
        config.controller_uid = controller_id;
    }
    if let Some(backend_url) = cli.backend_url {
        config.backend_url = backend_url;
    }

    info!(
        controller_uid = %config.controller_uid,
        backend_url = %config.backend_url,
        "Starting FuelFlux"
    );

    let store = Arc::new(
        MessageStore::open(std::path::Path::new(&config.storage_db_path))
            .context("failed to open storage database")?,
    );

    let executor = Arc::new(BoundedExecutor::new(DEAUTH_WORKERS, DEAUTH_QUEUE));

    // Three backend instances, one session each: the user-facing one,
    // the cache manager's synchronization session, and the backlog
    // worker's per-item sessions.
    let user_backend = Arc::new(
        HttpBackend::new(
            &config.backend_url,
            &config.controller_uid,
            Some(Arc::clone(&store)),
            Some(Arc::clone(&executor)),
        )
        .map_err(|e| anyhow::anyhow!("backend setup failed: {e}"))?,
    );
    let sync_backend = Arc::new(
        HttpBackend::new(
            &config.backend_url,
            &config.controller_uid,
            None,
            Some(Arc::clone(&executor)),
        )
        .map_err(|e| anyhow::anyhow!("backend setup failed: {e}"))?,
    );
    let backlog_backend = Arc::new(
        HttpBackend::new(
            &config.backend_url,
            &config.controller_uid,
            None,
            Some(Arc::clone(&executor)),
        )
        .map_err(|e| anyhow::anyhow!("backend setup failed: {e}"))?,
    );

    let cache_manager = Arc::new(CacheManager::new(
        Arc::clone(&store),
        sync_backend,
        CacheManagerConfig::default(),
    ));

    let backlog_worker = BacklogWorker::new(
        Arc::clone(&store),
        backlog_backend,
        Duration::from_secs(config.backlog_interval_secs),
    );

    let mut controller_config = ControllerConfig::new(config.controller_uid.clone());
    controller_config.no_flow_timeout = Duration::from_secs(config.no_flow_timeout_secs);
    let controller = Controller::new(
        controller_config,
        user_backend,
        Some(Arc::clone(&store)),
        Some(cache_manager),
    );

    controller.set_display(Box::new(SimDisplay::new()));
    controller.set_keyboard(Box::new(SimKeyboard::new()));
    controller.set_card_reader(Box::new(SimCardReader::new()));
    controller.set_pump(Box::new(SimPump::new()));
    controller.set_flow_meter(Box::new(SimFlowMeter::new()));

    controller.initialize();
    backlog_worker.start();

    let terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&terminate))
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminate))
        .context("failed to register SIGTERM handler")?;

    let loop_controller = Arc::clone(&controller);
    let event_loop = std::thread::Builder::new()
        .name("event-loop".to_string())
        .spawn(move || loop_controller.run())
        .context("failed to spawn event loop")?;

    while !terminate.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Termination signal received");
    backlog_worker.stop();
    controller.shutdown();
    executor.shutdown();
    let _ = event_loop.join();

    info!("FuelFlux stopped");
    Ok(())
}
