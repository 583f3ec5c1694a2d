//! TinyBMS ⇄ Victron CAN gateway — main entry point.
//!
//! Hexagonal architecture: adapters on the outside, [`gateway::app`]'s pure
//! logic on the inside.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Adapters (outer ring)                      │
//! │                                                                  │
//! │  Esp32UartAdapter   Esp32TwaiAdapter   Persistence   Esp32Time    │
//! │  (SerialPort)       (CanPort)          (NVS)         (TimePort)  │
//! │                                                                  │
//! │  ──────────────────── Port trait boundary ───────────────────    │
//! │                                                                  │
//! │  serial_worker ──▶ poller_worker ──▶ RegisterCache ──▶ publisher_worker │
//! │  (SerialEngine)     (poll schedule)                   (GatewayService) │
//! │                                                                  │
//! │  config worker: Arc<ConfigManager>, served in-process            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};

use gateway::adapters::can_twai::Esp32TwaiAdapter;
use gateway::adapters::serial_uart::Esp32UartAdapter;
use gateway::adapters::time::Esp32TimeAdapter;
use gateway::app::service::GatewayService;
use gateway::cache::poller::{PollBlock, Poller};
use gateway::cache::RegisterCache;
use gateway::config::ConfigManager;
use gateway::events::EventBus;
use gateway::persistence::Persistence;
use gateway::registers::table::{EVENT_LOG_BASE, EVENT_LOG_SLOTS};
use gateway::registers::RegisterDescriptor;
use gateway::serial::SerialEngine;
use gateway::worker::{run_poller_worker, run_publisher_worker, run_serial_worker};

/// The full set of descriptors the cache indexes, built once at process
/// init from `registers::table::all_descriptors` — the single source of
/// truth, so a register added there is automatically indexed and (via
/// `POLL_BLOCKS` below) reachable.
fn register_table() -> &'static [RegisterDescriptor] {
    static TABLE: std::sync::OnceLock<Vec<RegisterDescriptor>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| gateway::registers::table::all_descriptors().iter().copied().collect())
}

/// The blocks the poller reads every cycle: live data (cells, pack V/I,
/// SoC, online status), statistics (temperatures, cell extrema, SoH),
/// the event log and the version/identity block. Settings (300–343) are
/// not polled continuously — they're write-mostly configuration, read
/// once via `cache::write_register`'s read-back or at `load_defaults`.
static POLL_BLOCKS: &[PollBlock] = &[
    PollBlock { start_addr: 0, count: 56 },
    PollBlock { start_addr: 100, count: 5 },
    PollBlock { start_addr: EVENT_LOG_BASE, count: EVENT_LOG_SLOTS * 2 },
    PollBlock { start_addr: 500, count: 10 },
];

fn main() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("tinybms-victron-gateway v{}", env!("CARGO_PKG_VERSION"));

    let persistence = Arc::new(Persistence::new()?);
    let events = Arc::new(EventBus::new());
    let config = Arc::new(ConfigManager::new(persistence.clone(), events.clone()));
    let time = Arc::new(Esp32TimeAdapter::new());

    let snapshot = config.snapshot();
    info!("device: {}, uart poll {}ms, can publish {}ms", snapshot.device.name, snapshot.uart.poll_interval_ms, snapshot.can.publisher.period_ms);

    let cache = Arc::new(RegisterCache::new(register_table()));
    cache.load_defaults();

    let peripherals = esp_idf_hal::peripherals::Peripherals::take()?;
    let uart = Esp32UartAdapter::new(peripherals.uart1, peripherals.pins.gpio17, peripherals.pins.gpio16)?;
    let can = Esp32TwaiAdapter::new(peripherals.can, peripherals.pins.gpio4, peripherals.pins.gpio5)?;

    let serial_engine = SerialEngine::new(uart, std::time::Duration::from_millis(200));
    let (serial_tx, serial_rx) = crossbeam_channel::bounded(8);

    let poller = Arc::new(Poller::new(POLL_BLOCKS));
    poller.set_poll_interval_ms(snapshot.uart.poll_interval_ms);

    let service = Arc::new(GatewayService::new(cache.clone(), config.clone(), persistence.clone(), events.clone()));

    let stop = Arc::new(AtomicBool::new(false));

    let serial_thread = {
        let stop = stop.clone();
        std::thread::Builder::new().name("serial_worker".into()).spawn(move || run_serial_worker(serial_engine, serial_rx, stop))?
    };

    let poller_thread = {
        let cache = cache.clone();
        let events = events.clone();
        let time = time.clone();
        let stop = stop.clone();
        let poller = poller.clone();
        std::thread::Builder::new().name("poller_worker".into()).spawn(move || run_poller_worker(cache, events, poller, serial_tx, time, stop))?
    };

    let publisher_thread = {
        let service = service.clone();
        let time = time.clone();
        let stop = stop.clone();
        let period_ms = snapshot.can.publisher.period_ms;
        std::thread::Builder::new().name("publisher_worker".into()).spawn(move || run_publisher_worker(service, can, time, period_ms, stop))?
    };

    info!("system ready — three workers running, config/API served in-process");

    // The config worker needs no dedicated thread: `Arc<ConfigManager>` is
    // already held by this main task and can be called synchronously by
    // any future in-process caller (tests, an operator-facing collaborator).
    // Block here; a real shutdown signal (SIGTERM-equivalent on ESP-IDF, a
    // watchdog-fed reset request) would flip `stop` before joining.
    if serial_thread.join().is_err() {
        warn!("serial worker panicked");
    }
    if poller_thread.join().is_err() {
        warn!("poller worker panicked");
    }
    if publisher_thread.join().is_err() {
        warn!("publisher worker panicked");
    }

    Ok(())
}
