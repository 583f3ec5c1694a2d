//! The four cooperating execution contexts the main loop wires up:
//! `serial_worker`, `poller_worker`, `publisher_worker`, plus the
//! in-process config/API surface `ConfigManager` already provides without a
//! dedicated thread.
//!
//! Each thread owns exactly one piece of hardware state; everything else
//! crosses thread boundaries only through `Arc`, a bounded/timed channel, or
//! the event bus — no shared `&mut`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::app::ports::CanPort;
use crate::app::service::GatewayService;
use crate::cache::poller::Poller;
use crate::cache::RegisterCache;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::serial::{SerialEngine, SerialPort};

/// A read request the poller hands to the serial worker. The reply travels
/// back over a one-shot bounded channel so the poller can block on exactly
/// the exchange it issued.
pub struct SerialRequest {
    pub start_addr: u16,
    pub count: u16,
    pub reply: Sender<Result<heapless::Vec<u8, 254>>>,
}

/// Owns the `SerialPort`/`SerialEngine` exclusively. Drains `rx` until
/// `stop` is set, running each request's read exchange in turn — the BMS
/// protocol is inherently one-exchange-at-a-time, so a single owning thread
/// is the correct model, not an artificial restriction.
pub fn run_serial_worker<P: SerialPort>(mut engine: SerialEngine<P>, rx: Receiver<SerialRequest>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(req) => {
                let result = engine.read(req.start_addr, req.count);
                let _ = req.reply.send(result);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Ticks the poll schedule and submits `SerialRequest`s, applying successful
/// reads to `cache` (which publishes `bms_register_updated` itself).
pub fn run_poller_worker(
    cache: Arc<RegisterCache>,
    events: Arc<EventBus>,
    poller: Arc<Poller>,
    serial_tx: Sender<SerialRequest>,
    time: Arc<crate::adapters::time::Esp32TimeAdapter>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let now_ms = time.uptime_us() / 1000;
        let reply_timeout = Duration::from_millis(500);
        let result = poller.tick(now_ms, &cache, &events, &mut |start_addr, count| {
            let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
            serial_tx
                .send_timeout(SerialRequest { start_addr, count, reply: reply_tx }, reply_timeout)
                .map_err(|_| Error::ResourceExhausted)?;
            reply_rx.recv_timeout(reply_timeout).map_err(|_| Error::SerialTimeout)?
        });
        if let Err(e) = result {
            log::warn!("poll cycle failed: {e}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Drives one CVL + PGN-encode + CAN-publish cycle per `period_ms`, forever
/// (subscription to `bms_register_updated` is implicit: every cycle reads
/// whatever the cache currently holds, so a BMS update that lands between
/// cycles is picked up on the next one rather than triggering an
/// out-of-band publish).
pub fn run_publisher_worker<C: CanPort>(
    service: Arc<GatewayService>,
    mut can: C,
    time: Arc<crate::adapters::time::Esp32TimeAdapter>,
    period_ms: u32,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        let now_ms = (time.uptime_us() / 1000) as u32;
        if let Err(e) = service.run_cycle(now_ms, &mut can) {
            log::warn!("publish cycle failed: {e}");
        }
        std::thread::sleep(Duration::from_millis(period_ms.max(10) as u64));
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::adapters::can_twai::RecordingCan;
    use crate::adapters::time::Esp32TimeAdapter;
    use crate::app::service::GatewayService;
    use crate::cache::poller::PollBlock;
    use crate::config::ConfigManager;
    use crate::crc16::{crc16, to_wire_bytes};
    use crate::persistence::Persistence;
    use crate::registers::table::LIVE_DATA;
    use std::sync::atomic::AtomicBool;

    /// A `SerialPort` that always answers a fixed read response, used to
    /// exercise the request/reply channel the serial and poller workers
    /// share.
    struct FixedReplyPort {
        payload: Vec<u8>,
    }

    impl crate::serial::SerialPort for FixedReplyPort {
        fn write_frame(&mut self, _frame: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut frame = vec![0xAA, 0x03, self.payload.len() as u8];
            frame.extend_from_slice(&self.payload);
            let crc = crc16(&frame);
            frame.extend_from_slice(&to_wire_bytes(crc));
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
    }

    #[test]
    fn serial_worker_answers_requests_until_stopped() {
        let port = FixedReplyPort { payload: vec![0x8C, 0x05] };
        let engine = SerialEngine::new(port, Duration::from_millis(50));
        let (tx, rx) = crossbeam_channel::bounded::<SerialRequest>(4);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || run_serial_worker(engine, rx, stop))
        };

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        tx.send(SerialRequest { start_addr: 50, count: 1, reply: reply_tx }).unwrap();
        let payload = reply_rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&payload[..], &[0x8C, 0x05]);

        stop.store(true, Ordering::Relaxed);
        drop(tx);
        handle.join().unwrap();
    }

    #[test]
    fn publisher_worker_stops_promptly_when_flagged() {
        let persistence = Arc::new(Persistence::new().unwrap());
        let events = Arc::new(EventBus::new());
        let config = Arc::new(ConfigManager::new(persistence.clone(), events.clone()));
        let cache = Arc::new(RegisterCache::new(LIVE_DATA));
        cache.load_defaults();
        let service = Arc::new(GatewayService::new(cache, config, persistence, events));
        let time = Arc::new(Esp32TimeAdapter::new());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = stop.clone();
            let service = service.clone();
            let time = time.clone();
            std::thread::spawn(move || run_publisher_worker(service, RecordingCan::new(), time, 10, stop))
        };

        std::thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn poller_worker_stops_promptly_when_flagged() {
        let cache = Arc::new(RegisterCache::new(LIVE_DATA));
        cache.load_defaults();
        let events = Arc::new(EventBus::new());
        let time = Arc::new(Esp32TimeAdapter::new());
        static BLOCKS: &[PollBlock] = &[PollBlock { start_addr: 0, count: 1 }];
        let poller = Arc::new(Poller::new(BLOCKS));
        poller.set_poll_interval_ms(100);
        let (serial_tx, _serial_rx) = crossbeam_channel::bounded::<SerialRequest>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = stop.clone();
            let cache = cache.clone();
            let events = events.clone();
            let time = time.clone();
            std::thread::spawn(move || run_poller_worker(cache, events, poller, serial_tx, time, stop))
        };

        std::thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
