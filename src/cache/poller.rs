//! Periodic poll scheduling over the serial engine's read exchange.

use super::RegisterCache;
use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::registers::{decode_word, DecodedValue};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time poll success/failure counters, read by the diagnostics
/// snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollMetrics {
    pub successes: u64,
    pub failures: u64,
}

/// Default, minimum and maximum poll interval, enforced on every write to
/// the setting (register 300, `uart_poll_interval_ms`).
pub const DEFAULT_POLL_INTERVAL_MS: u32 = 500;
pub const MIN_POLL_INTERVAL_MS: u32 = 100;
pub const MAX_POLL_INTERVAL_MS: u32 = 60_000;

/// Clamp a requested poll interval into the enforced bounds.
pub const fn clamp_poll_interval(requested_ms: u32) -> u32 {
    if requested_ms < MIN_POLL_INTERVAL_MS {
        MIN_POLL_INTERVAL_MS
    } else if requested_ms > MAX_POLL_INTERVAL_MS {
        MAX_POLL_INTERVAL_MS
    } else {
        requested_ms
    }
}

/// A contiguous block of registers the poller reads together.
#[derive(Debug, Clone, Copy)]
pub struct PollBlock {
    pub start_addr: u16,
    pub count: u16,
}

/// A small, pre-allocated ring of per-update payload buffers, bounding the
/// allocation pressure of publishing many register updates per poll cycle.
pub struct PollEventRing<const N: usize> {
    next: usize,
}

impl<const N: usize> Default for PollEventRing<N> {
    fn default() -> Self {
        Self { next: 0 }
    }
}

impl<const N: usize> PollEventRing<N> {
    pub fn next_slot(&mut self) -> usize {
        let slot = self.next;
        self.next = (self.next + 1) % N;
        slot
    }
}

pub struct Poller {
    blocks: &'static [PollBlock],
    poll_interval_ms: AtomicU32,
    last_poll_ms: AtomicU32,
    ring: std::sync::Mutex<PollEventRing<16>>,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Poller {
    pub fn new(blocks: &'static [PollBlock]) -> Self {
        Self {
            blocks,
            poll_interval_ms: AtomicU32::new(DEFAULT_POLL_INTERVAL_MS),
            last_poll_ms: AtomicU32::new(0),
            ring: std::sync::Mutex::new(PollEventRing::default()),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Cumulative poll block success/failure counts, for the diagnostics
    /// snapshot.
    pub fn poll_metrics(&self) -> PollMetrics {
        PollMetrics { successes: self.successes.load(Ordering::Relaxed), failures: self.failures.load(Ordering::Relaxed) }
    }

    pub fn poll_interval_ms(&self) -> u32 {
        self.poll_interval_ms.load(Ordering::Relaxed)
    }

    pub fn set_poll_interval_ms(&self, requested_ms: u32) {
        self.poll_interval_ms.store(clamp_poll_interval(requested_ms), Ordering::Relaxed);
    }

    pub fn due(&self, now_ms: u32) -> bool {
        now_ms.wrapping_sub(self.last_poll_ms.load(Ordering::Relaxed)) >= self.poll_interval_ms()
    }

    /// Run one poll cycle if due: read every configured block through
    /// `read_block`, apply results to `cache`, and publish
    /// `bms_register_updated` for every address that changed.
    pub fn tick(
        &self,
        now_ms: u64,
        cache: &RegisterCache,
        events: &EventBus,
        read_block: &mut dyn FnMut(u16, u16) -> Result<heapless::Vec<u8, 254>>,
    ) -> Result<()> {
        if !self.due(now_ms as u32) {
            return Ok(());
        }
        self.last_poll_ms.store(now_ms as u32, Ordering::Relaxed);

        for block in self.blocks {
            let payload = match read_block(block.start_addr, block.count) {
                Ok(p) => {
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    p
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };
            let words = bytes_to_words_be(&payload);
            let changed = cache.apply_poll_result(block.start_addr, &words, now_ms);
            let mut ring = self.ring.lock().unwrap();
            for addr in changed {
                let _slot = ring.next_slot();
                if let Some(d) = cache.descriptor(addr) {
                    let slot = cache.get(addr)?;
                    let scaled = match decode_word(slot.raw, d) {
                        Ok(DecodedValue::Number(n)) => n,
                        _ => slot.raw as f64,
                    };
                    events.publish(
                        GatewayEvent::BmsRegisterUpdated { key: d.key, raw: slot.raw, address: addr },
                        Duration::from_millis(20),
                    )?;
                    let _ = scaled;
                }
            }
        }
        Ok(())
    }
}

fn bytes_to_words_be(payload: &[u8]) -> Vec<u16> {
    payload.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_poll_interval_enforces_bounds() {
        assert_eq!(clamp_poll_interval(10), MIN_POLL_INTERVAL_MS);
        assert_eq!(clamp_poll_interval(999_999), MAX_POLL_INTERVAL_MS);
        assert_eq!(clamp_poll_interval(1000), 1000);
    }

    #[test]
    fn bytes_to_words_be_matches_generic_endianness() {
        assert_eq!(bytes_to_words_be(&[0x8C, 0x05]), vec![0x8C05]);
    }

    #[test]
    fn poller_is_due_after_interval_elapses() {
        static BLOCKS: &[PollBlock] = &[PollBlock { start_addr: 0, count: 1 }];
        let poller = Poller::new(BLOCKS);
        poller.set_poll_interval_ms(200);
        assert!(poller.due(0));
    }

    #[test]
    fn poller_skips_tick_before_interval_elapses() {
        use crate::registers::table::LIVE_DATA;
        let cache = RegisterCache::new(LIVE_DATA);
        cache.load_defaults();
        let events = EventBus::new();
        static BLOCKS: &[PollBlock] = &[PollBlock { start_addr: 0, count: 1 }];
        let poller = Poller::new(BLOCKS);
        poller.set_poll_interval_ms(1000);
        let mut calls = 0;
        poller
            .tick(0, &cache, &events, &mut |_a, _c| {
                calls += 1;
                Ok(heapless::Vec::new())
            })
            .unwrap();
        assert_eq!(calls, 1);
        let mut calls2 = 0;
        poller
            .tick(100, &cache, &events, &mut |_a, _c| {
                calls2 += 1;
                Ok(heapless::Vec::new())
            })
            .unwrap();
        assert_eq!(calls2, 0);
    }

    #[test]
    fn poll_metrics_count_successes_and_failures() {
        use crate::error::Error;
        use crate::registers::table::LIVE_DATA;
        let cache = RegisterCache::new(LIVE_DATA);
        cache.load_defaults();
        let events = EventBus::new();
        static BLOCKS: &[PollBlock] = &[PollBlock { start_addr: 0, count: 1 }];
        let poller = Poller::new(BLOCKS);
        poller.set_poll_interval_ms(100);

        poller.tick(0, &cache, &events, &mut |_a, _c| Ok(heapless::Vec::new())).unwrap();
        assert_eq!(poller.poll_metrics().successes, 1);
        assert_eq!(poller.poll_metrics().failures, 0);

        let err = poller.tick(200, &cache, &events, &mut |_a, _c| Err(Error::SerialTimeout)).unwrap_err();
        assert_eq!(err, Error::SerialTimeout);
        assert_eq!(poller.poll_metrics().successes, 1);
        assert_eq!(poller.poll_metrics().failures, 1);
    }
}
