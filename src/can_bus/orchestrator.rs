//! CAN publishing orchestrator: per-PGN scheduler with a circuit breaker,
//! token-bucket rate limiter, encoded-frame cache and metrics.

use super::pgn::{self, PgnInputs};
use crate::error::{Error, Result};
use burster::{Limiter, TokenBucket};
use core::time::Duration as CoreDuration;
use std::time::Duration;

/// A frame ready for the CAN driver collaborator.
#[derive(Debug, Clone, Copy)]
pub struct CanFrame {
    pub can_id: u16,
    pub dlc: u8,
    pub payload: [u8; 8],
}

impl CanFrame {
    fn new(can_id: u16, payload: [u8; 8]) -> Self {
        Self { can_id, dlc: 8, payload }
    }
}

/// One PGN table entry: identity plus its transmit period in milliseconds.
#[derive(Debug, Clone, Copy)]
struct PgnEntry {
    can_id: u16,
    period_ms: u32,
}

const PGN_TABLE: &[PgnEntry] = &[
    PgnEntry { can_id: 0x351, period_ms: 1_000 },
    PgnEntry { can_id: 0x355, period_ms: 1_000 },
    PgnEntry { can_id: 0x356, period_ms: 1_000 },
    PgnEntry { can_id: 0x35A, period_ms: 1_000 },
    PgnEntry { can_id: 0x35E, period_ms: 2_000 },
    PgnEntry { can_id: 0x35F, period_ms: 2_000 },
    PgnEntry { can_id: 0x370, period_ms: 2_000 },
    PgnEntry { can_id: 0x371, period_ms: 2_000 },
    PgnEntry { can_id: 0x372, period_ms: 1_000 },
    PgnEntry { can_id: 0x373, period_ms: 1_000 },
    PgnEntry { can_id: 0x374, period_ms: 1_000 },
    PgnEntry { can_id: 0x375, period_ms: 1_000 },
    PgnEntry { can_id: 0x376, period_ms: 1_000 },
    PgnEntry { can_id: 0x377, period_ms: 1_000 },
    PgnEntry { can_id: 0x378, period_ms: 1_000 },
    PgnEntry { can_id: 0x379, period_ms: 5_000 },
    PgnEntry { can_id: 0x380, period_ms: 5_000 },
    PgnEntry { can_id: 0x381, period_ms: 5_000 },
    PgnEntry { can_id: 0x382, period_ms: 5_000 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_OPEN_DURATION: Duration = Duration::from_secs(30);
const BREAKER_HALF_OPEN_SUCCESSES: u32 = 3;

/// Fault-isolation breaker guarding the whole publish cycle: opens after
/// five consecutive cycle failures, cools off for 30 s, then half-opens to
/// probe before fully closing again.
struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Duration>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self { state: BreakerState::Closed, consecutive_failures: 0, half_open_successes: 0, opened_at: None }
    }

    /// Whether a cycle may run right now, given the current monotonic time.
    fn admit(&mut self, now: Duration) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.opened_at.is_some_and(|since| now.saturating_sub(since) >= BREAKER_OPEN_DURATION) {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= BREAKER_HALF_OPEN_SUCCESSES {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&mut self, now: Duration) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(now);
                self.consecutive_failures = BREAKER_FAILURE_THRESHOLD;
            }
            BreakerState::Open => {}
        }
    }
}

/// A single cached frame, valid only while its content hash matches the
/// current snapshot.
#[derive(Debug, Clone, Copy, Default)]
struct CachedFrame {
    content_hash: u64,
    payload: [u8; 8],
    valid: bool,
}

/// Publish counters and latency tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub throttled: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub last_publish_ts_ms: u64,
    pub breaker_trips: u64,
}

impl Metrics {
    fn record_latency(&mut self, latency_ms: u64) {
        let n = self.successful.max(1) as f64;
        self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + latency_ms as f64) / n;
        self.max_latency_ms = self.max_latency_ms.max(latency_ms);
    }
}

/// Stable content hash over rounded/canonicalised SOC, pack voltage and
/// pack current, so benign float noise below encoder precision does not
/// invalidate the frame cache.
pub fn content_hash(soc_pct: f32, pack_voltage_v: f32, pack_current_a: f32) -> u64 {
    let soc = (soc_pct * 100.0).round() as i64;
    let v = (pack_voltage_v * 100.0).round() as i64;
    let c = (pack_current_a * 10.0).round() as i64;
    let mut h: u64 = 0xcbf29ce484222325;
    for part in [soc, v, c] {
        for byte in part.to_le_bytes() {
            h ^= u64::from(byte);
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    h
}

/// Sentinel meaning "never fired" for `last_fire_ms` entries, distinct from
/// a legitimate fire at timestamp 0.
const NEVER_FIRED: u32 = u32::MAX;

pub struct Orchestrator {
    last_fire_ms: [u32; PGN_TABLE.len()],
    frame_cache: [CachedFrame; PGN_TABLE.len()],
    breaker: CircuitBreaker,
    rate_limiter: TokenBucket<fn() -> CoreDuration>,
    metrics: Metrics,
}

fn no_time_provider() -> CoreDuration {
    CoreDuration::ZERO
}

impl Orchestrator {
    pub fn new(time_provider: fn() -> CoreDuration) -> Self {
        Self {
            last_fire_ms: [NEVER_FIRED; PGN_TABLE.len()],
            frame_cache: [CachedFrame::default(); PGN_TABLE.len()],
            breaker: CircuitBreaker::new(),
            rate_limiter: TokenBucket::new_with_time_provider(10, 10, time_provider),
            metrics: Metrics::default(),
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    /// Run one publish cycle: called from `bms_register_updated`. Consults
    /// the rate limiter and breaker first, then walks the PGN table,
    /// emitting due frames through `send`. A frame the encoder can't
    /// produce is skipped and counted; a `send` error fails the whole
    /// cycle for breaker purposes, but other PGNs still attempt.
    pub fn run_cycle(
        &mut self,
        now_ms: u64,
        inputs: &PgnInputs,
        send: &mut dyn FnMut(CanFrame) -> Result<()>,
    ) -> Result<()> {
        self.metrics.total += 1;
        let now = Duration::from_millis(now_ms);

        if self.rate_limiter.try_consume(1).is_err() {
            self.metrics.throttled += 1;
            return Err(Error::ResourceExhausted);
        }

        if !self.breaker.admit(now) {
            self.metrics.throttled += 1;
            return Err(Error::ResourceExhausted);
        }

        let hash = content_hash(inputs.soc_pct, inputs.pack_voltage_v, inputs.pack_current_a);
        let mut any_failure = false;

        for (idx, entry) in PGN_TABLE.iter().enumerate() {
            let due = self.last_fire_ms[idx] == NEVER_FIRED
                || now_ms.saturating_sub(u64::from(self.last_fire_ms[idx])) >= u64::from(entry.period_ms);
            if !due {
                continue;
            }
            self.last_fire_ms[idx] = now_ms as u32;

            let payload = match self.encode_or_cached(idx, entry.can_id, hash, inputs) {
                Some(p) => p,
                None => continue,
            };

            match send(CanFrame::new(entry.can_id, payload)) {
                Ok(()) => self.metrics.successful += 1,
                Err(_) => {
                    any_failure = true;
                    self.metrics.failed += 1;
                }
            }
        }

        self.metrics.last_publish_ts_ms = now_ms;

        if any_failure {
            self.breaker.on_failure(now);
            if self.breaker.state == BreakerState::Open {
                self.metrics.breaker_trips += 1;
            }
            Err(Error::CanFailure)
        } else {
            self.breaker.on_success();
            Ok(())
        }
    }

    fn encode_or_cached(&mut self, idx: usize, can_id: u16, hash: u64, inputs: &PgnInputs) -> Option<[u8; 8]> {
        if self.frame_cache[idx].valid && self.frame_cache[idx].content_hash == hash {
            self.metrics.cache_hits += 1;
            return Some(self.frame_cache[idx].payload);
        }
        self.metrics.cache_misses += 1;
        let payload = encode_pgn(can_id, inputs)?;
        self.frame_cache[idx] = CachedFrame { content_hash: hash, payload, valid: true };
        Some(payload)
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(no_time_provider)
    }
}

fn encode_pgn(can_id: u16, inputs: &PgnInputs) -> Option<[u8; 8]> {
    Some(match can_id {
        0x351 => pgn::encode_0x351(inputs),
        0x355 => pgn::encode_0x355(inputs),
        0x356 => pgn::encode_0x356(inputs),
        0x35A => pgn::encode_0x35a(inputs),
        0x35E => pgn::encode_0x35e(inputs),
        0x35F => pgn::encode_0x35f(inputs),
        0x370 => pgn::encode_0x370_0x371(inputs).0,
        0x371 => pgn::encode_0x370_0x371(inputs).1,
        0x372 => pgn::encode_0x372(inputs),
        0x373 => pgn::encode_0x373(inputs),
        0x374 => pgn::encode_0x374(inputs),
        0x375 => pgn::encode_0x375(inputs),
        0x376 => pgn::encode_0x376(inputs),
        0x377 => pgn::encode_0x377(inputs),
        0x378 => pgn::encode_0x378(inputs),
        0x379 => pgn::encode_0x379(inputs),
        0x380 => pgn::encode_0x380_0x381(inputs).0,
        0x381 => pgn::encode_0x380_0x381(inputs).1,
        0x382 => pgn::encode_0x382(inputs),
        _ => return None,
    })
}
