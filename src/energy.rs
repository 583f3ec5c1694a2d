//! Energy integrator: charged/discharged watt-hour accumulation with
//! crash-safe, debounced persistence.
//!
//! All four counters are read and written inside one critical section per
//! sample — `V·I·Δt` plus the zero-floor clamp happens atomically under a
//! single lock acquisition, never as two separate mutations.

use crate::error::{Error, Result};
use crate::persistence::{keys, Persistence};
use parking_lot::Mutex;
use std::time::Duration;

const DIRTY_THRESHOLD_WH: f64 = 10.0;
const PERSIST_MIN_INTERVAL_MS: u64 = 60_000;
const MAX_GAP_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    charged_wh: f64,
    discharged_wh: f64,
    last_sample_ts_ms: u64,
    last_persist_ts_ms: u64,
    last_persisted_charged_wh: f64,
    last_persisted_discharged_wh: f64,
    dirty: bool,
}

pub struct EnergyIntegrator {
    counters: Mutex<Counters>,
    lock_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnergySnapshot {
    pub charged_wh: f64,
    pub discharged_wh: f64,
}

impl EnergyIntegrator {
    pub fn new() -> Self {
        Self { counters: Mutex::new(Counters::default()), lock_timeout: Duration::from_millis(100) }
    }

    pub fn restore(&self, charged_wh: f64, discharged_wh: f64) {
        let mut c = self.counters.lock();
        c.charged_wh = charged_wh.max(0.0);
        c.discharged_wh = discharged_wh.max(0.0);
        c.last_persisted_charged_wh = c.charged_wh;
        c.last_persisted_discharged_wh = c.discharged_wh;
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn snapshot(&self) -> EnergySnapshot {
        let c = self.counters.lock();
        EnergySnapshot { charged_wh: c.charged_wh, discharged_wh: c.discharged_wh }
    }

    /// Integrate one `(voltage, current)` sample taken at `now_ms`, and
    /// persist if the accumulated drift justifies it. Returns the
    /// resulting snapshot. A non-finite current or a voltage at or below
    /// 0.1 V is ignored (no anchor, no integration) per the no-signal
    /// guard.
    pub fn sample(&self, voltage_v: f32, current_a: f32, now_ms: u64, persistence: &Persistence) -> Result<EnergySnapshot> {
        if voltage_v <= 0.1 || !current_a.is_finite() {
            return Ok(self.snapshot());
        }

        let (should_persist, snap) = {
            let mut c = self.counters.lock();

            if c.last_sample_ts_ms == 0 {
                c.last_sample_ts_ms = now_ms;
                return Ok(EnergySnapshot { charged_wh: c.charged_wh, discharged_wh: c.discharged_wh });
            }

            let dt_ms = now_ms.saturating_sub(c.last_sample_ts_ms);
            if dt_ms / 1000 > MAX_GAP_SECS {
                log::warn!("energy: sample gap of {}s, integrating anyway", dt_ms / 1000);
            }
            c.last_sample_ts_ms = now_ms;

            let power_w = f64::from(voltage_v) * f64::from(current_a);
            let wh = power_w * (dt_ms as f64) / 3_600_000.0;
            if power_w >= 0.0 {
                c.charged_wh = (c.charged_wh + wh).max(0.0);
            } else {
                c.discharged_wh = (c.discharged_wh + wh.abs()).max(0.0);
            }

            let diverged = (c.charged_wh - c.last_persisted_charged_wh).abs() >= DIRTY_THRESHOLD_WH
                || (c.discharged_wh - c.last_persisted_discharged_wh).abs() >= DIRTY_THRESHOLD_WH;
            if diverged {
                c.dirty = true;
            }

            let elapsed_since_persist = now_ms.saturating_sub(c.last_persist_ts_ms);
            let should_persist = c.dirty && elapsed_since_persist >= PERSIST_MIN_INTERVAL_MS;

            (should_persist, EnergySnapshot { charged_wh: c.charged_wh, discharged_wh: c.discharged_wh })
        };

        if should_persist {
            self.persist(persistence, now_ms)?;
        }

        Ok(snap)
    }

    /// Write both counters atomically, idempotently marking them clean.
    /// Called on the debounced schedule above, and forced during shutdown.
    pub fn persist(&self, persistence: &Persistence, now_ms: u64) -> Result<()> {
        let (charged, discharged) = {
            let c = self.counters.lock();
            (c.charged_wh, c.discharged_wh)
        };
        persistence.write(keys::ENERGY_CHARGED_WH, &charged).map_err(|_| Error::NvsFailure)?;
        persistence.write(keys::ENERGY_DISCHARGED_WH, &discharged).map_err(|_| Error::NvsFailure)?;
        let mut c = self.counters.lock();
        c.last_persisted_charged_wh = charged;
        c.last_persisted_discharged_wh = discharged;
        c.last_persist_ts_ms = now_ms;
        c.dirty = false;
        Ok(())
    }

    /// Force a persist regardless of dirty/debounce state, for cooperative
    /// shutdown.
    pub fn force_persist(&self, persistence: &Persistence, now_ms: u64) -> Result<()> {
        self.persist(persistence, now_ms)
    }
}

impl Default for EnergyIntegrator {
    fn default() -> Self {
        Self::new()
    }
}
