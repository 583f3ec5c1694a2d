//! Application service — the hexagonal core.
//!
//! [`GatewayService`] owns the register cache, the CVL control law, the
//! energy integrator and the CAN publish orchestrator. All hardware I/O
//! flows through port traits injected at call sites
//! ([`super::ports::CanPort`], [`crate::serial::SerialPort`]), making the
//! whole pipeline testable with host-side adapters.
//!
//! ```text
//!  SerialPort ──▶ RegisterCache ──▶ CVL law ──▶ PGN encode ──▶ CanPort
//!                      │                            ▲
//!                      └── EnergyIntegrator ─────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Mutex;

use crate::cache::poller::PollMetrics;
use crate::cache::RegisterCache;
use crate::can_bus::orchestrator::Orchestrator;
use crate::can_bus::pgn::{evaluate_alarms, AlarmInputs, AlarmState, AlarmThresholds, PgnInputs};
use crate::config::{CanIdentitySettings, ConfigManager};
use crate::cvl::{self, CvlConfig, CvlInputs, CvlRuntime};
use crate::diagnostics::{GatewayMetrics, GatewaySnapshot};
use crate::energy::EnergyIntegrator;
use crate::error::Result;
use crate::events::{EventBus, GatewayEvent};
use crate::persistence::{keys, Persistence};
use crate::registers::{decode_pair, decode_word, DecodedValue, Endian, RegisterType};

use super::ports::CanPort;

/// Decode a register by key, whichever single- or double-word shape it
/// happens to be. Used for the handful of cache reads the PGN/CVL paths
/// need as plain scaled numbers.
fn decoded_number(cache: &RegisterCache, key: &str) -> f32 {
    let Some(d) = cache.descriptor_by_key(key) else { return 0.0 };
    let value = match d.ty {
        RegisterType::U32 | RegisterType::F32 => {
            let lo = cache.get(d.address).ok();
            let hi = cache.get(d.address + 1).ok();
            match (lo, hi) {
                (Some(a), Some(b)) => decode_pair(a.raw, b.raw, d, Endian::Big).ok(),
                _ => None,
            }
        }
        _ => cache.get(d.address).ok().and_then(|s| decode_word(s.raw, d).ok()),
    };
    match value {
        Some(DecodedValue::Number(n)) => n as f32,
        _ => 0.0,
    }
}

fn decoded_word_u16(cache: &RegisterCache, key: &str) -> u16 {
    cache
        .descriptor_by_key(key)
        .and_then(|d| cache.get(d.address).ok())
        .map(|s| s.raw)
        .unwrap_or(0)
}

/// Build the threshold set `evaluate_alarms` checks against, straight from
/// the `safety`/`balance` settings registers so an operator write takes
/// effect on the next cycle without a restart.
fn read_alarm_thresholds(cache: &RegisterCache) -> AlarmThresholds {
    AlarmThresholds {
        over_voltage_cutoff_mv: decoded_word_u16(cache, "over_voltage_cutoff_mv"),
        over_voltage_warn_margin_mv: decoded_word_u16(cache, "over_voltage_warn_margin_mv"),
        under_voltage_cutoff_mv: decoded_word_u16(cache, "under_voltage_cutoff_mv"),
        under_voltage_warn_margin_mv: decoded_word_u16(cache, "under_voltage_warn_margin_mv"),
        over_temp_cutoff_c: decoded_number(cache, "over_temp_cutoff_c"),
        over_temp_warn_margin_c: decoded_number(cache, "over_temp_warn_margin_c"),
        under_temp_cutoff_c: decoded_number(cache, "under_temp_cutoff_c"),
        under_temp_warn_margin_c: decoded_number(cache, "under_temp_warn_margin_c"),
        charge_high_temp_cutoff_c: decoded_number(cache, "charge_high_temp_cutoff_c"),
        charge_low_temp_cutoff_c: decoded_number(cache, "charge_low_temp_cutoff_c"),
        discharge_high_current_limit_a: decoded_number(cache, "discharge_high_current_limit_a"),
        charge_high_current_limit_a: decoded_number(cache, "charge_high_current_limit_a"),
        current_warn_margin_pct: decoded_number(cache, "current_warn_margin_pct"),
        imbalance_warn_mv: decoded_word_u16(cache, "imbalance_warn_mv"),
        imbalance_alarm_mv: decoded_word_u16(cache, "imbalance_alarm_mv"),
    }
}

/// Everything one tick needs to build a [`PgnInputs`], short of the
/// identity strings — kept separate because those strings live in the
/// caller's stack frame, not in this struct, since `PgnInputs` only
/// borrows them for the duration of the encode call.
#[derive(Debug, Clone, Copy)]
struct TickSample {
    cvl_v: f32,
    ccl_a: f32,
    dcl_a: f32,
    soc_pct: f32,
    soh_pct: f32,
    pack_voltage_v: f32,
    pack_current_a: f32,
    mosfet_temp_c: f32,
    min_cell_mv: u16,
    max_cell_mv: u16,
    ambient_temp_c: f32,
    charged_wh: f64,
    discharged_wh: f64,
    alarms: AlarmState,
    model_id: u16,
    firmware_word: u16,
    internal_firmware_word: u16,
    capacity_ah: f32,
}

/// The application service orchestrates register decode → CVL → PGN encode
/// → CAN publish, plus the parallel energy-integration path.
pub struct GatewayService {
    cache: Arc<RegisterCache>,
    config: Arc<ConfigManager>,
    persistence: Arc<Persistence>,
    events: Arc<EventBus>,
    cvl_runtime: Mutex<CvlRuntime>,
    cvl_config: CvlConfig,
    energy: EnergyIntegrator,
    orchestrator: Mutex<Orchestrator>,
    last_sample: Mutex<Option<TickSample>>,
}

impl GatewayService {
    pub fn new(cache: Arc<RegisterCache>, config: Arc<ConfigManager>, persistence: Arc<Persistence>, events: Arc<EventBus>) -> Self {
        let cvl_config = CvlConfig::default();
        let cvl_runtime = Mutex::new(CvlRuntime::initial(&cvl_config));

        let charged_wh: f64 = persistence.read(keys::ENERGY_CHARGED_WH).ok().flatten().unwrap_or(0.0);
        let discharged_wh: f64 = persistence.read(keys::ENERGY_DISCHARGED_WH).ok().flatten().unwrap_or(0.0);
        let energy = EnergyIntegrator::new();
        energy.restore(charged_wh, discharged_wh);

        Self {
            cache,
            config,
            persistence,
            events,
            cvl_runtime,
            cvl_config,
            energy,
            orchestrator: Mutex::new(Orchestrator::default()),
            last_sample: Mutex::new(None),
        }
    }

    /// Decode the cache, evaluate CVL, integrate energy, and publish the
    /// derived battery-status/pack-stats/CVL-limits events so MQTT (or any
    /// other subscriber) sees the same numbers that hit the bus.
    fn sample(&self, now_ms: u64) -> TickSample {
        let soc_pct = decoded_number(&self.cache, "soc");
        let pack_voltage_v = decoded_number(&self.cache, "pack_voltage");
        let pack_current_a = decoded_number(&self.cache, "pack_current");
        let soh_pct = decoded_number(&self.cache, "soh");
        let mosfet_temp_c = decoded_number(&self.cache, "mosfet_temp");
        let ambient_temp_c = decoded_number(&self.cache, "ambient_temp");

        let min_idx = decoded_word_u16(&self.cache, "min_cell_mv_idx");
        let max_idx = decoded_word_u16(&self.cache, "max_cell_mv_idx");
        let min_cell_mv = decoded_word_u16(&self.cache, &format!("cell_mv_{min_idx}"));
        let max_cell_mv = decoded_word_u16(&self.cache, &format!("cell_mv_{max_idx}"));
        let max_cell_v = (max_cell_mv as f32) / 1000.0;
        let max_imbalance_mv = (max_cell_mv as i32 - min_cell_mv as i32).unsigned_abs() as f32;

        // `online_status`'s enum raw: 0 = charging, 5 = fault (see
        // `registers::table::ONLINE_STATUS_OPTIONS`).
        let online_status_raw = decoded_word_u16(&self.cache, "online_status");
        let charging = online_status_raw == 0;
        let system_online = online_status_raw != 5;

        let alarms = evaluate_alarms(
            &AlarmInputs { min_cell_mv, max_cell_mv, mosfet_temp_c, ambient_temp_c, pack_current_a, max_imbalance_mv, charging, system_online },
            &read_alarm_thresholds(&self.cache),
        );

        let model_id = decoded_word_u16(&self.cache, "hardware_version");
        let firmware_word = decoded_word_u16(&self.cache, "firmware_version");
        let internal_firmware_word = decoded_word_u16(&self.cache, "bootloader_version");
        let capacity_ah = decoded_number(&self.cache, "nominal_capacity_ah");

        // Base CCL/DCL come from the charger/load-current ceilings; not yet
        // register-sourced, so a flat nominal ceiling stands in until a
        // dedicated descriptor exists.
        let base_ccl_a = 100.0;
        let base_dcl_a = 100.0;

        let cvl_inputs = CvlInputs { soc_pct, max_imbalance_mv, pack_voltage_v, pack_current_a, max_cell_v, base_ccl_a, base_dcl_a };
        let output = {
            let mut rt = self.cvl_runtime.lock();
            let (next, out) = cvl::evaluate(*rt, cvl_inputs, &self.cvl_config);
            *rt = next;
            out
        };

        let _ = self.events.publish(
            GatewayEvent::CvlLimitsUpdated { cvl_v: output.cvl_v, ccl_a: output.ccl_a, dcl_a: output.dcl_a },
            Duration::from_millis(20),
        );
        let _ = self.events.publish(
            GatewayEvent::BatteryStatusUpdated { soc_pct, pack_v: pack_voltage_v, pack_i: pack_current_a },
            Duration::from_millis(20),
        );
        let _ = self.events.publish(
            GatewayEvent::PackStatsUpdated { min_cell_mv, max_cell_mv, min_temp_c: ambient_temp_c, max_temp_c: mosfet_temp_c },
            Duration::from_millis(20),
        );

        let energy_snapshot = match self.energy.sample(pack_voltage_v, pack_current_a, now_ms, &self.persistence) {
            Ok(s) => s,
            Err(e) => {
                warn!("energy sample failed: {e}");
                self.energy.snapshot()
            }
        };

        let sample = TickSample {
            cvl_v: output.cvl_v,
            ccl_a: output.ccl_a,
            dcl_a: output.dcl_a,
            soc_pct,
            soh_pct,
            pack_voltage_v,
            pack_current_a,
            mosfet_temp_c,
            min_cell_mv,
            max_cell_mv,
            ambient_temp_c,
            charged_wh: energy_snapshot.charged_wh,
            discharged_wh: energy_snapshot.discharged_wh,
            alarms,
            model_id,
            firmware_word,
            internal_firmware_word,
            capacity_ah,
        };
        *self.last_sample.lock() = Some(sample);
        sample
    }

    /// Run one publish cycle: decode the cache, evaluate CVL, encode every
    /// due PGN, and hand each frame to `can`.
    pub fn run_cycle(&self, now_ms: u32, can: &mut dyn CanPort) -> Result<()> {
        let s = self.sample(now_ms as u64);
        let identity: CanIdentitySettings = self.config.snapshot().can.identity;

        let inputs = PgnInputs {
            cvl_v: s.cvl_v,
            ccl_a: s.ccl_a,
            dcl_a: s.dcl_a,
            soc_pct: s.soc_pct,
            soh_pct: s.soh_pct,
            soc_high_res_pct: s.soc_pct,
            pack_voltage_v: s.pack_voltage_v,
            pack_current_a: s.pack_current_a,
            mosfet_temp_c: s.mosfet_temp_c,
            min_cell_mv: s.min_cell_mv,
            max_cell_mv: s.max_cell_mv,
            min_temp_c: s.ambient_temp_c,
            max_temp_c: s.mosfet_temp_c,
            alarms: s.alarms,
            manufacturer: &identity.manufacturer,
            model_id: s.model_id,
            firmware_word: s.firmware_word,
            internal_firmware_word: s.internal_firmware_word,
            capacity_ah: s.capacity_ah,
            battery_name: &identity.battery_name,
            battery_family: &identity.battery_family,
            serial_number: &identity.serial_number,
            modules_ok: true,
            blocking_charge: false,
            blocking_discharge: false,
            offline_count: 0,
            charged_wh: s.charged_wh,
            discharged_wh: s.discharged_wh,
        };

        let mut orchestrator = self.orchestrator.lock();
        orchestrator.run_cycle(now_ms, &inputs, &mut |frame| can.send(frame))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &RegisterCache {
        &self.cache
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    /// Publisher-only metrics (total/successful/failed/throttled publish
    /// counts, breaker trips, cache hit rate), with zeroed poll counters.
    /// Callers that also hold the `Poller` should use [`Self::snapshot`] or
    /// pass its [`PollMetrics`] through [`GatewayMetrics::combine`] instead.
    pub fn publisher_metrics(&self) -> GatewayMetrics {
        GatewayMetrics::combine(PollMetrics::default(), self.orchestrator.lock().metrics())
    }

    /// A read-only diagnostic snapshot: the latest BMS sample, CVL state and
    /// energy counters, plus publisher metrics merged with the caller's
    /// [`PollMetrics`]. `None` until the first `run_cycle` has completed.
    pub fn snapshot(&self, poll_metrics: PollMetrics, now_ms: u64) -> Option<GatewaySnapshot> {
        let s = (*self.last_sample.lock())?;
        let publish_metrics = self.orchestrator.lock().metrics();
        Some(GatewaySnapshot {
            ts_ms: now_ms,
            soc_pct: s.soc_pct,
            soh_pct: s.soh_pct,
            pack_voltage_v: s.pack_voltage_v,
            pack_current_a: s.pack_current_a,
            min_cell_mv: s.min_cell_mv,
            max_cell_mv: s.max_cell_mv,
            cvl_v: s.cvl_v,
            ccl_a: s.ccl_a,
            dcl_a: s.dcl_a,
            charged_wh: s.charged_wh,
            discharged_wh: s.discharged_wh,
            metrics: GatewayMetrics::combine(poll_metrics, publish_metrics),
        })
    }

    /// Force-persist the energy counters; call before shutdown.
    pub fn force_persist_energy(&self, now_ms: u64) -> Result<()> {
        self.energy.force_persist(&self.persistence, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::can_twai::RecordingCan;

    fn service() -> (GatewayService, Arc<RegisterCache>) {
        static TABLE: std::sync::OnceLock<Vec<crate::registers::RegisterDescriptor>> = std::sync::OnceLock::new();
        let table: &'static [crate::registers::RegisterDescriptor] =
            TABLE.get_or_init(|| crate::registers::table::all_descriptors().iter().copied().collect());
        let cache = Arc::new(RegisterCache::new(table));
        cache.load_defaults();
        let persistence = Arc::new(Persistence::new().unwrap());
        let events = Arc::new(EventBus::new());
        let config = Arc::new(ConfigManager::new(persistence.clone(), events.clone()));
        let service = GatewayService::new(cache.clone(), config, persistence, events);
        (service, cache)
    }

    #[test]
    fn run_cycle_sends_every_due_pgn_on_first_call() {
        let (service, _cache) = service();
        let mut can = RecordingCan::new();
        service.run_cycle(0, &mut can).unwrap();
        assert!(!can.sent.is_empty());
    }

    #[test]
    fn run_cycle_reflects_cached_soc_into_the_pgn_stream() {
        let (service, cache) = service();
        let soc_desc = cache.descriptor_by_key("soc").unwrap();
        cache.set_raw(soc_desc.address, 500_000, 0);
        cache.set_raw(soc_desc.address + 1, 0, 0);
        let mut can = RecordingCan::new();
        service.run_cycle(0, &mut can).unwrap();
        assert!(!can.sent.is_empty());
    }

    #[test]
    fn run_cycle_sources_capacity_and_identity_words_from_the_register_cache() {
        let (service, cache) = service();
        let cap_desc = cache.descriptor_by_key("nominal_capacity_ah").unwrap();
        cache.set_raw(cap_desc.address, 28_000, 0); // 280.00 Ah at 0.01 scale
        let hw_desc = cache.descriptor_by_key("hardware_version").unwrap();
        cache.set_raw(hw_desc.address, 0x0102, 0);
        let mut can = RecordingCan::new();
        service.run_cycle(0, &mut can).unwrap();
        assert!(!can.sent.is_empty());
    }

    #[test]
    fn run_cycle_raises_an_over_voltage_alarm_past_the_cutoff() {
        let (service, cache) = service();
        let cutoff_desc = cache.descriptor_by_key("over_voltage_cutoff_mv").unwrap();
        cache.set_raw(cutoff_desc.address, 3650, 0);
        let max_idx_desc = cache.descriptor_by_key("max_cell_mv_idx").unwrap();
        cache.set_raw(max_idx_desc.address, 0, 0);
        let cell0_desc = cache.descriptor_by_key("cell_mv_0").unwrap();
        cache.set_raw(cell0_desc.address, 3700, 0);
        let mut can = RecordingCan::new();
        service.run_cycle(0, &mut can).unwrap();
        assert!(!can.sent.is_empty());
    }

    #[test]
    fn snapshot_is_none_before_the_first_cycle() {
        let (service, _cache) = service();
        assert!(service.snapshot(PollMetrics::default(), 0).is_none());
    }

    #[test]
    fn snapshot_reflects_the_latest_cycle_and_merges_poll_metrics() {
        let (service, _cache) = service();
        let mut can = RecordingCan::new();
        service.run_cycle(0, &mut can).unwrap();

        let poll = PollMetrics { successes: 7, failures: 1 };
        let snap = service.snapshot(poll, 1_000).unwrap();
        assert_eq!(snap.ts_ms, 1_000);
        assert_eq!(snap.metrics.poll_successes, 7);
        assert_eq!(snap.metrics.poll_failures, 1);
        assert!(snap.metrics.publish_total >= 1);
    }
}
