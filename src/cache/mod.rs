//! Register cache: concurrent, timestamped, dirty-aware storage of BMS
//! register raw values, with NVS-backed startup overlay and change-event
//! fan-out.
//!
//! Single writer under [`RegisterCache`]'s mutex (the poller or the write
//! path below); many readers via an atomically-swapped snapshot `Arc`, per
//! the ownership rule that the cache exclusively owns raw values.

pub mod poller;

use crate::error::{Error, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::registers::{scaled_encode, validate_write, Access, RegisterDescriptor};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// One cached register's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSlot {
    pub raw: u16,
    pub ts_ms: u64,
    pub valid: bool,
}

impl RawSlot {
    const fn invalid() -> Self {
        Self { raw: 0, ts_ms: 0, valid: false }
    }
}

/// A consistent, point-in-time copy of every cached address.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub values: HashMap<u16, RawSlot>,
    pub taken_ts_ms: u64,
}

impl CacheSnapshot {
    pub fn get(&self, addr: u16) -> Option<RawSlot> {
        self.values.get(&addr).copied()
    }
}

/// Lock timeout used by every mutating/snapshotting call. A timed-out
/// snapshot read falls back to the last published snapshot (stale-read
/// fallback); a timed-out write is refused.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

pub struct RegisterCache {
    by_addr: HashMap<u16, &'static RegisterDescriptor>,
    by_key: HashMap<&'static str, &'static RegisterDescriptor>,
    raw: Mutex<HashMap<u16, RawSlot>>,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    lock_timeout: Duration,
}

impl RegisterCache {
    pub fn new(descriptors: &'static [RegisterDescriptor]) -> Self {
        let mut by_addr = HashMap::new();
        let mut by_key = HashMap::new();
        for d in descriptors {
            by_addr.insert(d.address, d);
            by_key.insert(d.key, d);
        }
        Self {
            by_addr,
            by_key,
            raw: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(CacheSnapshot { values: HashMap::new(), taken_ts_ms: 0 })),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn descriptor(&self, addr: u16) -> Option<&'static RegisterDescriptor> {
        self.by_addr.get(&addr).copied()
    }

    pub fn descriptor_by_key(&self, key: &str) -> Option<&'static RegisterDescriptor> {
        self.by_key.get(key).copied()
    }

    /// Seed every descriptor's default raw value with timestamp 0 / valid
    /// false (not yet observed from the BMS, but present so `get` never
    /// returns `NotFound` for a known address).
    pub fn load_defaults(&self) {
        let mut raw = self.raw.lock();
        for d in self.by_addr.values() {
            raw.insert(d.address, RawSlot { raw: d.default_raw as u16, ts_ms: 0, valid: false });
        }
    }

    /// Overlay a single persisted raw value at startup. Enum-class
    /// registers drop out-of-table restored values (falling back to the
    /// default already seeded by `load_defaults`); everything else is
    /// aligned to step and clamped into range before acceptance.
    pub fn overlay_persisted(&self, addr: u16, raw_value: u16) {
        let Some(d) = self.descriptor(addr) else { return };
        let accepted = if d.ty == crate::registers::RegisterType::Enum {
            if d.enum_contains(raw_value) {
                raw_value
            } else {
                return;
            }
        } else {
            d.align_and_clamp(raw_value as i32) as u16
        };
        let mut raw = self.raw.lock();
        raw.insert(addr, RawSlot { raw: accepted, ts_ms: 0, valid: true });
    }

    /// Read a single address's current slot.
    pub fn get(&self, addr: u16) -> Result<RawSlot> {
        self.by_addr.get(&addr).ok_or(Error::NotFound)?;
        Ok(self.raw.lock().get(&addr).copied().unwrap_or(RawSlot::invalid()))
    }

    pub fn get_by_key(&self, key: &str) -> Result<RawSlot> {
        let d = self.descriptor_by_key(key).ok_or(Error::NotFound)?;
        self.get(d.address)
    }

    /// Apply a successful poll result: `start_addr` plus `words` read in
    /// order. Bumps timestamps, marks slots valid, and returns the set of
    /// addresses whose raw value actually changed (for event fan-out).
    pub fn apply_poll_result(&self, start_addr: u16, words: &[u16], ts_ms: u64) -> Vec<u16> {
        let mut changed = Vec::new();
        let mut raw = self.raw.lock();
        for (i, &word) in words.iter().enumerate() {
            let addr = start_addr + i as u16;
            let entry = raw.entry(addr).or_insert(RawSlot::invalid());
            if entry.raw != word || !entry.valid {
                changed.push(addr);
            }
            entry.raw = word;
            entry.ts_ms = ts_ms;
            entry.valid = true;
        }
        drop(raw);
        self.refresh_snapshot(ts_ms);
        changed
    }

    /// Directly set one address (used by the write path after read-back).
    pub fn set_raw(&self, addr: u16, raw_value: u16, ts_ms: u64) {
        {
            let mut raw = self.raw.lock();
            raw.insert(addr, RawSlot { raw: raw_value, ts_ms, valid: true });
        }
        self.refresh_snapshot(ts_ms);
    }

    fn refresh_snapshot(&self, ts_ms: u64) {
        let values = self.raw.lock().clone();
        let snap = Arc::new(CacheSnapshot { values, taken_ts_ms: ts_ms });
        *self.snapshot.write() = snap;
    }

    /// A consistent point-in-time snapshot. Lock-free for callers holding
    /// the returned `Arc`.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

/// Validate, encode and accept a user-supplied value for a `rw` register,
/// without touching the serial line — used by [`write_register`] and by
/// tests that only need the validation half of the write path.
pub fn encode_user_write(d: &RegisterDescriptor, user_value: f64) -> Result<u16> {
    if d.access != Access::Rw && d.access != Access::Wo {
        return Err(Error::InvalidState);
    }
    let raw = scaled_encode(user_value, d)?;
    let raw = validate_write(raw, d)?;
    Ok(raw as u16)
}

/// Full write path for an `rw` register: validate, issue a single-register
/// write over `write_fn`, read back the same address over `read_fn`, store
/// the read-back value (never the requested one), persist it, and publish
/// `bms_register_updated`.
pub fn write_register(
    cache: &RegisterCache,
    events: &EventBus,
    persist: &mut dyn FnMut(&RegisterDescriptor, u16) -> Result<()>,
    write_fn: &mut dyn FnMut(u16, u16) -> Result<()>,
    read_fn: &mut dyn FnMut(u16) -> Result<u16>,
    key: &str,
    user_value: f64,
    now_ms: u64,
) -> Result<u16> {
    let d = cache.descriptor_by_key(key).ok_or(Error::NotFound)?;
    let raw = encode_user_write(d, user_value)?;
    write_fn(d.address, raw)?;
    let read_back = read_fn(d.address)?;
    cache.set_raw(d.address, read_back, now_ms);
    persist(d, read_back)?;
    events.publish(GatewayEvent::BmsRegisterUpdated { key: d.key, raw: read_back, address: d.address }, Duration::from_millis(20))?;
    Ok(read_back)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{Access, RegisterType};

    static TEST_DESC: RegisterDescriptor = RegisterDescriptor {
        address: 7,
        key: "test_rw",
        label: "Test",
        unit: "",
        group: "g",
        ty: RegisterType::U16,
        access: Access::Rw,
        scale: 0.1,
        precision: 1,
        min_raw: Some(0),
        max_raw: Some(1000),
        step: Some(1),
        default_raw: 0,
        enum_table: None,
        packed_fields: None,
        special_raw: None,
    };
    static TABLE: [RegisterDescriptor; 1] = [TEST_DESC];

    #[test]
    fn load_defaults_seeds_every_descriptor() {
        let cache = RegisterCache::new(&TABLE);
        cache.load_defaults();
        let slot = cache.get(7).unwrap();
        assert_eq!(slot.raw, 0);
        assert!(!slot.valid);
    }

    #[test]
    fn get_unknown_address_is_not_found() {
        let cache = RegisterCache::new(&TABLE);
        assert_eq!(cache.get(999).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn apply_poll_result_reports_changed_addresses() {
        let cache = RegisterCache::new(&TABLE);
        cache.load_defaults();
        let changed = cache.apply_poll_result(7, &[50], 100);
        assert_eq!(changed, vec![7]);
        let changed_again = cache.apply_poll_result(7, &[50], 200);
        assert!(changed_again.is_empty());
    }

    #[test]
    fn snapshot_is_consistent_point_in_time() {
        let cache = RegisterCache::new(&TABLE);
        cache.load_defaults();
        cache.apply_poll_result(7, &[42], 100);
        let snap = cache.snapshot();
        assert_eq!(snap.get(7).unwrap().raw, 42);
    }

    #[test]
    fn overlay_persisted_aligns_and_clamps() {
        let cache = RegisterCache::new(&TABLE);
        cache.load_defaults();
        cache.overlay_persisted(7, 5000);
        assert_eq!(cache.get(7).unwrap().raw, 1000);
    }

    #[test]
    fn write_register_stores_read_back_not_requested_value() {
        let cache = RegisterCache::new(&TABLE);
        cache.load_defaults();
        let events = EventBus::new();
        let mut persisted = None;
        let got = write_register(
            &cache,
            &events,
            &mut |d, raw| {
                persisted = Some((d.address, raw));
                Ok(())
            },
            &mut |_addr, _raw| Ok(()),
            &mut |_addr| Ok(77), // BMS actually applied a different value
            "test_rw",
            10.0,
            1000,
        )
        .unwrap();
        assert_eq!(got, 77);
        assert_eq!(cache.get(7).unwrap().raw, 77);
        assert_eq!(persisted, Some((7, 77)));
    }

    #[test]
    fn write_register_rejects_unknown_key() {
        let cache = RegisterCache::new(&TABLE);
        let events = EventBus::new();
        let err = write_register(
            &cache,
            &events,
            &mut |_, _| Ok(()),
            &mut |_, _| Ok(()),
            &mut |_| Ok(0),
            "nonexistent",
            1.0,
            0,
        )
        .unwrap_err();
        assert_eq!(err, Error::NotFound);
    }
}
