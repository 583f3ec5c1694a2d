//! In-process event bus: topic-keyed fan-out with a bounded publish
//! timeout and typed, borrowed-at-publish-time payloads.
//!
//! Replaces the void-pointer `(ptr, size)` event payloads of the source
//! design with a closed set of payload variants per topic (see DESIGN.md).
//! Subscribe/unsubscribe are safe during publish: the subscriber list for a
//! topic is snapshotted (cloned) before fan-out, so no subscriber added
//! mid-publish observes that publish.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    BmsRegisterUpdated,
    ConfigUpdated,
    CvlLimitsUpdated,
    BatteryStatusUpdated,
    PackStatsUpdated,
    SystemStatusUpdated,
}

/// A closed set of payload variants, one per topic in scope.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    BmsRegisterUpdated { key: &'static str, raw: u16, address: u16 },
    ConfigUpdated { public_json: std::sync::Arc<str> },
    CvlLimitsUpdated { cvl_v: f32, ccl_a: f32, dcl_a: f32 },
    BatteryStatusUpdated { soc_pct: f32, pack_v: f32, pack_i: f32 },
    PackStatsUpdated { min_cell_mv: u16, max_cell_mv: u16, min_temp_c: f32, max_temp_c: f32 },
    SystemStatusUpdated { modules_ok: bool, online: bool },
}

impl GatewayEvent {
    pub const fn topic(&self) -> Topic {
        match self {
            Self::BmsRegisterUpdated { .. } => Topic::BmsRegisterUpdated,
            Self::ConfigUpdated { .. } => Topic::ConfigUpdated,
            Self::CvlLimitsUpdated { .. } => Topic::CvlLimitsUpdated,
            Self::BatteryStatusUpdated { .. } => Topic::BatteryStatusUpdated,
            Self::PackStatsUpdated { .. } => Topic::PackStatsUpdated,
            Self::SystemStatusUpdated { .. } => Topic::SystemStatusUpdated,
        }
    }
}

/// Default capacity for a subscriber's channel; publish still honours a
/// per-call timeout once the channel is full.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 32;

pub struct EventBus {
    subscribers: Mutex<HashMap<Topic, Vec<Sender<GatewayEvent>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(HashMap::new()) }
    }

    /// Subscribe to `topic`, returning the receiving end of a bounded
    /// channel. The sender half is retained by the bus.
    pub fn subscribe(&self, topic: Topic) -> Receiver<GatewayEvent> {
        let (tx, rx) = crossbeam_channel::bounded(DEFAULT_SUBSCRIBER_CAPACITY);
        self.subscribers.lock().entry(topic).or_default().push(tx);
        rx
    }

    /// Publish `event` to every current subscriber of its topic, waiting up
    /// to `timeout` per subscriber. Delivery order within a topic matches
    /// publish order because each subscriber's channel is FIFO and callers
    /// serialize their own publish calls.
    ///
    /// Dead subscribers (receiver dropped) are pruned opportunistically.
    /// Returns `Err(Error::DeliveryTimeout)` if any live subscriber's
    /// channel is still full after `timeout` — the event is still handed
    /// to every subscriber that accepted it within the timeout.
    pub fn publish(&self, event: GatewayEvent, timeout: Duration) -> Result<()> {
        let topic = event.topic();
        let senders: Vec<Sender<GatewayEvent>> = {
            let subs = self.subscribers.lock();
            match subs.get(&topic) {
                Some(list) => list.clone(),
                None => return Ok(()),
            }
        };

        let mut any_timeout = false;
        let mut dead = Vec::new();
        for (i, tx) in senders.iter().enumerate() {
            match tx.send_timeout(event.clone(), timeout) {
                Ok(()) => {}
                Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => any_timeout = true,
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => dead.push(i),
            }
        }

        if !dead.is_empty() {
            let mut subs = self.subscribers.lock();
            if let Some(list) = subs.get_mut(&topic) {
                let mut idx = 0;
                list.retain(|_| {
                    let keep = !dead.contains(&idx);
                    idx += 1;
                    keep
                });
            }
        }

        if any_timeout {
            Err(Error::DeliveryTimeout)
        } else {
            Ok(())
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.lock().get(&topic).map_or(0, Vec::len)
    }
}
