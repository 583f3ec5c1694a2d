//! Config manager: typed, immutable snapshots of device/uart/wifi/can/mqtt
//! settings, persisted to NVS, exported as masked/unmasked JSON, and
//! re-published on every successful change.
//!
//! All setters take the process-wide config mutex, validate and clamp,
//! persist, rebuild the JSON snapshots, publish `config_updated`, then
//! release the mutex — see [`ConfigManager::apply_json`] and
//! [`ConfigManager::set_device_name`] for the two shapes that sequence
//! takes.

use crate::error::{Error, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::persistence::{keys, Persistence};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const SECRET_MASK: &str = "********";
const DEFAULT_CONFIG_MUTEX_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UartSettings {
    pub tx_gpio: i8,
    pub rx_gpio: i8,
    pub poll_interval_ms: u32,
    pub poll_interval_min_ms: u32,
    pub poll_interval_max_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiStaSettings {
    pub ssid: String,
    pub password: String,
    pub hostname: String,
    pub max_retry: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiApSettings {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_clients: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiSettings {
    pub sta: WifiStaSettings,
    pub ap: WifiApSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanTwaiSettings {
    pub tx_gpio: i8,
    pub rx_gpio: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanKeepaliveSettings {
    pub interval_ms: u32,
    pub timeout_ms: u32,
    pub retry_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanPublisherSettings {
    pub period_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanIdentitySettings {
    pub handshake_ascii: String,
    pub manufacturer: String,
    pub battery_name: String,
    pub battery_family: String,
    pub serial_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanSettings {
    pub twai: CanTwaiSettings,
    pub keepalive: CanKeepaliveSettings,
    pub publisher: CanPublisherSettings,
    pub identity: CanIdentitySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttTopics {
    pub status: String,
    pub metrics: String,
    pub config: String,
    pub can_raw: String,
    pub can_decoded: String,
    pub can_ready: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub scheme: String,
    pub broker_uri: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_cert_path: String,
    pub ca_cert_path: String,
    pub verify_hostname: bool,
    pub keepalive: u32,
    pub default_qos: u8,
    pub retain: bool,
    pub topics: MqttTopics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub device: DeviceSettings,
    pub uart: UartSettings,
    pub wifi: WifiSettings,
    pub can: CanSettings,
    pub mqtt: MqttSettings,
}

fn default_topics(device_name: &str) -> MqttTopics {
    MqttTopics {
        status: format!("{device_name}/status"),
        metrics: format!("{device_name}/metrics"),
        config: format!("{device_name}/config"),
        can_raw: format!("{device_name}/can/raw"),
        can_decoded: format!("{device_name}/can/decoded"),
        can_ready: format!("{device_name}/can/ready"),
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        let device_name = "gateway".to_string();
        Self {
            uart: UartSettings { tx_gpio: 17, rx_gpio: 16, poll_interval_ms: 500, poll_interval_min_ms: 100, poll_interval_max_ms: 60_000 },
            wifi: WifiSettings {
                sta: WifiStaSettings { ssid: String::new(), password: String::new(), hostname: device_name.clone(), max_retry: 5 },
                ap: WifiApSettings { ssid: format!("{device_name}-setup"), password: String::new(), channel: 6, max_clients: 4 },
            },
            can: CanSettings {
                twai: CanTwaiSettings { tx_gpio: 4, rx_gpio: 5 },
                keepalive: CanKeepaliveSettings { interval_ms: 1_000, timeout_ms: 5_000, retry_ms: 1_000 },
                publisher: CanPublisherSettings { period_ms: 1_000 },
                identity: CanIdentitySettings {
                    handshake_ascii: "VICTRON".to_string(),
                    manufacturer: "Acme".to_string(),
                    battery_name: device_name.clone(),
                    battery_family: "tinybms".to_string(),
                    serial_number: String::new(),
                },
            },
            mqtt: MqttSettings {
                scheme: "mqtt".to_string(),
                broker_uri: String::new(),
                host: String::new(),
                port: 1883,
                username: String::new(),
                password: String::new(),
                client_cert_path: String::new(),
                ca_cert_path: String::new(),
                verify_hostname: true,
                keepalive: 60,
                default_qos: 0,
                retain: false,
                topics: default_topics(&device_name),
            },
            device: DeviceSettings { name: device_name },
        }
    }
}

fn mask_secrets(mut cfg: SystemConfig) -> SystemConfig {
    cfg.wifi.sta.password = SECRET_MASK.to_string();
    cfg.wifi.ap.password = SECRET_MASK.to_string();
    cfg.mqtt.password = SECRET_MASK.to_string();
    cfg
}

fn validate_and_clamp(cfg: &mut SystemConfig) -> Result<()> {
    if cfg.device.name.is_empty() || cfg.device.name.len() > 32 {
        return Err(Error::InvalidArgument);
    }
    if !(-1..=48).contains(&cfg.uart.tx_gpio) || !(-1..=48).contains(&cfg.uart.rx_gpio) {
        return Err(Error::InvalidArgument);
    }
    cfg.uart.poll_interval_ms = cfg.uart.poll_interval_ms.clamp(cfg.uart.poll_interval_min_ms, cfg.uart.poll_interval_max_ms);

    if cfg.wifi.sta.max_retry > 255 {
        return Err(Error::InvalidArgument);
    }
    if !(1..=13).contains(&cfg.wifi.ap.channel) {
        return Err(Error::InvalidArgument);
    }
    if !(1..=10).contains(&cfg.wifi.ap.max_clients) {
        return Err(Error::InvalidArgument);
    }

    if !(-1..=39).contains(&cfg.can.twai.tx_gpio) || !(-1..=39).contains(&cfg.can.twai.rx_gpio) {
        return Err(Error::InvalidArgument);
    }
    if !(10..=600_000).contains(&cfg.can.keepalive.interval_ms) {
        return Err(Error::InvalidArgument);
    }
    if !(100..=600_000).contains(&cfg.can.keepalive.timeout_ms) {
        return Err(Error::InvalidArgument);
    }
    if !(10..=600_000).contains(&cfg.can.keepalive.retry_ms) {
        return Err(Error::InvalidArgument);
    }
    if cfg.can.publisher.period_ms > 600_000 {
        return Err(Error::InvalidArgument);
    }

    if cfg.mqtt.default_qos > 2 {
        return Err(Error::InvalidArgument);
    }
    for topic in [&cfg.mqtt.topics.status, &cfg.mqtt.topics.metrics, &cfg.mqtt.topics.config, &cfg.mqtt.topics.can_raw, &cfg.mqtt.topics.can_decoded, &cfg.mqtt.topics.can_ready] {
        if topic.len() > 96 {
            return Err(Error::InvalidArgument);
        }
    }
    Ok(())
}

/// If `topic` still equals the default for `old_name`, rewrite it to the
/// default for `new_name`; a custom topic the operator set is preserved.
fn rewrite_topic_if_default(topic: &mut String, old_name: &str, new_name: &str, suffix: &str) {
    let old_default = format!("{old_name}/{suffix}");
    if *topic == old_default {
        *topic = format!("{new_name}/{suffix}");
    }
}

pub struct ConfigManager {
    state: Mutex<SystemConfig>,
    public_json: Mutex<Arc<str>>,
    persistence: Arc<Persistence>,
    events: Arc<EventBus>,
}

impl ConfigManager {
    pub fn new(persistence: Arc<Persistence>, events: Arc<EventBus>) -> Self {
        let mut cfg = SystemConfig::default();
        Self::overlay_persisted(&mut cfg, &persistence);
        let public = serde_json::to_string(&mask_secrets(cfg.clone())).unwrap_or_default();
        Self { state: Mutex::new(cfg), public_json: Mutex::new(Arc::from(public)), persistence, events }
    }

    fn overlay_persisted(cfg: &mut SystemConfig, persistence: &Persistence) {
        if let Ok(Some(v)) = persistence.read::<u32>(keys::UART_POLL) {
            cfg.uart.poll_interval_ms = v.clamp(cfg.uart.poll_interval_min_ms, cfg.uart.poll_interval_max_ms);
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_URI) {
            cfg.mqtt.broker_uri = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_USER) {
            cfg.mqtt.username = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_PASS) {
            cfg.mqtt.password = v;
        }
        if let Ok(Some(v)) = persistence.read::<u32>(keys::MQTT_KEEPALIVE) {
            cfg.mqtt.keepalive = v;
        }
        if let Ok(Some(v)) = persistence.read::<u8>(keys::MQTT_QOS) {
            cfg.mqtt.default_qos = v.min(2);
        }
        if let Ok(Some(v)) = persistence.read::<bool>(keys::MQTT_RETAIN) {
            cfg.mqtt.retain = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TOPIC_STATUS) {
            cfg.mqtt.topics.status = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TOPIC_METRICS) {
            cfg.mqtt.topics.metrics = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TOPIC_CONFIG) {
            cfg.mqtt.topics.config = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TOPIC_CAN_RAW) {
            cfg.mqtt.topics.can_raw = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TOPIC_CAN_DECODED) {
            cfg.mqtt.topics.can_decoded = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TOPIC_CAN_READY) {
            cfg.mqtt.topics.can_ready = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::WIFI_STA_SECRET) {
            cfg.wifi.sta.password = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::WIFI_AP_SECRET) {
            cfg.wifi.ap.password = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TLS_CLI) {
            cfg.mqtt.client_cert_path = v;
        }
        if let Ok(Some(v)) = persistence.read::<String>(keys::MQTT_TLS_CA) {
            cfg.mqtt.ca_cert_path = v;
        }
        if let Ok(Some(v)) = persistence.read::<bool>(keys::MQTT_TLS_VRF) {
            cfg.mqtt.verify_hostname = v;
        }
    }

    /// Immutable snapshot of the current settings.
    pub fn snapshot(&self) -> SystemConfig {
        self.state.lock().clone()
    }

    /// Public JSON (secrets masked as `"********"`).
    pub fn public_json(&self) -> Arc<str> {
        self.public_json.lock().clone()
    }

    /// Full JSON, including real secret values. Not published, not logged.
    pub fn full_json(&self) -> Result<String> {
        serde_json::to_string(&*self.state.lock()).map_err(|_| Error::Io)
    }

    fn persist_all(&self, cfg: &SystemConfig) -> Result<()> {
        self.persistence.write(keys::UART_POLL, &cfg.uart.poll_interval_ms).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_URI, &cfg.mqtt.broker_uri).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_USER, &cfg.mqtt.username).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_PASS, &cfg.mqtt.password).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_KEEPALIVE, &cfg.mqtt.keepalive).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_QOS, &cfg.mqtt.default_qos).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_RETAIN, &cfg.mqtt.retain).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TOPIC_STATUS, &cfg.mqtt.topics.status).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TOPIC_METRICS, &cfg.mqtt.topics.metrics).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TOPIC_CONFIG, &cfg.mqtt.topics.config).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TOPIC_CAN_RAW, &cfg.mqtt.topics.can_raw).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TOPIC_CAN_DECODED, &cfg.mqtt.topics.can_decoded).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TOPIC_CAN_READY, &cfg.mqtt.topics.can_ready).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::WIFI_STA_SECRET, &cfg.wifi.sta.password).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::WIFI_AP_SECRET, &cfg.wifi.ap.password).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TLS_CLI, &cfg.mqtt.client_cert_path).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TLS_CA, &cfg.mqtt.ca_cert_path).map_err(|_| Error::NvsFailure)?;
        self.persistence.write(keys::MQTT_TLS_VRF, &cfg.mqtt.verify_hostname).map_err(|_| Error::NvsFailure)?;
        Ok(())
    }

    /// The six-step setter sequence, generic over a mutation closure. On a
    /// persistence failure the in-memory state is rolled back so the
    /// snapshot never advertises an unpersisted value.
    fn apply<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut SystemConfig) -> Result<()>,
    {
        let mut guard = self.state.lock();
        let before = guard.clone();

        mutate(&mut guard)?;
        validate_and_clamp(&mut guard)?;

        if let Err(e) = self.persist_all(&guard) {
            *guard = before;
            return Err(e);
        }

        let public = serde_json::to_string(&mask_secrets(guard.clone())).unwrap_or_default();
        let public: Arc<str> = Arc::from(public);
        *self.public_json.lock() = public.clone();

        drop(guard);
        self.events.publish(GatewayEvent::ConfigUpdated { public_json: public }, DEFAULT_CONFIG_MUTEX_TIMEOUT)?;
        Ok(())
    }

    /// Rename the device, rewriting MQTT topics that still match the
    /// defaults for the old name.
    pub fn set_device_name(&self, new_name: &str) -> Result<()> {
        let new_name = new_name.to_string();
        self.apply(|cfg| {
            let old_name = cfg.device.name.clone();
            rewrite_topic_if_default(&mut cfg.mqtt.topics.status, &old_name, &new_name, "status");
            rewrite_topic_if_default(&mut cfg.mqtt.topics.metrics, &old_name, &new_name, "metrics");
            rewrite_topic_if_default(&mut cfg.mqtt.topics.config, &old_name, &new_name, "config");
            rewrite_topic_if_default(&mut cfg.mqtt.topics.can_raw, &old_name, &new_name, "can/raw");
            rewrite_topic_if_default(&mut cfg.mqtt.topics.can_decoded, &old_name, &new_name, "can/decoded");
            rewrite_topic_if_default(&mut cfg.mqtt.topics.can_ready, &old_name, &new_name, "can/ready");
            cfg.device.name = new_name.clone();
            Ok(())
        })
    }

    pub fn set_uart_poll_interval_ms(&self, requested_ms: u32) -> Result<()> {
        self.apply(|cfg| {
            cfg.uart.poll_interval_ms = requested_ms;
            Ok(())
        })
    }

    /// Parse `json` as a full or partial [`SystemConfig`] and apply it —
    /// the sole code path; there is no parse-without-apply branch.
    pub fn apply_json(&self, json: &str) -> Result<()> {
        let parsed: SystemConfig = serde_json::from_str(json).map_err(|_| Error::InvalidArgument)?;
        self.apply(move |cfg| {
            *cfg = parsed.clone();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConfigManager {
        let persistence = Arc::new(Persistence::new().unwrap());
        let events = Arc::new(EventBus::new());
        ConfigManager::new(persistence, events)
    }

    #[test]
    fn default_config_passes_validation() {
        let mut cfg = SystemConfig::default();
        assert!(validate_and_clamp(&mut cfg).is_ok());
    }

    #[test]
    fn scenario_9_device_rename_rewrites_default_topics_and_masks_password() {
        let mgr = manager();
        mgr.set_device_name("gw-42").unwrap();
        let snap = mgr.snapshot();
        assert_eq!(snap.mqtt.topics.status, "gw-42/status");

        let public = mgr.public_json();
        assert!(public.contains("\"password\":\"********\""));

        let full = mgr.full_json().unwrap();
        assert!(!full.contains("********"));
    }

    #[test]
    fn custom_topic_survives_rename() {
        let mgr = manager();
        mgr.apply_json(r#"{"device":{"name":"gateway"},"uart":{"tx_gpio":17,"rx_gpio":16,"poll_interval_ms":500,"poll_interval_min_ms":100,"poll_interval_max_ms":60000},"wifi":{"sta":{"ssid":"","password":"","hostname":"gateway","max_retry":5},"ap":{"ssid":"gateway-setup","password":"","channel":6,"max_clients":4}},"can":{"twai":{"tx_gpio":4,"rx_gpio":5},"keepalive":{"interval_ms":1000,"timeout_ms":5000,"retry_ms":1000},"publisher":{"period_ms":1000},"identity":{"handshake_ascii":"VICTRON","manufacturer":"Acme","battery_name":"gateway","battery_family":"tinybms","serial_number":""}},"mqtt":{"scheme":"mqtt","broker_uri":"","host":"","port":1883,"username":"","password":"","client_cert_path":"","ca_cert_path":"","verify_hostname":true,"keepalive":60,"default_qos":0,"retain":false,"topics":{"status":"custom/topic","metrics":"gateway/metrics","config":"gateway/config","can_raw":"gateway/can/raw","can_decoded":"gateway/can/decoded","can_ready":"gateway/can/ready"}}}"#).unwrap();
        mgr.set_device_name("gw-42").unwrap();
        let snap = mgr.snapshot();
        assert_eq!(snap.mqtt.topics.status, "custom/topic");
        assert_eq!(snap.mqtt.topics.metrics, "gw-42/metrics");
    }

    #[test]
    fn invalid_gpio_is_rejected() {
        let mgr = manager();
        let err = mgr.apply(|cfg| {
            cfg.uart.tx_gpio = 99;
            Ok(())
        }).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn poll_interval_is_clamped_not_rejected() {
        let mgr = manager();
        mgr.set_uart_poll_interval_ms(10).unwrap();
        assert_eq!(mgr.snapshot().uart.poll_interval_ms, 100);
    }

    #[test]
    fn ap_and_sta_secrets_and_tls_paths_survive_a_restart() {
        let persistence = Arc::new(Persistence::new().unwrap());
        let events = Arc::new(EventBus::new());
        let mgr = ConfigManager::new(persistence.clone(), events.clone());
        mgr.apply(|cfg| {
            cfg.wifi.sta.password = "sta-secret".to_string();
            cfg.wifi.ap.password = "ap-secret".to_string();
            cfg.mqtt.client_cert_path = "/nvs/client.pem".to_string();
            cfg.mqtt.ca_cert_path = "/nvs/ca.pem".to_string();
            cfg.mqtt.verify_hostname = false;
            Ok(())
        })
        .unwrap();

        let restarted = ConfigManager::new(persistence, events);
        let snap = restarted.snapshot();
        assert_eq!(snap.wifi.sta.password, "sta-secret");
        assert_eq!(snap.wifi.ap.password, "ap-secret");
        assert_eq!(snap.mqtt.client_cert_path, "/nvs/client.pem");
        assert_eq!(snap.mqtt.ca_cert_path, "/nvs/ca.pem");
        assert!(!snap.mqtt.verify_hostname);
    }
}
