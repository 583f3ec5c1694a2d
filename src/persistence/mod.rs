//! NVS-backed persistence for register raw values, config scalars, and
//! energy counters.
//!
//! All keys live in one namespace (`gateway_cfg`) and are flat byte blobs
//! encoded with `postcard`. Real NVS commits are atomic per `nvs_commit`;
//! the host-simulation backend is an in-memory map for tests and
//! non-ESP-IDF builds.

use crate::error::{Error, Result};
use log::{info, warn};
use serde::{de::DeserializeOwned, Serialize};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

const NAMESPACE: &str = "gateway_cfg";
const MAX_BLOB_SIZE: usize = 512;

pub struct Persistence {
    #[cfg(not(target_os = "espidf"))]
    store: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl Persistence {
    /// Initialise the backing NVS partition (or the host simulation map).
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: called once from main-task context before any
            // concurrent NVS access starts.
            let ret = unsafe { nvs_flash_init() };
            if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
                warn!("persistence: erasing and re-initialising NVS partition");
                if unsafe { nvs_flash_erase() } != ESP_OK {
                    return Err(Error::NvsFailure);
                }
                if unsafe { nvs_flash_init() } != ESP_OK {
                    return Err(Error::NvsFailure);
                }
            } else if ret != ESP_OK {
                return Err(Error::NvsFailure);
            }
            info!("persistence: ESP-IDF NVS initialised");
        }

        #[cfg(not(target_os = "espidf"))]
        info!("persistence: simulation backend");

        Ok(Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::sync::Mutex::new(HashMap::new()),
        })
    }

    #[cfg(target_os = "espidf")]
    fn with_nvs_handle<F, T>(write: bool, f: F) -> Result<T>
    where
        F: FnOnce(nvs_handle_t) -> Result<T>,
    {
        let mut ns_buf = [0u8; 16];
        let ns_bytes = NAMESPACE.as_bytes();
        let len = ns_bytes.len().min(15);
        ns_buf[..len].copy_from_slice(&ns_bytes[..len]);

        let mut handle: nvs_handle_t = 0;
        let mode = if write { nvs_open_mode_t_NVS_READWRITE } else { nvs_open_mode_t_NVS_READONLY };
        let ret = unsafe { nvs_open(ns_buf.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(Error::NvsFailure);
        }
        let result = f(handle);
        unsafe { nvs_close(handle) };
        result
    }

    /// Read a raw byte blob, or `None` if the key is absent.
    pub fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        #[cfg(not(target_os = "espidf"))]
        {
            Ok(self.store.lock().unwrap().get(key).cloned())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut key_buf = [0u8; 16];
            let kb = key.as_bytes();
            let kl = kb.len().min(15);
            key_buf[..kl].copy_from_slice(&kb[..kl]);

            let result = Self::with_nvs_handle(false, |handle| {
                let mut size: usize = 0;
                let ret = unsafe { nvs_get_blob(handle, key_buf.as_ptr() as *const _, core::ptr::null_mut(), &mut size) };
                if ret == ESP_ERR_NVS_NOT_FOUND {
                    return Ok(None);
                }
                if ret != ESP_OK || size == 0 || size > MAX_BLOB_SIZE {
                    return Err(Error::NvsFailure);
                }
                let mut buf = vec![0u8; size];
                let ret = unsafe { nvs_get_blob(handle, key_buf.as_ptr() as *const _, buf.as_mut_ptr() as *mut _, &mut size) };
                if ret != ESP_OK {
                    return Err(Error::NvsFailure);
                }
                Ok(Some(buf))
            });
            result
        }
    }

    /// Write a raw byte blob under `key`, committing atomically.
    pub fn write_raw(&self, key: &str, data: &[u8]) -> Result<()> {
        if data.len() > MAX_BLOB_SIZE {
            return Err(Error::InvalidSize);
        }

        #[cfg(not(target_os = "espidf"))]
        {
            self.store.lock().unwrap().insert(key.to_string(), data.to_vec());
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut key_buf = [0u8; 16];
            let kb = key.as_bytes();
            let kl = kb.len().min(15);
            key_buf[..kl].copy_from_slice(&kb[..kl]);

            Self::with_nvs_handle(true, |handle| {
                let ret = unsafe { nvs_set_blob(handle, key_buf.as_ptr() as *const _, data.as_ptr() as *const _, data.len()) };
                if ret != ESP_OK {
                    return Err(Error::NvsFailure);
                }
                if unsafe { nvs_commit(handle) } != ESP_OK {
                    return Err(Error::NvsFailure);
                }
                Ok(())
            })
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        #[cfg(not(target_os = "espidf"))]
        {
            self.store.lock().unwrap().remove(key);
            Ok(())
        }

        #[cfg(target_os = "espidf")]
        {
            let mut key_buf = [0u8; 16];
            let kb = key.as_bytes();
            let kl = kb.len().min(15);
            key_buf[..kl].copy_from_slice(&kb[..kl]);

            Self::with_nvs_handle(true, |handle| {
                let ret = unsafe { nvs_erase_key(handle, key_buf.as_ptr() as *const _) };
                if ret != ESP_OK && ret != ESP_ERR_NVS_NOT_FOUND {
                    return Err(Error::NvsFailure);
                }
                if unsafe { nvs_commit(handle) } != ESP_OK {
                    return Err(Error::NvsFailure);
                }
                Ok(())
            })
        }
    }

    /// Decode a `postcard`-encoded value stored under `key`.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_raw(key)? {
            Some(bytes) => postcard::from_bytes(&bytes).map(Some).map_err(|_| Error::NvsFailure),
            None => Ok(None),
        }
    }

    /// Encode `value` with `postcard` and persist it under `key`.
    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut buf = [0u8; MAX_BLOB_SIZE];
        let bytes = postcard::to_slice(value, &mut buf).map_err(|_| Error::InvalidSize)?;
        self.write_raw(key, bytes)
    }

    /// Persisted raw value for register address `addr`, keyed `reg<HHHH>`.
    pub fn read_register(&self, nvs_key: &str) -> Result<Option<u16>> {
        self.read(nvs_key)
    }

    pub fn write_register(&self, nvs_key: &str, raw: u16) -> Result<()> {
        self.write(nvs_key, &raw)
    }
}

impl Default for Persistence {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            #[cfg(not(target_os = "espidf"))]
            store: std::sync::Mutex::new(HashMap::new()),
        })
    }
}

/// Well-known scalar keys under the `gateway_cfg` namespace.
pub mod keys {
    pub const UART_POLL: &str = "uart_poll";
    pub const MQTT_URI: &str = "mqtt_uri";
    pub const MQTT_USER: &str = "mqtt_user";
    pub const MQTT_PASS: &str = "mqtt_pass";
    pub const MQTT_KEEPALIVE: &str = "mqtt_keepalive";
    pub const MQTT_QOS: &str = "mqtt_qos";
    pub const MQTT_RETAIN: &str = "mqtt_retain";
    pub const MQTT_TLS_CLI: &str = "mqtt_tls_cli";
    pub const MQTT_TLS_CA: &str = "mqtt_tls_ca";
    pub const MQTT_TLS_VRF: &str = "mqtt_tls_vrf";
    pub const MQTT_TOPIC_STATUS: &str = "mqtt_t_stat";
    pub const MQTT_TOPIC_METRICS: &str = "mqtt_t_met";
    pub const MQTT_TOPIC_CONFIG: &str = "mqtt_t_cfg";
    pub const MQTT_TOPIC_CAN_RAW: &str = "mqtt_t_crw";
    pub const MQTT_TOPIC_CAN_DECODED: &str = "mqtt_t_cdc";
    pub const MQTT_TOPIC_CAN_READY: &str = "mqtt_t_crd";
    pub const WIFI_AP_SECRET: &str = "wifi_ap_secret";
    pub const WIFI_STA_SECRET: &str = "wifi_sta_secret";
    pub const ENERGY_CHARGED_WH: &str = "energy_chg_wh";
    pub const ENERGY_DISCHARGED_WH: &str = "energy_dis_wh";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_scalar_value() {
        let store = Persistence::new().unwrap();
        store.write(keys::UART_POLL, &500u32).unwrap();
        let got: Option<u32> = store.read(keys::UART_POLL).unwrap();
        assert_eq!(got, Some(500));
    }

    #[test]
    fn missing_key_reads_as_none() {
        let store = Persistence::new().unwrap();
        let got: Option<u32> = store.read("nope").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn delete_removes_the_key() {
        let store = Persistence::new().unwrap();
        store.write(keys::MQTT_QOS, &1u8).unwrap();
        store.delete(keys::MQTT_QOS).unwrap();
        let got: Option<u8> = store.read(keys::MQTT_QOS).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn register_raw_value_round_trips() {
        let store = Persistence::new().unwrap();
        store.write_register("reg0032", 4242).unwrap();
        assert_eq!(store.read_register("reg0032").unwrap(), Some(4242));
    }

    #[test]
    fn oversized_blob_is_rejected() {
        let store = Persistence::new().unwrap();
        let big = vec![0u8; MAX_BLOB_SIZE + 1];
        assert_eq!(store.write_raw("big", &big).unwrap_err(), Error::InvalidSize);
    }
}
