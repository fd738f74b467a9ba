use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
    pub email: String,
    pub controller_name: String,
    pub factory_name: String,
}

impl Credentials {
    /// Enough to join the network.
    pub fn has_network(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }

    /// Enough to register with the backend.
    pub fn is_complete(&self) -> bool {
        self.has_network()
            && !self.email.is_empty()
            && !self.controller_name.is_empty()
            && !self.factory_name.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"********")
            .field("email", &self.email)
            .field("controller_name", &self.controller_name)
            .field("factory_name", &self.factory_name)
            .finish()
    }
}

/// Persisted device record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDevice {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default)]
    pub registered: bool,
}

impl StoredDevice {
    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Non-volatile key/value persistence for the device record.
///
/// `load` on a blank store returns the default (unconfigured) record.
pub trait CredentialStore {
    fn load(&self) -> Result<StoredDevice, StoreError>;
    fn save(&self, device: &StoredDevice) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// Volatile store holding the serialized record, as flash would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    raw: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(device: &StoredDevice) -> Result<Self, StoreError> {
        Ok(Self {
            raw: Mutex::new(Some(device.to_json()?)),
        })
    }

    pub fn is_blank(&self) -> bool {
        self.raw.lock().map(|raw| raw.is_none()).unwrap_or(true)
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Result<StoredDevice, StoreError> {
        let raw = self
            .raw
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        match raw.as_deref() {
            Some(raw) => StoredDevice::from_json(raw),
            None => Ok(StoredDevice::default()),
        }
    }

    fn save(&self, device: &StoredDevice) -> Result<(), StoreError> {
        let encoded = device.to_json()?;
        let mut raw = self
            .raw
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        *raw = Some(encoded);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut raw = self
            .raw
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        *raw = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Credentials {
        Credentials {
            ssid: "greenhouse".to_string(),
            password: "hunter22".to_string(),
            email: "ops@example.com".to_string(),
            controller_name: "Room A".to_string(),
            factory_name: "North Site".to_string(),
        }
    }

    #[test]
    fn completeness_levels() {
        let mut credentials = sample();
        assert!(credentials.is_complete());

        credentials.factory_name.clear();
        assert!(credentials.has_network());
        assert!(!credentials.is_complete());

        credentials.password.clear();
        assert!(!credentials.has_network());
    }

    #[test]
    fn debug_output_masks_password() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains("hunter22"));
        assert!(rendered.contains("greenhouse"));
    }

    #[test]
    fn record_uses_flat_keys() {
        let device = StoredDevice {
            credentials: sample(),
            registered: true,
        };
        let value: serde_json::Value = serde_json::from_str(&device.to_json().unwrap()).unwrap();
        assert_eq!(value["ssid"], "greenhouse");
        assert_eq!(value["reg"], serde_json::Value::Null);
        assert_eq!(value["registered"], true);
    }

    #[test]
    fn memory_store_round_trip_and_wipe() {
        let store = MemoryStore::new();
        assert_eq!(store.load().unwrap(), StoredDevice::default());

        let device = StoredDevice {
            credentials: sample(),
            registered: false,
        };
        store.save(&device).unwrap();
        assert_eq!(store.load().unwrap(), device);

        store.clear().unwrap();
        assert!(store.is_blank());
        assert!(!store.load().unwrap().credentials.has_network());
    }
}
