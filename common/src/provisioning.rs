use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::config::ProvisioningConfig;
use crate::credentials::{Credentials, StoredDevice};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("malformed credential record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },
}

/// 802.11 SSIDs are at most 32 octets.
pub const MAX_SSID_BYTES: usize = 32;
/// WPA2 passphrases are at most 64 characters.
pub const MAX_PASSWORD_BYTES: usize = 64;
/// Owner contact and labels; keeps the stored record well inside one NVS string.
pub const MAX_LABEL_BYTES: usize = 96;

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), IntakeError> {
    if value.len() > max {
        return Err(IntakeError::TooLong { field, max });
    }
    Ok(())
}

/// Credential record delivered by a setup transport. Only the network name
/// and secret are mandatory; absent optional fields keep the stored values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IntakeRecord {
    pub ssid: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub controller_name: Option<String>,
    #[serde(default)]
    pub factory_name: Option<String>,
}

impl IntakeRecord {
    pub fn from_json(payload: &[u8]) -> Result<Self, IntakeError> {
        let record: Self = serde_json::from_slice(payload)?;
        if record.ssid.trim().is_empty() {
            return Err(IntakeError::MissingField("ssid"));
        }
        if record.password.is_empty() {
            return Err(IntakeError::MissingField("password"));
        }
        record.check_lengths()?;
        Ok(record)
    }

    fn check_lengths(&self) -> Result<(), IntakeError> {
        check_len("ssid", self.ssid.trim(), MAX_SSID_BYTES)?;
        check_len("password", &self.password, MAX_PASSWORD_BYTES)?;
        let labels = [
            ("email", &self.email),
            ("controller_name", &self.controller_name),
            ("factory_name", &self.factory_name),
        ];
        for (field, value) in labels {
            if let Some(value) = value {
                check_len(field, value.trim(), MAX_LABEL_BYTES)?;
            }
        }
        Ok(())
    }

    /// Web form submission; every field is required.
    pub fn from_form<'a, I>(fields: I) -> Result<Self, IntakeError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut credentials = Credentials::default();
        for (key, value) in fields {
            let value = value.trim().to_string();
            match key {
                "ssid" => credentials.ssid = value,
                "password" => credentials.password = value,
                "email" => credentials.email = value,
                "controller_name" => credentials.controller_name = value,
                "factory_name" => credentials.factory_name = value,
                _ => {}
            }
        }

        let required = [
            ("ssid", &credentials.ssid),
            ("password", &credentials.password),
            ("email", &credentials.email),
            ("controller_name", &credentials.controller_name),
            ("factory_name", &credentials.factory_name),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(IntakeError::MissingField(name));
            }
        }

        let record = Self {
            ssid: credentials.ssid,
            password: credentials.password,
            email: Some(credentials.email),
            controller_name: Some(credentials.controller_name),
            factory_name: Some(credentials.factory_name),
        };
        record.check_lengths()?;
        Ok(record)
    }

    /// Produces the record to persist. Registration is always reset.
    pub fn merge_into(self, stored: &StoredDevice) -> StoredDevice {
        let previous = &stored.credentials;
        let keep = |incoming: Option<String>, current: &String| {
            incoming
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| current.clone())
        };
        StoredDevice {
            credentials: Credentials {
                email: keep(self.email, &previous.email),
                controller_name: keep(self.controller_name, &previous.controller_name),
                factory_name: keep(self.factory_name, &previous.factory_name),
                ssid: self.ssid.trim().to_string(),
                password: self.password,
            },
            registered: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Unconfigured,
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Idle,
    Pressed,
    Released,
    LongPress,
}

/// Long-press detector sampled once per cycle.
#[derive(Debug, Clone)]
pub struct ResetButton {
    hold_ms: u64,
    pressed_since: Option<u64>,
    fired: bool,
}

impl ResetButton {
    pub fn new(hold_ms: u64) -> Self {
        Self {
            hold_ms,
            pressed_since: None,
            fired: false,
        }
    }

    pub fn poll(&mut self, pressed: bool, now_ms: u64) -> ButtonEvent {
        match (pressed, self.pressed_since) {
            (true, None) => {
                self.pressed_since = Some(now_ms);
                self.fired = false;
                ButtonEvent::Pressed
            }
            (true, Some(since)) => {
                if !self.fired && now_ms.saturating_sub(since) >= self.hold_ms {
                    self.fired = true;
                    ButtonEvent::LongPress
                } else {
                    ButtonEvent::Idle
                }
            }
            (false, Some(_)) => {
                self.pressed_since = None;
                if self.fired {
                    ButtonEvent::Idle
                } else {
                    ButtonEvent::Released
                }
            }
            (false, None) => ButtonEvent::Idle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisioningManager {
    state: ProvisioningState,
    reset_button: ResetButton,
}

impl ProvisioningManager {
    pub fn new(config: &ProvisioningConfig, credentials: &Credentials) -> Self {
        let state = if credentials.has_network() {
            ProvisioningState::Configured
        } else {
            ProvisioningState::Unconfigured
        };
        Self {
            state,
            reset_button: ResetButton::new(config.reset_hold_ms),
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn is_unconfigured(&self) -> bool {
        self.state == ProvisioningState::Unconfigured
    }

    /// Returns true once the reset button has been held long enough to wipe.
    pub fn poll_reset_button(&mut self, pressed: bool, now_ms: u64) -> bool {
        match self.reset_button.poll(pressed, now_ms) {
            ButtonEvent::Pressed => {
                info!("reset button pressed, hold to erase credentials");
                false
            }
            ButtonEvent::Released => {
                info!("reset button released early, erase aborted");
                false
            }
            ButtonEvent::LongPress => {
                warn!("reset button held, erasing credentials");
                true
            }
            ButtonEvent::Idle => false,
        }
    }

    /// Validates an intake record against what is stored. A record without a
    /// usable network name is rejected and logged.
    pub fn accept(&self, record: IntakeRecord, stored: &StoredDevice) -> Option<StoredDevice> {
        let merged = record.merge_into(stored);
        if !merged.credentials.has_network() {
            warn!("credential record rejected: network name or secret empty");
            return None;
        }
        info!(
            "credentials received for network `{}` (complete: {})",
            merged.credentials.ssid,
            merged.credentials.is_complete()
        );
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stored() -> StoredDevice {
        StoredDevice {
            credentials: Credentials {
                ssid: "old".to_string(),
                password: "oldpass".to_string(),
                email: "owner@example.com".to_string(),
                controller_name: "Room A".to_string(),
                factory_name: "Site".to_string(),
            },
            registered: true,
        }
    }

    #[test]
    fn json_record_keeps_stored_optional_fields() {
        let record = IntakeRecord::from_json(br#"{"ssid":"farm-net","password":"s3cret"}"#).unwrap();
        let merged = record.merge_into(&stored());

        assert_eq!(merged.credentials.ssid, "farm-net");
        assert_eq!(merged.credentials.password, "s3cret");
        assert_eq!(merged.credentials.email, "owner@example.com");
        assert!(!merged.registered);
    }

    #[test]
    fn json_record_requires_network_fields() {
        assert!(matches!(
            IntakeRecord::from_json(br#"{"ssid":"","password":"x"}"#),
            Err(IntakeError::MissingField("ssid"))
        ));
        assert!(matches!(
            IntakeRecord::from_json(br#"{"ssid":"a"}"#),
            Err(IntakeError::Malformed(_))
        ));
        assert!(matches!(
            IntakeRecord::from_json(b"ssid=a"),
            Err(IntakeError::Malformed(_))
        ));
    }

    #[test]
    fn form_requires_all_five_fields() {
        let fields = [
            ("ssid", "farm-net"),
            ("password", "s3cret"),
            ("email", "a@b.c"),
            ("controller_name", " "),
            ("factory_name", "Plant"),
        ];
        assert!(matches!(
            IntakeRecord::from_form(fields),
            Err(IntakeError::MissingField("controller_name"))
        ));

        let fields = [
            ("ssid", "farm-net"),
            ("password", "s3cret"),
            ("email", "a@b.c"),
            ("controller_name", "Tent 2"),
            ("factory_name", "Plant"),
        ];
        let merged = IntakeRecord::from_form(fields)
            .unwrap()
            .merge_into(&StoredDevice::default());
        assert!(merged.credentials.is_complete());
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let long_ssid = format!(r#"{{"ssid":"{}","password":"x"}}"#, "s".repeat(33));
        assert!(matches!(
            IntakeRecord::from_json(long_ssid.as_bytes()),
            Err(IntakeError::TooLong { field: "ssid", max: 32 })
        ));
        let long_password = format!(r#"{{"ssid":"net","password":"{}"}}"#, "p".repeat(65));
        assert!(matches!(
            IntakeRecord::from_json(long_password.as_bytes()),
            Err(IntakeError::TooLong { field: "password", .. })
        ));

        let factory = "f".repeat(1_200);
        let fields = [
            ("ssid", "farm-net"),
            ("password", "s3cret"),
            ("email", "a@b.c"),
            ("controller_name", "Tent 2"),
            ("factory_name", factory.as_str()),
        ];
        assert!(matches!(
            IntakeRecord::from_form(fields),
            Err(IntakeError::TooLong { field: "factory_name", .. })
        ));
    }

    #[test]
    fn longest_accepted_record_fits_one_nvs_string() {
        let label = "l".repeat(MAX_LABEL_BYTES);
        let ssid = "s".repeat(MAX_SSID_BYTES);
        let password = "p".repeat(MAX_PASSWORD_BYTES);
        let fields = [
            ("ssid", ssid.as_str()),
            ("password", password.as_str()),
            ("email", label.as_str()),
            ("controller_name", label.as_str()),
            ("factory_name", label.as_str()),
        ];
        let stored = IntakeRecord::from_form(fields)
            .unwrap()
            .merge_into(&StoredDevice::default());
        assert!(stored.to_json().unwrap().len() < 1_024);
    }

    #[test]
    fn reset_button_fires_once_after_hold() {
        let mut button = ResetButton::new(3_000);
        assert_eq!(button.poll(true, 1_000), ButtonEvent::Pressed);
        assert_eq!(button.poll(true, 3_999), ButtonEvent::Idle);
        assert_eq!(button.poll(true, 4_000), ButtonEvent::LongPress);
        assert_eq!(button.poll(true, 9_000), ButtonEvent::Idle);
        assert_eq!(button.poll(false, 9_100), ButtonEvent::Idle);
    }

    #[test]
    fn short_press_aborts() {
        let mut button = ResetButton::new(3_000);
        button.poll(true, 0);
        assert_eq!(button.poll(false, 2_000), ButtonEvent::Released);
        assert_eq!(button.poll(true, 2_500), ButtonEvent::Pressed);
        assert_eq!(button.poll(true, 5_000), ButtonEvent::Idle);
    }

    #[test]
    fn configured_only_with_network_credentials() {
        let config = ProvisioningConfig::default();
        assert!(ProvisioningManager::new(&config, &Credentials::default()).is_unconfigured());
        assert_eq!(
            ProvisioningManager::new(&config, &stored().credentials).state(),
            ProvisioningState::Configured
        );
    }
}
