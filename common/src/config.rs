use serde::{Deserialize, Serialize};

use crate::telemetry::WireFormat;
use crate::thresholds::{Bounds, ThresholdSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub name_prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name_prefix: "ESP32".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub reset_hold_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "Millometer-Setup".to_string(),
            ap_password: "setup1234".to_string(),
            reset_hold_ms: 3_000,
            restart_delay_ms: 750,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub initial_connect_timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub fast_retry_interval_ms: u64,
    pub fast_retry_window_ms: u64,
    pub slow_retry_interval_ms: u64,
    pub session_deadline_ms: u64,
    pub session_retry_delay_ms: u64,
    pub session_max_attempts: u32,
    pub session_cooldown_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            initial_connect_timeout_ms: 20_000,
            reconnect_timeout_ms: 8_000,
            fast_retry_interval_ms: 30_000,
            fast_retry_window_ms: 300_000,
            slow_retry_interval_ms: 300_000,
            session_deadline_ms: 5_000,
            session_retry_delay_ms: 500,
            session_max_attempts: 5,
            session_cooldown_ms: 30_000,
        }
    }
}

impl ConnectivityConfig {
    pub fn sanitize(&mut self) {
        self.initial_connect_timeout_ms = self.initial_connect_timeout_ms.max(1_000);
        self.reconnect_timeout_ms = self.reconnect_timeout_ms.max(1_000);
        self.fast_retry_interval_ms = self.fast_retry_interval_ms.max(1_000);
        self.slow_retry_interval_ms = self.slow_retry_interval_ms.max(self.fast_retry_interval_ms);
        self.session_deadline_ms = self.session_deadline_ms.max(500);
        self.session_max_attempts = self.session_max_attempts.max(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "api.milloserver.uk".to_string(),
            port: 8883,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub registration_url: String,
    pub thresholds_url: String,
    pub request_timeout_ms: u64,
    pub registration_retry_ms: u64,
    pub threshold_refresh_ms: u64,
    pub temperature_slot: i32,
    pub humidity_slot: i32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            registration_url: "https://api.milloserver.uk/api/controller/register-user".to_string(),
            thresholds_url: "https://api.milloserver.uk/api/controller-thresholds".to_string(),
            request_timeout_ms: 6_000,
            registration_retry_ms: 60_000,
            threshold_refresh_ms: 10_000,
            temperature_slot: 2,
            humidity_slot: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sample_interval_ms: u64,
    pub read_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub reinit_after_failures: u32,
    pub restart_after_failures: u32,
    pub reinit_min_interval_ms: u64,
    pub reinit_settle_ms: u64,
    pub fault_alert_interval_ms: u64,
    pub water_settle_ms: u64,
    pub water_fallback_pct: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 10_000,
            read_attempts: 3,
            read_retry_delay_ms: 2_500,
            reinit_after_failures: 3,
            restart_after_failures: 10,
            reinit_min_interval_ms: 5_000,
            reinit_settle_ms: 3_000,
            fault_alert_interval_ms: 30_000,
            water_settle_ms: 100,
            water_fallback_pct: 100.0,
        }
    }
}

impl SensorConfig {
    pub fn sanitize(&mut self) {
        // DHT22 cannot be sampled faster than every two seconds.
        self.sample_interval_ms = self.sample_interval_ms.max(2_000);
        self.read_attempts = self.read_attempts.clamp(1, 10);
        self.reinit_after_failures = self.reinit_after_failures.clamp(1, u32::MAX - 1);
        if self.restart_after_failures <= self.reinit_after_failures {
            self.restart_after_failures = self.reinit_after_failures.saturating_add(1);
        }
        self.water_fallback_pct = self.water_fallback_pct.clamp(0.0, 100.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub defaults: ThresholdSet,
    pub override_humidity: Bounds,
    pub temperature_ceiling_c: f32,
    pub water_low_pct: f32,
    pub water_high_pct: Option<f32>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            defaults: ThresholdSet::default(),
            override_humidity: Bounds::new(90.0, 95.0),
            temperature_ceiling_c: 30.0,
            water_low_pct: 30.0,
            water_high_pct: None,
        }
    }
}

impl ControlConfig {
    pub fn sanitize(&mut self) {
        self.defaults.temperature.bounds.sanitize();
        self.defaults.humidity.bounds.sanitize();
        self.override_humidity.sanitize();
        self.water_low_pct = self.water_low_pct.clamp(0.0, 100.0);
        if let Some(high) = self.water_high_pct {
            if high <= self.water_low_pct {
                self.water_high_pct = None;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub countdown_interval_ms: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            countdown_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub format: WireFormat,
    pub publish_interval_ms: u64,
    pub first_publish_delay_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::Json,
            publish_interval_ms: 10_000,
            first_publish_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub period_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period_ms: 250,
            inbox_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub identity: IdentityConfig,
    pub provisioning: ProvisioningConfig,
    pub connectivity: ConnectivityConfig,
    pub broker: BrokerConfig,
    pub backend: BackendConfig,
    pub sensors: SensorConfig,
    pub control: ControlConfig,
    pub mode: ModeConfig,
    pub telemetry: TelemetryConfig,
    pub cycle: CycleConfig,
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.connectivity.sanitize();
        self.sensors.sanitize();
        self.control.sanitize();
        self.backend.request_timeout_ms = self.backend.request_timeout_ms.max(1_000);
        self.backend.registration_retry_ms = self.backend.registration_retry_ms.max(1_000);
        self.mode.countdown_interval_ms = self.mode.countdown_interval_ms.max(1_000);
        self.telemetry.publish_interval_ms = self.telemetry.publish_interval_ms.max(1_000);
        self.cycle.period_ms = self.cycle.period_ms.clamp(10, 5_000);
        self.cycle.inbox_capacity = self.cycle.inbox_capacity.clamp(1, 256);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"telemetry":{"format":"compact"},"broker":{"port":1883}}"#)
                .unwrap();

        assert_eq!(config.telemetry.format, WireFormat::Compact);
        assert_eq!(config.telemetry.publish_interval_ms, 10_000);
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.host, "api.milloserver.uk");
        assert_eq!(config.connectivity.reconnect_timeout_ms, 8_000);
    }

    #[test]
    fn sanitize_repairs_escalation_order() {
        let mut config = DeviceConfig::default();
        config.sensors.reinit_after_failures = 6;
        config.sensors.restart_after_failures = 4;
        config.control.override_humidity = Bounds::new(95.0, 90.0);
        config.control.water_high_pct = Some(10.0);
        config.sanitize();

        assert_eq!(config.sensors.restart_after_failures, 7);
        assert_eq!(config.control.override_humidity, Bounds::new(90.0, 95.0));
        assert_eq!(config.control.water_high_pct, None);
    }

    #[test]
    fn sanitize_handles_saturated_failure_counts() {
        let mut config = DeviceConfig::default();
        config.sensors.reinit_after_failures = u32::MAX;
        config.sensors.restart_after_failures = u32::MAX;
        config.sanitize();

        assert_eq!(config.sensors.reinit_after_failures, u32::MAX - 1);
        assert_eq!(config.sensors.restart_after_failures, u32::MAX);
    }
}
