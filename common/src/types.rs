use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    #[default]
    Normal,
    Override,
}

impl DeviceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Override => "override",
        }
    }

    /// Single-letter code used by the compact wire format.
    pub fn as_char(self) -> char {
        match self {
            Self::Normal => 'n',
            Self::Override => 'p',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actuator {
    Humidifier1,
    Humidifier2,
    Fan1,
    Fan2,
    Buzzer,
}

impl Actuator {
    pub const ALL: [Actuator; 5] = [
        Self::Humidifier1,
        Self::Humidifier2,
        Self::Fan1,
        Self::Fan2,
        Self::Buzzer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Humidifier1 => "humidifier1",
            Self::Humidifier2 => "humidifier2",
            Self::Fan1 => "fan1",
            Self::Fan2 => "fan2",
            Self::Buzzer => "buzzer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub humidifier1: bool,
    pub humidifier2: bool,
    pub fan1: bool,
    pub fan2: bool,
    pub buzzer: bool,
}

impl Default for ActuatorState {
    /// Boot state: primary fan running, everything else off.
    fn default() -> Self {
        Self {
            humidifier1: false,
            humidifier2: false,
            fan1: true,
            fan2: false,
            buzzer: false,
        }
    }
}

impl ActuatorState {
    pub fn get(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Humidifier1 => self.humidifier1,
            Actuator::Humidifier2 => self.humidifier2,
            Actuator::Fan1 => self.fan1,
            Actuator::Fan2 => self.fan2,
            Actuator::Buzzer => self.buzzer,
        }
    }

    pub fn set(&mut self, actuator: Actuator, on: bool) {
        let slot = match actuator {
            Actuator::Humidifier1 => &mut self.humidifier1,
            Actuator::Humidifier2 => &mut self.humidifier2,
            Actuator::Fan1 => &mut self.fan1,
            Actuator::Fan2 => &mut self.fan2,
            Actuator::Buzzer => &mut self.buzzer,
        };
        *slot = on;
    }

    /// Outputs whose level differs between `self` and `next`, with the new level.
    pub fn changes_to(&self, next: &ActuatorState) -> Vec<(Actuator, bool)> {
        Actuator::ALL
            .into_iter()
            .filter(|actuator| self.get(*actuator) != next.get(*actuator))
            .map(|actuator| (actuator, next.get(actuator)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

impl ClimateReading {
    pub fn is_plausible(&self) -> bool {
        self.temperature_c.is_finite()
            && self.humidity_pct.is_finite()
            && (-40.0..=80.0).contains(&self.temperature_c)
            && (0.0..=100.0).contains(&self.humidity_pct)
    }
}

/// Latest acquisition snapshot. Invalid climate values are reported as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub water_level_pct: f32,
    pub light_pct: f32,
    pub climate_valid: bool,
    pub water_valid: bool,
    pub consecutive_failures: u32,
}

impl Default for SensorSample {
    fn default() -> Self {
        Self {
            temperature_c: 0.0,
            humidity_pct: 0.0,
            water_level_pct: 0.0,
            light_pct: 0.0,
            climate_valid: false,
            water_valid: false,
            consecutive_failures: 0,
        }
    }
}

impl SensorSample {
    pub fn climate(&self) -> Option<ClimateReading> {
        self.climate_valid.then_some(ClimateReading {
            temperature_c: self.temperature_c,
            humidity_pct: self.humidity_pct,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPattern {
    SensorFault,
    SensorRecovered,
    Critical,
    WaterEmpty,
}

impl AlertPattern {
    /// Beep schedule as (on_ms, off_ms) pairs.
    pub fn steps(self) -> &'static [(u64, u64)] {
        match self {
            Self::SensorFault => &[(200, 200), (200, 200), (200, 200)],
            Self::SensorRecovered => &[(100, 0)],
            Self::Critical => &[(3_000, 0)],
            Self::WaterEmpty => &[(200, 200), (200, 0)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    CredentialsSaved,
    FactoryReset,
    SensorFailure,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialsSaved => "credentials saved",
            Self::FactoryReset => "factory reset",
            Self::SensorFailure => "sensor failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    Restart(RestartReason),
}

/// Fixed-interval trigger driven by the caller's monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    interval_ms: u64,
    next_due_ms: u64,
}

impl Cadence {
    pub fn new(interval_ms: u64, first_due_ms: u64) -> Self {
        Self {
            interval_ms,
            next_due_ms: first_due_ms,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_due_ms
    }

    /// Returns true and re-arms when due.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.next_due_ms = now_ms.saturating_add(self.interval_ms);
        true
    }

    pub fn restart(&mut self, now_ms: u64) {
        self.next_due_ms = now_ms.saturating_add(self.interval_ms);
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }
}

/// Snapshot served by the local setup surface.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub controller_id: String,
    pub device_name: String,
    pub ssid: String,
    pub email: String,
    pub controller_name: String,
    pub factory_name: String,
    pub registered: bool,
    pub provisioning: bool,
    pub wifi_status: &'static str,
    pub mqtt_status: &'static str,
    pub mode: DeviceMode,
    pub override_remaining_seconds: u64,
    pub alarm_active: bool,
    pub actuators: ActuatorState,
    pub sample: SensorSample,
    pub thresholds: crate::thresholds::ThresholdSet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reports_only_changed_outputs() {
        let current = ActuatorState::default();
        let mut next = current;
        next.humidifier1 = true;
        next.fan2 = true;

        assert_eq!(
            current.changes_to(&next),
            vec![(Actuator::Humidifier1, true), (Actuator::Fan2, true)]
        );
        assert!(next.changes_to(&next).is_empty());
    }

    #[test]
    fn cadence_rearms_from_fire_time() {
        let mut cadence = Cadence::new(10_000, 5_000);
        assert!(!cadence.fire(4_999));
        assert!(cadence.fire(5_200));
        assert_eq!(cadence.next_due_ms(), 15_200);
        assert!(!cadence.fire(15_000));
        assert!(cadence.fire(15_200));
    }

    #[test]
    fn climate_values_hidden_when_invalid() {
        let sample = SensorSample {
            temperature_c: 24.0,
            humidity_pct: 81.0,
            ..SensorSample::default()
        };
        assert_eq!(sample.climate(), None);
    }
}
