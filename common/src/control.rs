use log::{info, warn};
use serde::Serialize;

use crate::config::ControlConfig;
use crate::thresholds::{Band, Bounds, ThresholdSet};
use crate::types::{Actuator, ActuatorState, ClimateReading, DeviceMode, SensorSample};

/// Bounds in force for one evaluation, after mode selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlBounds {
    pub humidity: Bounds,
    pub temperature_ceiling_c: f32,
    pub water_low_pct: f32,
    pub water_high_pct: Option<f32>,
}

impl ControlBounds {
    pub fn select(config: &ControlConfig, thresholds: &ThresholdSet, mode: DeviceMode) -> Self {
        let humidity = match mode {
            DeviceMode::Normal => thresholds.humidity.bounds,
            DeviceMode::Override => config.override_humidity,
        };
        Self {
            humidity,
            temperature_ceiling_c: config.temperature_ceiling_c,
            water_low_pct: config.water_low_pct,
            water_high_pct: config.water_high_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmReason {
    TemperatureCritical,
    HumidityLow,
    HumidityHigh,
    WaterLow,
    WaterHigh,
}

impl AlarmReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TemperatureCritical => "temperature_critical",
            Self::HumidityLow => "humidity_low",
            Self::HumidityHigh => "humidity_high",
            Self::WaterLow => "water_low",
            Self::WaterHigh => "water_high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmEdge {
    Raised,
    Cleared,
}

pub fn alarm_reasons(
    climate: Option<ClimateReading>,
    water_level_pct: f32,
    bounds: &ControlBounds,
) -> Vec<AlarmReason> {
    let mut reasons = Vec::new();
    if let Some(climate) = climate {
        if climate.temperature_c > bounds.temperature_ceiling_c {
            reasons.push(AlarmReason::TemperatureCritical);
        }
        match bounds.humidity.classify(climate.humidity_pct) {
            Band::Below => reasons.push(AlarmReason::HumidityLow),
            Band::Above => reasons.push(AlarmReason::HumidityHigh),
            Band::Within => {}
        }
    }
    if water_level_pct < bounds.water_low_pct {
        reasons.push(AlarmReason::WaterLow);
    }
    if let Some(high) = bounds.water_high_pct {
        if water_level_pct > high {
            reasons.push(AlarmReason::WaterHigh);
        }
    }
    reasons
}

/// Stage-pair policy: below the humidity band both humidifiers run, inside
/// it only stage one, above it neither. Fan 1 always runs, fan 2 joins above
/// the temperature ceiling, the buzzer follows the alarm.
pub fn desired_outputs(
    climate: Option<ClimateReading>,
    alarm_active: bool,
    bounds: &ControlBounds,
    previous: &ActuatorState,
) -> ActuatorState {
    let mut next = *previous;
    next.fan1 = true;
    next.buzzer = alarm_active;

    if let Some(climate) = climate {
        let (stage1, stage2) = match bounds.humidity.classify(climate.humidity_pct) {
            Band::Below => (true, true),
            Band::Within => (true, false),
            Band::Above => (false, false),
        };
        next.humidifier1 = stage1;
        next.humidifier2 = stage2;
        next.fan2 = climate.temperature_c > bounds.temperature_ceiling_c;
    }
    next
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutcome {
    pub changes: Vec<(Actuator, bool)>,
    pub alarm: Option<AlarmEdge>,
    pub reasons: Vec<AlarmReason>,
}

/// Owns the output state and the alarm latch. Only transitions come out.
#[derive(Debug, Clone)]
pub struct ControlEngine {
    outputs: ActuatorState,
    alarm_active: bool,
    last_climate: Option<ClimateReading>,
}

impl Default for ControlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlEngine {
    pub fn new() -> Self {
        Self {
            outputs: ActuatorState::default(),
            alarm_active: false,
            last_climate: None,
        }
    }

    pub fn outputs(&self) -> ActuatorState {
        self.outputs
    }

    pub fn alarm_active(&self) -> bool {
        self.alarm_active
    }

    /// Climate readings fall back to the last valid one when the current
    /// sample is degraded.
    pub fn apply(&mut self, sample: &SensorSample, bounds: &ControlBounds) -> ControlOutcome {
        if let Some(climate) = sample.climate() {
            self.last_climate = Some(climate);
        }
        let climate = self.last_climate;

        let reasons = alarm_reasons(climate, sample.water_level_pct, bounds);
        let alarm_now = !reasons.is_empty();
        let alarm = match (self.alarm_active, alarm_now) {
            (false, true) => {
                let labels: Vec<&str> = reasons.iter().map(|reason| reason.as_str()).collect();
                warn!("alarm raised: {}", labels.join(", "));
                Some(AlarmEdge::Raised)
            }
            (true, false) => {
                info!("alarm cleared");
                Some(AlarmEdge::Cleared)
            }
            _ => None,
        };
        self.alarm_active = alarm_now;

        let next = desired_outputs(climate, alarm_now, bounds, &self.outputs);
        let changes = self.outputs.changes_to(&next);
        for (actuator, on) in &changes {
            info!("{} -> {}", actuator.as_str(), if *on { "on" } else { "off" });
        }
        self.outputs = next;

        ControlOutcome {
            changes,
            alarm,
            reasons,
        }
    }
}
