use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::TelemetryConfig;
use crate::control::{AlarmEdge, AlarmReason};
use crate::identity::DeviceIdentity;
use crate::mode::ModeEvent;
use crate::topics::{
    TopicSet, QUANTITY_HUMIDITY, QUANTITY_LIGHT, QUANTITY_TEMPERATURE, QUANTITY_WATER_LEVEL,
    TOPIC_REGISTRATION,
};
use crate::types::{ActuatorState, Cadence, DeviceMode, SensorSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// One JSON document per quantity plus an actuator status document.
    #[default]
    Json,
    /// A single bracketed array `[humidity,light,temperature,water,mode]`.
    Compact,
}

impl WireFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Compact => "compact",
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "array" => Ok(Self::Compact),
            other => Err(format!("unknown wire format `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: String, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TelemetryFrame<'a> {
    pub sample: &'a SensorSample,
    pub outputs: &'a ActuatorState,
    pub mode: DeviceMode,
    pub epoch_secs: i64,
}

fn one_decimal(value: f32) -> f64 {
    (f64::from(value) * 10.0).round() / 10.0
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

pub fn compact_array(sample: &SensorSample, mode: DeviceMode) -> String {
    format!(
        "[{:.1},{:.1},{:.1},{:.1},{}]",
        sample.humidity_pct,
        sample.light_pct,
        sample.temperature_c,
        sample.water_level_pct,
        mode.as_char()
    )
}

/// Retained announcement published on the first broker session of a boot.
pub fn registration_announce(identity: &DeviceIdentity, epoch_secs: i64) -> OutboundMessage {
    let payload = json!({
        "macAddress": identity.compact_id(),
        "deviceName": identity.device_name(),
        "timestamp": epoch_secs,
    });
    OutboundMessage::new(TOPIC_REGISTRATION.to_string(), payload.to_string()).retained()
}

/// Encodes outbound messages for the configured convention and paces the
/// periodic state publication.
#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    format: WireFormat,
    device_id: String,
    topics: TopicSet,
    cadence: Cadence,
}

impl TelemetryPublisher {
    pub fn new(config: &TelemetryConfig, device_id: &str, boot_ms: u64) -> Self {
        Self {
            format: config.format,
            device_id: device_id.to_string(),
            topics: TopicSet::new(config.format, device_id),
            cadence: Cadence::new(
                config.publish_interval_ms,
                boot_ms.saturating_add(config.first_publish_delay_ms),
            ),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn due(&mut self, now_ms: u64) -> bool {
        self.cadence.fire(now_ms)
    }

    pub fn state_messages(&self, frame: &TelemetryFrame<'_>) -> Vec<OutboundMessage> {
        match self.format {
            WireFormat::Compact => vec![OutboundMessage::new(
                self.topics.telemetry(),
                compact_array(frame.sample, frame.mode),
            )],
            WireFormat::Json => {
                let sample = frame.sample;
                let mut messages: Vec<OutboundMessage> = [
                    (QUANTITY_TEMPERATURE, sample.temperature_c),
                    (QUANTITY_HUMIDITY, sample.humidity_pct),
                    (QUANTITY_WATER_LEVEL, sample.water_level_pct),
                    (QUANTITY_LIGHT, sample.light_pct),
                ]
                .into_iter()
                .map(|(quantity, value)| {
                    let payload = json!({
                        "value": one_decimal(value),
                        "timestamp": frame.epoch_secs,
                        "device_id": self.device_id,
                    });
                    OutboundMessage::new(self.topics.sensor(quantity), payload.to_string())
                })
                .collect();

                let outputs = frame.outputs;
                let status = json!({
                    "humidifier1": on_off(outputs.humidifier1),
                    "humidifier2": on_off(outputs.humidifier2),
                    "fan1": on_off(outputs.fan1),
                    "fan2": on_off(outputs.fan2),
                    "buzzer": on_off(outputs.buzzer),
                    "mode": frame.mode.as_str(),
                    "timestamp": frame.epoch_secs,
                    "device_id": self.device_id,
                });
                messages.push(OutboundMessage::new(
                    self.topics.actuators(),
                    status.to_string(),
                ));
                messages
            }
        }
    }

    pub fn alarm_message(
        &self,
        edge: AlarmEdge,
        reasons: &[AlarmReason],
        frame: &TelemetryFrame<'_>,
    ) -> OutboundMessage {
        match self.format {
            WireFormat::Compact => {
                let topic = match edge {
                    AlarmEdge::Raised => self.topics.alarm(),
                    AlarmEdge::Cleared => self.topics.alarm_clear(),
                };
                OutboundMessage::new(topic, compact_array(frame.sample, frame.mode))
            }
            WireFormat::Json => {
                let sample = frame.sample;
                let payload = json!({
                    "active": edge == AlarmEdge::Raised,
                    "reasons": reasons,
                    "temperature": one_decimal(sample.temperature_c),
                    "humidity": one_decimal(sample.humidity_pct),
                    "water_level": one_decimal(sample.water_level_pct),
                    "mode": frame.mode.as_str(),
                    "timestamp": frame.epoch_secs,
                    "device_id": self.device_id,
                });
                OutboundMessage::new(self.topics.alarm(), payload.to_string())
            }
        }
    }

    pub fn mode_message(&self, event: ModeEvent, epoch_secs: i64) -> OutboundMessage {
        let (mode, remaining_secs) = match event {
            ModeEvent::Entered {
                mode,
                remaining_secs,
            } => (mode, remaining_secs),
            ModeEvent::Countdown { remaining_secs } => (DeviceMode::Override, remaining_secs),
            ModeEvent::Expired => (DeviceMode::Normal, 0),
        };
        let payload = match self.format {
            WireFormat::Compact => format!("{},{remaining_secs}", mode.as_char()),
            WireFormat::Json => json!({
                "mode": mode.as_str(),
                "remaining_seconds": remaining_secs,
                "timestamp": epoch_secs,
            })
            .to_string(),
        };
        OutboundMessage::new(self.topics.mode_status(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn sample() -> SensorSample {
        SensorSample {
            temperature_c: 31.04,
            humidity_pct: 82.0,
            water_level_pct: 50.0,
            light_pct: 100.0,
            climate_valid: true,
            water_valid: true,
            consecutive_failures: 0,
        }
    }

    fn publisher(format: WireFormat) -> TelemetryPublisher {
        let config = TelemetryConfig {
            format,
            ..TelemetryConfig::default()
        };
        TelemetryPublisher::new(&config, "246F28A1B20C", 0)
    }

    #[test]
    fn json_state_is_one_document_per_quantity() {
        let sample = sample();
        let outputs = ActuatorState::default();
        let frame = TelemetryFrame {
            sample: &sample,
            outputs: &outputs,
            mode: DeviceMode::Normal,
            epoch_secs: 1_760_000_000,
        };
        let messages = publisher(WireFormat::Json).state_messages(&frame);

        let topics: Vec<&str> = messages.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "devices/246F28A1B20C/sensors/temperature",
                "devices/246F28A1B20C/sensors/humidity",
                "devices/246F28A1B20C/sensors/water_level",
                "devices/246F28A1B20C/sensors/light",
                "devices/246F28A1B20C/actuators/status",
            ]
        );

        let temperature: Value = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(temperature["value"], 31.0);
        assert_eq!(temperature["timestamp"], 1_760_000_000i64);

        let status: Value = serde_json::from_slice(&messages[4].payload).unwrap();
        assert_eq!(status["fan1"], "on");
        assert_eq!(status["humidifier2"], "off");
        assert_eq!(status["mode"], "normal");
    }

    #[test]
    fn compact_state_is_single_array() {
        let sample = sample();
        let outputs = ActuatorState::default();
        let frame = TelemetryFrame {
            sample: &sample,
            outputs: &outputs,
            mode: DeviceMode::Override,
            epoch_secs: 0,
        };
        let messages = publisher(WireFormat::Compact).state_messages(&frame);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "topic/246F28A1B20C");
        assert_eq!(messages[0].payload_str(), "[82.0,100.0,31.0,50.0,p]");
    }

    #[test]
    fn alarm_topics_per_format() {
        let sample = sample();
        let outputs = ActuatorState::default();
        let frame = TelemetryFrame {
            sample: &sample,
            outputs: &outputs,
            mode: DeviceMode::Normal,
            epoch_secs: 5,
        };

        let compact = publisher(WireFormat::Compact);
        assert_eq!(
            compact
                .alarm_message(AlarmEdge::Cleared, &[], &frame)
                .topic,
            "topic/246F28A1B20C/alarm/clear"
        );

        let json = publisher(WireFormat::Json)
            .alarm_message(AlarmEdge::Raised, &[AlarmReason::TemperatureCritical], &frame);
        let value: Value = serde_json::from_slice(&json.payload).unwrap();
        assert_eq!(json.topic, "devices/246F28A1B20C/alarm");
        assert_eq!(value["active"], true);
        assert_eq!(value["reasons"][0], "temperature_critical");
    }

    #[test]
    fn mode_status_encodings() {
        let event = ModeEvent::Countdown { remaining_secs: 120 };
        assert_eq!(
            publisher(WireFormat::Compact)
                .mode_message(event, 0)
                .payload_str(),
            "p,120"
        );
        let json = publisher(WireFormat::Json).mode_message(ModeEvent::Expired, 9);
        let value: Value = serde_json::from_slice(&json.payload).unwrap();
        assert_eq!(value["mode"], "normal");
        assert_eq!(value["remaining_seconds"], 0);
    }

    #[test]
    fn announcement_is_retained() {
        let identity = DeviceIdentity::from_mac([0x24, 0x6f, 0x28, 0xa1, 0xb2, 0x0c], "ESP32");
        let message = registration_announce(&identity, 42);
        assert!(message.retain);
        assert_eq!(message.topic, TOPIC_REGISTRATION);
        let value: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(value["deviceName"], "ESP32_A1B20C");
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("Compact".parse::<WireFormat>(), Ok(WireFormat::Compact));
        assert!("xml".parse::<WireFormat>().is_err());
    }
}
