use crate::telemetry::WireFormat;

pub const TOPIC_REGISTRATION: &str = "system/devices/register";

pub const QUANTITY_TEMPERATURE: &str = "temperature";
pub const QUANTITY_HUMIDITY: &str = "humidity";
pub const QUANTITY_WATER_LEVEL: &str = "water_level";
pub const QUANTITY_LIGHT: &str = "light";

/// Per-device topic names for one wire convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    format: WireFormat,
    device_id: String,
}

impl TopicSet {
    pub fn new(format: WireFormat, device_id: &str) -> Self {
        Self {
            format,
            device_id: device_id.to_string(),
        }
    }

    pub fn sensor(&self, quantity: &str) -> String {
        format!("devices/{}/sensors/{quantity}", self.device_id)
    }

    pub fn actuators(&self) -> String {
        format!("devices/{}/actuators/status", self.device_id)
    }

    /// Compact-format telemetry array.
    pub fn telemetry(&self) -> String {
        format!("topic/{}", self.device_id)
    }

    pub fn mode_set(&self) -> String {
        match self.format {
            WireFormat::Json => format!("devices/{}/mode/set", self.device_id),
            WireFormat::Compact => format!("{}/mode/set", self.device_id),
        }
    }

    pub fn mode_status(&self) -> String {
        match self.format {
            WireFormat::Json => format!("devices/{}/mode/status", self.device_id),
            WireFormat::Compact => format!("topic/{}/mode", self.device_id),
        }
    }

    pub fn alarm(&self) -> String {
        match self.format {
            WireFormat::Json => format!("devices/{}/alarm", self.device_id),
            WireFormat::Compact => format!("topic/{}/alarm", self.device_id),
        }
    }

    pub fn alarm_clear(&self) -> String {
        match self.format {
            WireFormat::Json => self.alarm(),
            WireFormat::Compact => format!("topic/{}/alarm/clear", self.device_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mode_set_topic_follows_wire_convention() {
        assert_eq!(
            TopicSet::new(WireFormat::Json, "ABC").mode_set(),
            "devices/ABC/mode/set"
        );
        assert_eq!(TopicSet::new(WireFormat::Compact, "ABC").mode_set(), "ABC/mode/set");
        assert_eq!(TopicSet::new(WireFormat::Compact, "ABC").mode_status(), "topic/ABC/mode");
    }
}
