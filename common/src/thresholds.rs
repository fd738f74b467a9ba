use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f32,
    pub max: f32,
}

impl Bounds {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn sanitize(&mut self) {
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
    }

    pub fn classify(&self, value: f32) -> Band {
        if value < self.min {
            Band::Below
        } else if value > self.max {
            Band::Above
        } else {
            Band::Within
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Below,
    Within,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantityThreshold {
    pub bounds: Bounds,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub temperature: QuantityThreshold,
    pub humidity: QuantityThreshold,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            temperature: QuantityThreshold {
                bounds: Bounds::new(22.0, 27.0),
                enabled: true,
            },
            humidity: QuantityThreshold {
                bounds: Bounds::new(80.0, 83.0),
                enabled: true,
            },
        }
    }
}

/// One row of the backend's per-controller threshold table.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdEntry {
    #[serde(default)]
    pub arrangement: Option<i32>,
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(default)]
    pub min_threshold: Option<f32>,
    #[serde(default)]
    pub max_threshold: Option<f32>,
    #[serde(default)]
    pub sensor_min: Option<f32>,
    #[serde(default)]
    pub sensor_max: Option<f32>,
}

impl ThresholdEntry {
    fn enabled_bounds(&self) -> Option<Bounds> {
        if self.is_enabled != Some(true) {
            return None;
        }
        let mut bounds = Bounds::new(self.min_threshold?, self.max_threshold?);
        bounds.sanitize();
        Some(bounds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdResponse {
    pub data: Vec<ThresholdEntry>,
}

impl ThresholdResponse {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

impl ThresholdSet {
    /// Folds a backend response into the cached set. Entries for other slots
    /// are ignored; a disabled entry keeps its last-known bounds. Returns the
    /// number of slots updated.
    pub fn apply(
        &mut self,
        response: &ThresholdResponse,
        temperature_slot: i32,
        humidity_slot: i32,
    ) -> usize {
        let mut applied = 0;
        for entry in &response.data {
            let Some(arrangement) = entry.arrangement else {
                debug!("skipping threshold entry without arrangement");
                continue;
            };
            let target = if arrangement == temperature_slot {
                &mut self.temperature
            } else if arrangement == humidity_slot {
                &mut self.humidity
            } else {
                debug!("ignoring threshold entry for arrangement {arrangement}");
                continue;
            };

            match entry.enabled_bounds() {
                Some(bounds) => {
                    target.bounds = bounds;
                    target.enabled = true;
                }
                None => {
                    debug!(
                        "threshold arrangement {arrangement} disabled \
                         (sensor range {:?}..{:?}), keeping {:?}",
                        entry.sensor_min, entry.sensor_max, target.bounds
                    );
                    target.enabled = false;
                }
            }
            applied += 1;
        }

        if applied > 0 {
            info!(
                "thresholds updated: temperature {:?} enabled={}, humidity {:?} enabled={}",
                self.temperature.bounds,
                self.temperature.enabled,
                self.humidity.bounds,
                self.humidity.enabled
            );
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn applies_enabled_entries_by_slot() {
        let body = br#"{"data":[
            {"arrangement":2,"is_enabled":true,"min_threshold":20.0,"max_threshold":26.5},
            {"arrangement":0,"is_enabled":true,"min_threshold":78,"max_threshold":84},
            {"arrangement":7,"is_enabled":true,"min_threshold":1,"max_threshold":2}
        ]}"#;
        let response = ThresholdResponse::parse(body).unwrap();
        let mut set = ThresholdSet::default();

        assert_eq!(set.apply(&response, 2, 0), 2);
        assert_eq!(set.temperature.bounds, Bounds::new(20.0, 26.5));
        assert_eq!(set.humidity.bounds, Bounds::new(78.0, 84.0));
    }

    #[test]
    fn disabled_entry_keeps_last_known_bounds() {
        let body = br#"{"data":[
            {"arrangement":0,"is_enabled":false,"min_threshold":10,"max_threshold":20,"sensor_min":0,"sensor_max":100},
            {"arrangement":2,"is_enabled":true,"min_threshold":null,"max_threshold":25}
        ]}"#;
        let response = ThresholdResponse::parse(body).unwrap();
        let mut set = ThresholdSet::default();
        set.apply(&response, 2, 0);

        assert_eq!(set.humidity.bounds, Bounds::new(80.0, 83.0));
        assert!(!set.humidity.enabled);
        assert_eq!(set.temperature.bounds, Bounds::new(22.0, 27.0));
        assert!(!set.temperature.enabled);
    }

    #[test]
    fn row_without_arrangement_is_skipped() {
        let body = br#"{"data":[
            {"is_enabled":true,"min_threshold":1,"max_threshold":2},
            {"arrangement":0,"is_enabled":true,"min_threshold":78,"max_threshold":84}
        ]}"#;
        let response = ThresholdResponse::parse(body).unwrap();
        let mut set = ThresholdSet::default();

        assert_eq!(set.apply(&response, 2, 0), 1);
        assert_eq!(set.humidity.bounds, Bounds::new(78.0, 84.0));
        assert_eq!(set.temperature.bounds, Bounds::new(22.0, 27.0));
    }

    #[test]
    fn missing_data_array_is_a_parse_error() {
        assert!(ThresholdResponse::parse(br#"{"rows":[]}"#).is_err());
        assert!(ThresholdResponse::parse(b"not json").is_err());
    }

    #[test]
    fn classifies_against_inclusive_bounds() {
        let bounds = Bounds::new(80.0, 83.0);
        assert_eq!(bounds.classify(79.9), Band::Below);
        assert_eq!(bounds.classify(80.0), Band::Within);
        assert_eq!(bounds.classify(83.0), Band::Within);
        assert_eq!(bounds.classify(83.1), Band::Above);
    }
}
