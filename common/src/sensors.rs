use std::time::Duration;

use log::{error, info, warn};

use crate::config::SensorConfig;
use crate::ports::{Board, ClimateSensor};
use crate::types::{AlertPattern, ClimateReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorAction {
    Reinitialize,
    Alert(AlertPattern),
    Restart,
}

/// Reads the climate probe, retrying a bounded number of times.
pub fn read_with_retries(
    sensor: &mut dyn ClimateSensor,
    board: &mut dyn Board,
    attempts: u32,
    retry_delay: Duration,
) -> Option<ClimateReading> {
    for attempt in 1..=attempts {
        if let Some(reading) = sensor.read().filter(ClimateReading::is_plausible) {
            return Some(reading);
        }
        if attempt < attempts {
            board.pause(retry_delay);
        }
    }
    None
}

/// Tracks consecutive climate read failures and escalates: periodic fault
/// alert and a single driver re-init at the low threshold, restart at the
/// high one.
#[derive(Debug, Clone)]
pub struct ClimateMonitor {
    config: SensorConfig,
    consecutive_failures: u32,
    reinitialized: bool,
    last_init_ms: u64,
    last_fault_alert_ms: Option<u64>,
    last_reading: Option<ClimateReading>,
}

impl ClimateMonitor {
    pub fn new(config: SensorConfig, boot_ms: u64) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            reinitialized: false,
            last_init_ms: boot_ms,
            last_fault_alert_ms: None,
            last_reading: None,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_reading(&self) -> Option<ClimateReading> {
        self.last_reading
    }

    pub fn record(&mut self, now_ms: u64, reading: Option<ClimateReading>) -> Vec<SensorAction> {
        let mut actions = Vec::new();

        if let Some(reading) = reading.filter(ClimateReading::is_plausible) {
            if self.consecutive_failures > 0 {
                info!(
                    "climate sensor recovered after {} failed read(s)",
                    self.consecutive_failures
                );
                actions.push(SensorAction::Alert(AlertPattern::SensorRecovered));
            }
            self.consecutive_failures = 0;
            self.reinitialized = false;
            self.last_fault_alert_ms = None;
            self.last_reading = Some(reading);
            return actions;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            "climate sensor read failed ({} consecutive)",
            self.consecutive_failures
        );

        if self.consecutive_failures >= self.config.restart_after_failures {
            error!(
                "climate sensor failed {} times in a row, restarting",
                self.consecutive_failures
            );
            actions.push(SensorAction::Alert(AlertPattern::Critical));
            actions.push(SensorAction::Restart);
            return actions;
        }

        if self.consecutive_failures >= self.config.reinit_after_failures {
            let alert_due = self
                .last_fault_alert_ms
                .map(|last| now_ms.saturating_sub(last) >= self.config.fault_alert_interval_ms)
                .unwrap_or(true);
            if alert_due {
                self.last_fault_alert_ms = Some(now_ms);
                actions.push(SensorAction::Alert(AlertPattern::SensorFault));
            }

            if !self.reinitialized
                && now_ms.saturating_sub(self.last_init_ms) >= self.config.reinit_min_interval_ms
            {
                info!("re-initializing climate sensor");
                self.reinitialized = true;
                self.last_init_ms = now_ms;
                actions.push(SensorAction::Reinitialize);
            }
        }

        actions
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaterReading {
    pub level_pct: f32,
    pub valid: bool,
}

/// Debounces the float switch: a level is accepted only after the raw input
/// has held steady for the settle time.
#[derive(Debug, Clone)]
pub struct WaterLevelDebouncer {
    settle_ms: u64,
    fallback_pct: f32,
    pending: Option<(bool, u64)>,
    accepted_full: Option<bool>,
    valid: bool,
}

impl WaterLevelDebouncer {
    pub fn new(settle_ms: u64, fallback_pct: f32) -> Self {
        Self {
            settle_ms,
            fallback_pct,
            pending: None,
            accepted_full: None,
            valid: false,
        }
    }

    /// Returns the reported reading and, when a new level was accepted on
    /// this call, whether the tank is full.
    pub fn update(&mut self, raw_full: bool, now_ms: u64) -> (WaterReading, Option<bool>) {
        let (level, since_ms) = match self.pending {
            Some((level, since_ms)) if level == raw_full => (level, since_ms),
            _ => (raw_full, now_ms),
        };
        self.pending = Some((level, since_ms));

        if Some(raw_full) != self.accepted_full {
            self.valid = false;
        }

        let mut accepted = None;
        if !self.valid && now_ms.saturating_sub(since_ms) >= self.settle_ms {
            self.accepted_full = Some(level);
            self.valid = true;
            accepted = Some(level);
        }

        (self.reading(), accepted)
    }

    pub fn reading(&self) -> WaterReading {
        match (self.valid, self.accepted_full) {
            (true, Some(full)) => WaterReading {
                level_pct: if full { 100.0 } else { 0.0 },
                valid: true,
            },
            _ => WaterReading {
                level_pct: self.fallback_pct,
                valid: false,
            },
        }
    }
}
