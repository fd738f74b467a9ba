//! Simulated hardware for the host build.
//!
//! `MILLO_SIM_SENSOR_FAULT=1` makes every climate read fail, `MILLO_SIM_WATER_EMPTY=1`
//! opens the float switch and `MILLO_SIM_OFFLINE=1` keeps the station link down.

use std::time::{Duration, Instant};

use millo_common::{
    Actuator, ActuatorState, AlertPattern, Board, ClimateReading, ClimateSensor, Credentials,
    Link, TransportError,
};
use tracing::{info, warn};

const LINK_ASSOCIATE_DELAY: Duration = Duration::from_millis(1_500);

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[derive(Debug)]
pub struct SimClimate {
    tick: u64,
    faulty: bool,
}

impl SimClimate {
    pub fn from_env() -> Self {
        Self {
            tick: 0,
            faulty: env_flag("MILLO_SIM_SENSOR_FAULT"),
        }
    }
}

impl ClimateSensor for SimClimate {
    fn read(&mut self) -> Option<ClimateReading> {
        if self.faulty {
            return None;
        }
        self.tick = self.tick.saturating_add(1);
        Some(ClimateReading {
            temperature_c: 24.0 + (self.tick % 8) as f32 * 0.5,
            humidity_pct: 78.0 + (self.tick % 10) as f32 * 0.6,
        })
    }

    fn reinitialize(&mut self) {
        info!("simulated climate sensor re-initialized");
    }
}

#[derive(Debug)]
pub struct SimBoard {
    outputs: ActuatorState,
    water_empty: bool,
}

impl SimBoard {
    pub fn from_env() -> Self {
        Self {
            outputs: ActuatorState::default(),
            water_empty: env_flag("MILLO_SIM_WATER_EMPTY"),
        }
    }
}

impl Board for SimBoard {
    fn water_full(&mut self) -> bool {
        !self.water_empty
    }

    fn light_detected(&mut self) -> bool {
        true
    }

    fn reset_pressed(&mut self) -> bool {
        false
    }

    fn drive(&mut self, actuator: Actuator, on: bool) {
        if self.outputs.get(actuator) != on {
            info!("{} -> {}", actuator.as_str(), if on { "on" } else { "off" });
        }
        self.outputs.set(actuator, on);
    }

    fn sound(&mut self, pattern: AlertPattern) {
        warn!("buzzer pattern {pattern:?}");
    }

    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Station link that associates shortly after a connect is requested.
#[derive(Debug)]
pub struct SimLink {
    offline: bool,
    connecting_since: Option<Instant>,
}

impl SimLink {
    pub fn from_env() -> Self {
        Self {
            offline: env_flag("MILLO_SIM_OFFLINE"),
            connecting_since: None,
        }
    }
}

impl Link for SimLink {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), TransportError> {
        info!("joining `{}`", credentials.ssid);
        self.connecting_since = Some(Instant::now());
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        !self.offline
            && self
                .connecting_since
                .is_some_and(|since| since.elapsed() >= LINK_ASSOCIATE_DELAY)
    }

    fn abort(&mut self) {
        self.connecting_since = None;
    }
}
