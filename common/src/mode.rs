use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::types::{Cadence, DeviceMode};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed mode command: {0}")]
    Malformed(String),
    #[error("unknown mode `{0}`")]
    UnknownMode(String),
    #[error("override requires a duration")]
    MissingDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeCommand {
    Normal,
    Override { duration_secs: u64 },
}

#[derive(Deserialize)]
struct ModeCommandJson {
    mode: String,
    #[serde(default, alias = "duration")]
    duration_seconds: Option<u64>,
}

impl ModeCommand {
    /// Accepts `{"mode":"override","duration_seconds":3600}` or the compact
    /// `p,3600` / `n` forms.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| CommandError::Malformed(err.to_string()))?
            .trim();

        let (mode, duration) = if text.starts_with('{') {
            let parsed: ModeCommandJson = serde_json::from_str(text)
                .map_err(|err| CommandError::Malformed(err.to_string()))?;
            (parsed.mode, parsed.duration_seconds)
        } else {
            let mut parts = text.splitn(2, ',');
            let mode = parts.next().unwrap_or_default().trim().to_string();
            let duration = match parts.next().map(str::trim) {
                Some(raw) => Some(
                    raw.parse::<u64>()
                        .map_err(|_| CommandError::Malformed(format!("bad duration `{raw}`")))?,
                ),
                None => None,
            };
            (mode, duration)
        };

        match mode.to_ascii_lowercase().as_str() {
            "normal" | "n" => Ok(Self::Normal),
            "override" | "pinning" | "p" => duration
                .map(|duration_secs| Self::Override { duration_secs })
                .ok_or(CommandError::MissingDuration),
            "" => Err(CommandError::Malformed("empty mode".to_string())),
            other => Err(CommandError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    Normal,
    Override { ends_at_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    Entered { mode: DeviceMode, remaining_secs: u64 },
    Countdown { remaining_secs: u64 },
    Expired,
}

/// Time-bounded override of the normal control profile.
#[derive(Debug, Clone)]
pub struct ModeTimer {
    state: ModeState,
    countdown: Cadence,
    countdown_interval_ms: u64,
}

impl ModeTimer {
    pub fn new(countdown_interval_ms: u64) -> Self {
        Self {
            state: ModeState::Normal,
            countdown: Cadence::new(countdown_interval_ms, 0),
            countdown_interval_ms,
        }
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn mode(&self) -> DeviceMode {
        match self.state {
            ModeState::Normal => DeviceMode::Normal,
            ModeState::Override { .. } => DeviceMode::Override,
        }
    }

    pub fn remaining_secs(&self, now_ms: u64) -> u64 {
        match self.state {
            ModeState::Normal => 0,
            ModeState::Override { ends_at_ms } => ends_at_ms.saturating_sub(now_ms).div_ceil(1_000),
        }
    }

    /// Applies a command. Returns an event only when the mode or deadline changed.
    pub fn apply(&mut self, command: ModeCommand, now_ms: u64) -> Option<ModeEvent> {
        match command {
            ModeCommand::Normal => {
                if self.state == ModeState::Normal {
                    return None;
                }
                info!("override cancelled, back to normal mode");
                self.state = ModeState::Normal;
                Some(ModeEvent::Entered {
                    mode: DeviceMode::Normal,
                    remaining_secs: 0,
                })
            }
            ModeCommand::Override { duration_secs } => {
                let ends_at_ms = now_ms.saturating_add(duration_secs.saturating_mul(1_000));
                info!("override mode for {duration_secs} s");
                self.state = ModeState::Override { ends_at_ms };
                self.countdown = Cadence::new(
                    self.countdown_interval_ms,
                    now_ms.saturating_add(self.countdown_interval_ms),
                );
                Some(ModeEvent::Entered {
                    mode: DeviceMode::Override,
                    remaining_secs: self.remaining_secs(now_ms),
                })
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Option<ModeEvent> {
        let ModeState::Override { ends_at_ms } = self.state else {
            return None;
        };

        if now_ms >= ends_at_ms {
            info!("override expired, back to normal mode");
            self.state = ModeState::Normal;
            return Some(ModeEvent::Expired);
        }

        self.countdown.fire(now_ms).then(|| ModeEvent::Countdown {
            remaining_secs: self.remaining_secs(now_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_both_encodings() {
        assert_eq!(
            ModeCommand::parse(br#"{"mode":"override","duration_seconds":3600}"#),
            Ok(ModeCommand::Override { duration_secs: 3600 })
        );
        assert_eq!(
            ModeCommand::parse(br#"{"mode":"pinning","duration":60}"#),
            Ok(ModeCommand::Override { duration_secs: 60 })
        );
        assert_eq!(
            ModeCommand::parse(b" p,3600 "),
            Ok(ModeCommand::Override { duration_secs: 3600 })
        );
        assert_eq!(ModeCommand::parse(b"n"), Ok(ModeCommand::Normal));
        assert_eq!(
            ModeCommand::parse(br#"{"mode":"normal"}"#),
            Ok(ModeCommand::Normal)
        );
    }

    #[test]
    fn rejects_bad_commands() {
        assert_eq!(
            ModeCommand::parse(b"p"),
            Err(CommandError::MissingDuration)
        );
        assert_eq!(
            ModeCommand::parse(b"turbo,5"),
            Err(CommandError::UnknownMode("turbo".to_string()))
        );
        assert!(matches!(
            ModeCommand::parse(b"p,soon"),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            ModeCommand::parse(b"{\"mode\":"),
            Err(CommandError::Malformed(_))
        ));
    }

    #[test]
    fn override_expires_by_itself() {
        let mut timer = ModeTimer::new(60_000);
        assert_eq!(
            timer.apply(ModeCommand::Override { duration_secs: 3600 }, 1_000),
            Some(ModeEvent::Entered {
                mode: DeviceMode::Override,
                remaining_secs: 3600
            })
        );

        assert_eq!(
            timer.tick(61_000),
            Some(ModeEvent::Countdown {
                remaining_secs: 3540
            })
        );
        assert_eq!(timer.tick(61_500), None);
        assert_eq!(timer.mode(), DeviceMode::Override);

        assert_eq!(timer.tick(3_601_000), Some(ModeEvent::Expired));
        assert_eq!(timer.mode(), DeviceMode::Normal);
        assert_eq!(timer.tick(3_700_000), None);
    }

    #[test]
    fn zero_duration_expires_on_next_tick() {
        let mut timer = ModeTimer::new(60_000);
        timer.apply(ModeCommand::Override { duration_secs: 0 }, 5_000);
        assert_eq!(timer.tick(5_000), Some(ModeEvent::Expired));
    }

    #[test]
    fn normal_is_immediate_and_idempotent() {
        let mut timer = ModeTimer::new(60_000);
        assert_eq!(timer.apply(ModeCommand::Normal, 0), None);

        timer.apply(ModeCommand::Override { duration_secs: 600 }, 0);
        assert!(timer.apply(ModeCommand::Normal, 10_000).is_some());
        assert_eq!(timer.state(), ModeState::Normal);
        assert_eq!(timer.apply(ModeCommand::Normal, 20_000), None);
    }
}
