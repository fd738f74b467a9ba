//! Boundaries between the device logic and whatever drives the hardware and
//! the network. Each runtime provides its own implementations.

use std::time::Duration;

use thiserror::Error;

use crate::credentials::{CredentialStore, Credentials};
use crate::registration::RegistrationRequest;
use crate::telemetry::OutboundMessage;
use crate::thresholds::ThresholdResponse;
use crate::types::{Actuator, AlertPattern, ClimateReading};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Io(String),
}

/// Temperature/humidity probe. `read` returns `None` on a failed read.
pub trait ClimateSensor {
    fn read(&mut self) -> Option<ClimateReading>;
    fn reinitialize(&mut self);
}

pub trait Board {
    /// Float switch closed.
    fn water_full(&mut self) -> bool;
    fn light_detected(&mut self) -> bool;
    fn reset_pressed(&mut self) -> bool;
    fn drive(&mut self, actuator: Actuator, on: bool);
    fn sound(&mut self, pattern: AlertPattern);
    fn pause(&mut self, duration: Duration);
}

/// Wireless station link. `begin_connect` must return immediately.
pub trait Link {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), TransportError>;
    fn is_up(&mut self) -> bool;
    fn abort(&mut self);
}

/// Broker session. `connect` blocks for at most `deadline`.
pub trait Session {
    fn connect(&mut self, client_id: &str, deadline: Duration) -> Result<(), TransportError>;
    fn is_up(&mut self) -> bool;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// HTTP backend. `register` yields the response status code.
pub trait Backend {
    fn register(&mut self, request: &RegistrationRequest) -> Result<u16, TransportError>;
    fn fetch_thresholds(&mut self, compact_id: &str) -> Result<ThresholdResponse, TransportError>;
}

pub struct Ports<'a> {
    pub climate: &'a mut dyn ClimateSensor,
    pub board: &'a mut dyn Board,
    pub link: &'a mut dyn Link,
    pub session: &'a mut dyn Session,
    pub backend: &'a mut dyn Backend,
    pub store: &'a dyn CredentialStore,
}
