pub mod commands;
pub mod config;
pub mod connectivity;
pub mod control;
pub mod credentials;
pub mod device;
pub mod identity;
pub mod mode;
pub mod ports;
pub mod provisioning;
pub mod registration;
pub mod sensors;
pub mod telemetry;
pub mod thresholds;
pub mod topics;
pub mod types;

pub use commands::{
    route_broker_message, route_credential_write, CredentialWriteBuffer, InboundEvent,
};
pub use config::DeviceConfig;
pub use connectivity::{ConnectivityEvent, ConnectivitySupervisor, LinkPhase};
pub use control::{AlarmEdge, AlarmReason, ControlBounds, ControlEngine};
pub use credentials::{CredentialStore, Credentials, MemoryStore, StoreError, StoredDevice};
pub use device::{CycleClock, Device};
pub use identity::{DeviceIdentity, IdentityError};
pub use mode::{CommandError, ModeCommand, ModeEvent, ModeState, ModeTimer};
pub use ports::{Backend, Board, ClimateSensor, Link, Ports, Session, TransportError};
pub use provisioning::{IntakeError, IntakeRecord, ProvisioningManager, ProvisioningState};
pub use registration::{RegistrationAgent, RegistrationOutcome, RegistrationRequest};
pub use telemetry::{OutboundMessage, TelemetryPublisher, WireFormat};
pub use thresholds::{Bounds, ThresholdResponse, ThresholdSet};
pub use topics::*;
pub use types::{
    Actuator, ActuatorState, AlertPattern, ClimateReading, CycleOutcome, DeviceMode,
    DeviceStatus, RestartReason, SensorSample,
};
