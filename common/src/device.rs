use std::time::Duration;

use log::{debug, error, info, warn};

use crate::commands::InboundEvent;
use crate::config::DeviceConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivitySupervisor};
use crate::control::{ControlBounds, ControlEngine};
use crate::credentials::{CredentialStore, Credentials, StoredDevice};
use crate::identity::DeviceIdentity;
use crate::mode::ModeTimer;
use crate::ports::{Backend, Board, Ports, Session};
use crate::provisioning::{IntakeRecord, ProvisioningManager};
use crate::registration::{RegistrationAgent, RegistrationOutcome};
use crate::sensors::{read_with_retries, ClimateMonitor, SensorAction, WaterLevelDebouncer};
use crate::telemetry::{registration_announce, OutboundMessage, TelemetryFrame, TelemetryPublisher};
use crate::thresholds::ThresholdSet;
use crate::topics::TopicSet;
use crate::types::{
    Actuator, AlertPattern, Cadence, CycleOutcome, DeviceStatus, RestartReason, SensorSample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    /// Monotonic milliseconds since boot.
    pub now_ms: u64,
    /// Wall-clock seconds for payload timestamps.
    pub epoch_secs: i64,
}

/// All mutable device state, owned by the control loop.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    identity: DeviceIdentity,
    stored: StoredDevice,
    provisioning: ProvisioningManager,
    connectivity: ConnectivitySupervisor,
    registration: RegistrationAgent,
    climate: ClimateMonitor,
    water: WaterLevelDebouncer,
    thresholds: ThresholdSet,
    threshold_refresh: Cadence,
    control: ControlEngine,
    mode: ModeTimer,
    telemetry: TelemetryPublisher,
    sampling: Cadence,
    sample: SensorSample,
    announced: bool,
}

impl Device {
    pub fn boot(
        mut config: DeviceConfig,
        identity: DeviceIdentity,
        store: &dyn CredentialStore,
        now_ms: u64,
    ) -> Self {
        config.sanitize();

        let stored = store.load().unwrap_or_else(|err| {
            warn!("credential store unreadable ({err}), starting unconfigured");
            StoredDevice::default()
        });

        let provisioning = ProvisioningManager::new(&config.provisioning, &stored.credentials);
        info!(
            "device {} ({}) booting in {:?} state, registered: {}",
            identity.device_name(),
            identity.controller_id(),
            provisioning.state(),
            stored.registered
        );

        Self {
            connectivity: ConnectivitySupervisor::new(config.connectivity.clone(), now_ms),
            registration: RegistrationAgent::new(
                stored.registered,
                config.backend.registration_retry_ms,
            ),
            climate: ClimateMonitor::new(config.sensors.clone(), now_ms),
            water: WaterLevelDebouncer::new(
                config.sensors.water_settle_ms,
                config.sensors.water_fallback_pct,
            ),
            thresholds: config.control.defaults,
            threshold_refresh: Cadence::new(config.backend.threshold_refresh_ms, now_ms),
            control: ControlEngine::new(),
            mode: ModeTimer::new(config.mode.countdown_interval_ms),
            telemetry: TelemetryPublisher::new(&config.telemetry, identity.compact_id(), now_ms),
            sampling: Cadence::new(config.sensors.sample_interval_ms, now_ms),
            sample: SensorSample {
                water_level_pct: config.sensors.water_fallback_pct,
                ..SensorSample::default()
            },
            announced: false,
            provisioning,
            stored,
            identity,
            config,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn credentials(&self) -> &Credentials {
        &self.stored.credentials
    }

    pub fn is_provisioning(&self) -> bool {
        self.provisioning.is_unconfigured()
    }

    pub fn topics(&self) -> &TopicSet {
        self.telemetry.topics()
    }

    pub fn sample(&self) -> &SensorSample {
        &self.sample
    }

    pub fn connectivity(&self) -> &ConnectivitySupervisor {
        &self.connectivity
    }

    /// Drives every output to its boot level.
    pub fn drive_boot_outputs(&self, board: &mut dyn Board) {
        let outputs = self.control.outputs();
        for actuator in Actuator::ALL {
            board.drive(actuator, outputs.get(actuator));
        }
    }

    pub fn status(&self, now_ms: u64) -> DeviceStatus {
        let phase = self.connectivity.phase();
        let credentials = &self.stored.credentials;
        DeviceStatus {
            controller_id: self.identity.controller_id().to_string(),
            device_name: self.identity.device_name().to_string(),
            ssid: credentials.ssid.clone(),
            email: credentials.email.clone(),
            controller_name: credentials.controller_name.clone(),
            factory_name: credentials.factory_name.clone(),
            registered: self.registration.is_registered(),
            provisioning: self.is_provisioning(),
            wifi_status: if phase.link_up() { "connected" } else { "disconnected" },
            mqtt_status: if phase.session_up() { "connected" } else { "disconnected" },
            mode: self.mode.mode(),
            override_remaining_seconds: self.mode.remaining_secs(now_ms),
            alarm_active: self.control.alarm_active(),
            actuators: self.control.outputs(),
            sample: self.sample,
            thresholds: self.thresholds,
        }
    }

    /// One pass of the control loop: provisioning transport, connectivity,
    /// registration, mode timer, sensors, actuators, telemetry.
    pub fn run_cycle<I>(
        &mut self,
        clock: CycleClock,
        inbox: I,
        ports: &mut Ports<'_>,
    ) -> CycleOutcome
    where
        I: IntoIterator<Item = InboundEvent>,
    {
        let now_ms = clock.now_ms;

        if self
            .provisioning
            .poll_reset_button(ports.board.reset_pressed(), now_ms)
        {
            if let Some(outcome) = self.factory_reset(ports.store) {
                return outcome;
            }
        }

        let mut mode_events = Vec::new();
        for event in inbox {
            match event {
                InboundEvent::FactoryReset => {
                    if let Some(outcome) = self.factory_reset(ports.store) {
                        return outcome;
                    }
                }
                InboundEvent::Credentials(record) => {
                    if let Some(outcome) = self.save_credentials(record, ports.store) {
                        return outcome;
                    }
                }
                InboundEvent::Mode(command) => {
                    if self.is_provisioning() {
                        debug!("mode command ignored while unconfigured");
                        continue;
                    }
                    mode_events.extend(self.mode.apply(command, now_ms));
                }
            }
        }

        if self.is_provisioning() {
            return CycleOutcome::Continue;
        }

        let client_id = self.identity.client_id();
        let events = self.connectivity.poll(
            now_ms,
            &self.stored.credentials,
            &client_id,
            ports.link,
            ports.session,
        );
        if events.contains(&ConnectivityEvent::SessionEstablished) {
            self.on_session_established(clock, ports.session);
        }
        let phase = self.connectivity.phase();

        let outcome = self.registration.poll(
            now_ms,
            phase.session_up(),
            &self.identity,
            &self.stored.credentials,
            ports.backend,
        );
        if outcome == RegistrationOutcome::Registered {
            self.stored.registered = true;
            if let Err(err) = ports.store.save(&self.stored) {
                error!("failed to persist registration flag: {err}");
            }
        }

        if phase.link_up() && self.threshold_refresh.fire(now_ms) {
            self.refresh_thresholds(ports.backend);
        }

        mode_events.extend(self.mode.tick(now_ms));

        if let Some(reason) = self.acquire(now_ms, ports) {
            return CycleOutcome::Restart(reason);
        }

        let bounds =
            ControlBounds::select(&self.config.control, &self.thresholds, self.mode.mode());
        let control = self.control.apply(&self.sample, &bounds);
        for (actuator, on) in &control.changes {
            ports.board.drive(*actuator, *on);
        }

        let outputs = self.control.outputs();
        let frame = TelemetryFrame {
            sample: &self.sample,
            outputs: &outputs,
            mode: self.mode.mode(),
            epoch_secs: clock.epoch_secs,
        };
        let mut outbound: Vec<OutboundMessage> = mode_events
            .into_iter()
            .map(|event| self.telemetry.mode_message(event, clock.epoch_secs))
            .collect();
        if let Some(edge) = control.alarm {
            outbound.push(self.telemetry.alarm_message(edge, &control.reasons, &frame));
        }
        if self.telemetry.due(now_ms) {
            outbound.extend(self.telemetry.state_messages(&frame));
        }
        publish_all(&outbound, phase.session_up(), ports.session);

        CycleOutcome::Continue
    }

    fn factory_reset(&mut self, store: &dyn CredentialStore) -> Option<CycleOutcome> {
        match store.clear() {
            Ok(()) => {
                warn!("credentials erased, restarting into provisioning");
                Some(CycleOutcome::Restart(RestartReason::FactoryReset))
            }
            Err(err) => {
                error!("factory reset failed: {err}");
                None
            }
        }
    }

    fn save_credentials(
        &mut self,
        record: IntakeRecord,
        store: &dyn CredentialStore,
    ) -> Option<CycleOutcome> {
        let merged = self.provisioning.accept(record, &self.stored)?;
        match store.save(&merged) {
            Ok(()) => {
                info!("credentials saved, restarting");
                self.stored = merged;
                Some(CycleOutcome::Restart(RestartReason::CredentialsSaved))
            }
            Err(err) => {
                error!("failed to persist credentials: {err}");
                None
            }
        }
    }

    fn on_session_established(&mut self, clock: CycleClock, session: &mut dyn Session) {
        let topic = self.telemetry.topics().mode_set();
        match session.subscribe(&topic) {
            Ok(()) => info!("subscribed to {topic}"),
            Err(err) => warn!("subscribe to {topic} failed: {err}"),
        }

        if !self.announced {
            let announce = registration_announce(&self.identity, clock.epoch_secs);
            match session.publish(&announce) {
                Ok(()) => self.announced = true,
                Err(err) => warn!("registration announcement failed: {err}"),
            }
        }
    }

    fn refresh_thresholds(&mut self, backend: &mut dyn Backend) {
        match backend.fetch_thresholds(self.identity.compact_id()) {
            Ok(response) => {
                self.thresholds.apply(
                    &response,
                    self.config.backend.temperature_slot,
                    self.config.backend.humidity_slot,
                );
            }
            Err(err) => warn!("threshold fetch failed ({err}), using cached thresholds"),
        }
    }

    fn acquire(&mut self, now_ms: u64, ports: &mut Ports<'_>) -> Option<RestartReason> {
        let (water, accepted) = self.water.update(ports.board.water_full(), now_ms);
        if accepted == Some(false) {
            warn!("water tank empty");
            ports.board.sound(AlertPattern::WaterEmpty);
        }
        self.sample.water_level_pct = water.level_pct;
        self.sample.water_valid = water.valid;

        if !self.sampling.fire(now_ms) {
            return None;
        }

        self.sample.light_pct = if ports.board.light_detected() { 100.0 } else { 0.0 };

        let sensors = &self.config.sensors;
        let reading = read_with_retries(
            ports.climate,
            ports.board,
            sensors.read_attempts,
            Duration::from_millis(sensors.read_retry_delay_ms),
        );
        let actions = self.climate.record(now_ms, reading);

        match reading {
            Some(reading) => {
                self.sample.temperature_c = reading.temperature_c;
                self.sample.humidity_pct = reading.humidity_pct;
                self.sample.climate_valid = true;
            }
            None => {
                self.sample.temperature_c = 0.0;
                self.sample.humidity_pct = 0.0;
                self.sample.climate_valid = false;
            }
        }
        self.sample.consecutive_failures = self.climate.consecutive_failures();

        for action in actions {
            match action {
                SensorAction::Alert(pattern) => ports.board.sound(pattern),
                SensorAction::Reinitialize => {
                    ports.climate.reinitialize();
                    ports
                        .board
                        .pause(Duration::from_millis(self.config.sensors.reinit_settle_ms));
                }
                SensorAction::Restart => return Some(RestartReason::SensorFailure),
            }
        }
        None
    }
}

fn publish_all(messages: &[OutboundMessage], session_up: bool, session: &mut dyn Session) {
    if messages.is_empty() {
        return;
    }
    if !session_up {
        debug!("broker offline, dropping {} message(s)", messages.len());
        return;
    }
    for message in messages {
        if let Err(err) = session.publish(message) {
            warn!("publish to {} failed: {err}", message.topic);
        }
    }
}
