use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht22;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{
        AnyIOPin, AnyInputPin, AnyOutputPin, IOPin, Input, InputOutput, InputPin, Output,
        OutputPin, PinDriver, Pull,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use millo_common::{
    config::{BackendConfig, BrokerConfig, ProvisioningConfig},
    route_broker_message, route_credential_write, Actuator, AlertPattern, Backend, Board,
    ClimateReading, ClimateSensor, CredentialStore, Credentials, CycleClock, CycleOutcome, Device,
    DeviceConfig, DeviceIdentity, DeviceStatus, InboundEvent, Link, OutboundMessage, Ports,
    RegistrationRequest, Session, StoreError, StoredDevice, ThresholdResponse, TopicSet,
    TransportError,
};

use crate::portal;

mod ble;

const NVS_NAMESPACE: &str = "millo";
const NVS_DEVICE_KEY: &str = "device_json";
const NVS_MAX_RECORD_BYTES: usize = 2048;
const MAX_HTTP_BODY: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const DHT_PIN: u8 = 4;
const SESSION_POLL_MS: u64 = 50;

const CAPTIVE_PROBE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

type SharedStatus = Arc<Mutex<Option<DeviceStatus>>>;
type HttpRequest<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let config = build_config();
    let identity = DeviceIdentity::from_mac(read_base_mac()?, &config.identity.name_prefix);

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut board = GpioBoard {
        humidifier1: PinDriver::output(pins.gpio25.downgrade_output())?,
        humidifier2: PinDriver::output(pins.gpio26.downgrade_output())?,
        fan1: PinDriver::output(pins.gpio32.downgrade_output())?,
        fan2: PinDriver::output(pins.gpio22.downgrade_output())?,
        buzzer: PinDriver::output(pins.gpio33.downgrade_output())?,
        water: pulled_up_input(pins.gpio27.downgrade())?,
        light: PinDriver::input(pins.gpio34.downgrade_input())?,
        reset: pulled_up_input(pins.gpio0.downgrade())?,
        buzzer_on: false,
    };
    let climate =
        Dht22Sensor::new(pins.gpio4.downgrade()).context("failed to initialize DHT22")?;

    let device = Device::boot(config, identity, &store, monotonic_ms());
    device.drive_boot_outputs(&mut board);

    let (inbox_tx, inbox_rx) = mpsc::sync_channel(device.config().cycle.inbox_capacity);
    let (wifi_modem, bt_modem) = modem.split();
    let mut link = WifiLink {
        wifi: EspWifi::new(wifi_modem, sys_loop.clone(), Some(nvs_partition.clone()))?,
        sys_loop,
    };
    let _ble = if device.is_provisioning() {
        link.start_access_point(&device.config().provisioning)?;
        match ble::BleIntake::start(
            bt_modem,
            nvs_partition,
            device.identity().device_name(),
            inbox_tx.clone(),
        ) {
            Ok(intake) => Some(intake),
            Err(err) => {
                warn!("BLE credential service unavailable: {err:#}");
                None
            }
        }
    } else {
        None
    };

    let status: SharedStatus = Arc::new(Mutex::new(Some(device.status(monotonic_ms()))));
    let server = create_http_server(status.clone(), inbox_tx.clone())?;

    let sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let session = MqttSession::new(
        device.config().broker.clone(),
        device.topics().clone(),
        inbox_tx,
    );
    let backend = EspBackend::new(&device.config().backend);

    let control = ControlLoop {
        device,
        climate,
        board,
        link,
        session,
        backend,
        store,
        inbox: inbox_rx,
        status,
    };
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || control.run())
        .context("failed to spawn control loop")?;

    // Keep services alive for the program lifetime.
    let _server = server;
    let _sntp = sntp;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn build_config() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    if let Some(host) = option_env!("MQTT_HOST") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.broker.port = port;
    }
    if let Some(user) = option_env!("MQTT_USER") {
        config.broker.username = user.to_string();
        config.broker.password = option_env!("MQTT_PASS").unwrap_or_default().to_string();
    }
    if let Some(format) = option_env!("MILLO_WIRE_FORMAT").and_then(|value| value.parse().ok()) {
        config.telemetry.format = format;
    }
    config
}

fn read_base_mac() -> anyhow::Result<[u8; 6]> {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc != esp_idf_svc::sys::ESP_OK {
        return Err(anyhow!("failed to read base MAC: esp_err_t={rc}"));
    }
    Ok(mac)
}

fn pulled_up_input(pin: AnyIOPin) -> anyhow::Result<PinDriver<'static, AnyIOPin, Input>> {
    let mut driver = PinDriver::input(pin)?;
    driver.set_pull(Pull::Up)?;
    Ok(driver)
}

struct ControlLoop {
    device: Device,
    climate: Dht22Sensor,
    board: GpioBoard,
    link: WifiLink,
    session: MqttSession,
    backend: EspBackend,
    store: NvsStore,
    inbox: Receiver<InboundEvent>,
    status: SharedStatus,
}

impl ControlLoop {
    fn run(mut self) {
        let period = Duration::from_millis(self.device.config().cycle.period_ms);
        loop {
            let started = Instant::now();
            let pending: Vec<InboundEvent> = self.inbox.try_iter().collect();
            let clock = CycleClock {
                now_ms: monotonic_ms(),
                epoch_secs: Utc::now().timestamp(),
            };

            let mut ports = Ports {
                climate: &mut self.climate,
                board: &mut self.board,
                link: &mut self.link,
                session: &mut self.session,
                backend: &mut self.backend,
                store: &self.store,
            };
            let outcome = self.device.run_cycle(clock, pending, &mut ports);

            match self.status.lock() {
                Ok(mut slot) => *slot = Some(self.device.status(clock.now_ms)),
                Err(_) => warn!("status lock poisoned"),
            }

            if let CycleOutcome::Restart(reason) = outcome {
                warn!("restarting: {}", reason.as_str());
                thread::sleep(Duration::from_millis(
                    self.device.config().provisioning.restart_delay_ms,
                ));
                unsafe { esp_idf_svc::sys::esp_restart() };
            }

            if let Some(rest) = period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}

fn create_http_server(
    status: SharedStatus,
    inbox: SyncSender<InboundEvent>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in CAPTIVE_PROBE_PATHS {
        let status = status.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let snapshot = status
                .lock()
                .map_err(|_| anyhow!("status lock poisoned"))?
                .clone();
            match snapshot {
                Some(snapshot) => write_html(req, 200, &portal::index_page(&snapshot)),
                None => write_error(req, 503, "device is booting"),
            }
        })?;
    }

    {
        let inbox = inbox.clone();
        server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let record = match portal::parse_form(&body) {
                Ok(record) => record,
                Err(err) => {
                    warn!("rejected setup form: {err}");
                    return write_error(req, 400, &err.to_string());
                }
            };
            if !enqueue(&inbox, InboundEvent::Credentials(record)) {
                return write_error(req, 503, "device is busy, retry");
            }
            write_html(req, 200, &portal::notice_page("Saved, restarting"))
        })?;
    }

    {
        let inbox = inbox.clone();
        server.fn_handler::<anyhow::Error, _>("/provision", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Some(event) = route_credential_write(&body) else {
                return write_error(req, 400, "malformed credential record");
            };
            if !enqueue(&inbox, event) {
                return write_error(req, 503, "device is busy, retry");
            }
            write_json(req, &serde_json::json!({ "status": "saved" }))
        })?;
    }

    {
        let status = status.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Get, move |req| {
            let snapshot = status
                .lock()
                .map_err(|_| anyhow!("status lock poisoned"))?
                .clone();
            match snapshot {
                Some(snapshot) => write_json(req, &snapshot),
                None => write_error(req, 503, "device is booting"),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/factory_reset", Method::Post, move |req| {
        if !enqueue(&inbox, InboundEvent::FactoryReset) {
            return write_error(req, 503, "device is busy, retry");
        }
        write_html(req, 200, &portal::notice_page("Settings erased, restarting"))
    })?;

    Ok(server)
}

fn enqueue(inbox: &SyncSender<InboundEvent>, event: InboundEvent) -> bool {
    match inbox.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("inbound queue full, dropping event");
            false
        }
        Err(TrySendError::Disconnected(_)) => {
            warn!("control loop is gone, dropping event");
            false
        }
    }
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_html(req: HttpRequest<'_, '_>, status_code: u16, page: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(page.as_bytes())?;
    Ok(())
}

fn write_json<T: serde::Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn esp_error(err: impl core::fmt::Debug) -> TransportError {
    TransportError::Io(format!("{err:?}"))
}

/// Device record stored as one JSON string in NVS.
#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<NvsDefault>, StoreError> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(format!("failed to open NVS: {err:?}")))
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("NVS lock poisoned".to_string())
}

impl CredentialStore for NvsStore {
    fn load(&self) -> Result<StoredDevice, StoreError> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let nvs = self.open()?;
        let len = nvs
            .str_len(NVS_DEVICE_KEY)
            .map_err(|err| StoreError::Backend(format!("{err:?}")))?;
        let Some(len) = len else {
            return Ok(StoredDevice::default());
        };
        // Reported length includes the terminating NUL.
        let mut buffer = vec![0_u8; len.max(1)];
        match nvs
            .get_str(NVS_DEVICE_KEY, &mut buffer)
            .map_err(|err| StoreError::Backend(format!("{err:?}")))?
        {
            Some(raw) => StoredDevice::from_json(raw),
            None => Ok(StoredDevice::default()),
        }
    }

    fn save(&self, device: &StoredDevice) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let mut nvs = self.open()?;
        let payload = device.to_json()?;
        if payload.len() > NVS_MAX_RECORD_BYTES {
            return Err(StoreError::Backend(format!(
                "device record is {} bytes, limit {NVS_MAX_RECORD_BYTES}",
                payload.len()
            )));
        }
        nvs.set_str(NVS_DEVICE_KEY, &payload)
            .map_err(|err| StoreError::Backend(format!("{err:?}")))
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let mut nvs = self.open()?;
        nvs.remove(NVS_DEVICE_KEY)
            .map(|_| ())
            .map_err(|err| StoreError::Backend(format!("{err:?}")))
    }
}

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl ClimateSensor for Dht22Sensor {
    fn read(&mut self) -> Option<ClimateReading> {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to set DHT22 line high before read: {err:?}");
            return None;
        }

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                debug!(
                    "[DHT22] {:.1} °C, {:.1} %",
                    reading.temperature, reading.relative_humidity
                );
                Some(ClimateReading {
                    temperature_c: reading.temperature,
                    humidity_pct: reading.relative_humidity,
                })
            }
            Err(err) => {
                warn!("failed to read DHT22 on GPIO{DHT_PIN}: {err:?}");
                None
            }
        }
    }

    fn reinitialize(&mut self) {
        let released = self
            .pin
            .set_pull(Pull::Up)
            .and_then(|_| self.pin.set_high());
        match released {
            Ok(()) => info!("DHT22 line released for re-initialization"),
            Err(err) => warn!("DHT22 re-initialization failed: {err:?}"),
        }
    }
}

struct GpioBoard {
    humidifier1: PinDriver<'static, AnyOutputPin, Output>,
    humidifier2: PinDriver<'static, AnyOutputPin, Output>,
    fan1: PinDriver<'static, AnyOutputPin, Output>,
    fan2: PinDriver<'static, AnyOutputPin, Output>,
    buzzer: PinDriver<'static, AnyOutputPin, Output>,
    water: PinDriver<'static, AnyIOPin, Input>,
    light: PinDriver<'static, AnyInputPin, Input>,
    reset: PinDriver<'static, AnyIOPin, Input>,
    buzzer_on: bool,
}

impl GpioBoard {
    fn set_buzzer(&mut self, on: bool) {
        let result = if on {
            self.buzzer.set_high()
        } else {
            self.buzzer.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive buzzer: {err:?}");
        }
    }
}

impl Board for GpioBoard {
    fn water_full(&mut self) -> bool {
        // Float switch pulls the line low when closed.
        self.water.is_low()
    }

    fn light_detected(&mut self) -> bool {
        self.light.is_high()
    }

    fn reset_pressed(&mut self) -> bool {
        self.reset.is_low()
    }

    fn drive(&mut self, actuator: Actuator, on: bool) {
        let pin = match actuator {
            Actuator::Humidifier1 => &mut self.humidifier1,
            Actuator::Humidifier2 => &mut self.humidifier2,
            Actuator::Fan1 => &mut self.fan1,
            Actuator::Fan2 => &mut self.fan2,
            Actuator::Buzzer => {
                self.buzzer_on = on;
                self.set_buzzer(on);
                return;
            }
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive {}: {err:?}", actuator.as_str());
        }
    }

    fn sound(&mut self, pattern: AlertPattern) {
        for &(on_ms, off_ms) in pattern.steps() {
            self.set_buzzer(true);
            thread::sleep(Duration::from_millis(on_ms));
            self.set_buzzer(false);
            thread::sleep(Duration::from_millis(off_ms));
        }
        self.set_buzzer(self.buzzer_on);
    }

    fn pause(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

struct WifiLink {
    wifi: EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
}

impl WifiLink {
    fn start_access_point(&mut self, provisioning: &ProvisioningConfig) -> anyhow::Result<()> {
        let mut wifi = BlockingWifi::wrap(&mut self.wifi, self.sys_loop.clone())?;
        wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
            ssid: provisioning
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
            password: provisioning
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("provisioning AP password too long"))?,
            auth_method: AuthMethod::WPAWPA2Personal,
            channel: 1,
            ..Default::default()
        }))?;
        wifi.start()?;
        wifi.wait_netif_up()?;
        info!(
            "provisioning AP started on `{}` (password: `{}`)",
            provisioning.ap_ssid, provisioning.ap_password
        );
        Ok(())
    }
}

impl Link for WifiLink {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), TransportError> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let configuration = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| TransportError::Io("wifi ssid too long".to_string()))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| TransportError::Io("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        self.wifi.set_configuration(&configuration).map_err(esp_error)?;
        if !self.wifi.is_started().map_err(esp_error)? {
            self.wifi.start().map_err(esp_error)?;
        }
        self.wifi.connect().map_err(esp_error)
    }

    fn is_up(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn abort(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err:?}");
        }
    }
}

/// ESP-IDF MQTT client. The client reconnects on its own once created, so
/// `connect` creates it on first use and then waits for the connected flag.
struct MqttSession {
    broker: BrokerConfig,
    topics: TopicSet,
    inbox: SyncSender<InboundEvent>,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl MqttSession {
    fn new(broker: BrokerConfig, topics: TopicSet, inbox: SyncSender<InboundEvent>) -> Self {
        Self {
            broker,
            topics,
            inbox,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn create_client(&mut self, client_id: &str) -> Result<(), TransportError> {
        let scheme = if self.broker.use_tls { "mqtts" } else { "mqtt" };
        let url = format!("{scheme}://{}:{}", self.broker.host, self.broker.port);

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: if self.broker.username.is_empty() {
                None
            } else {
                Some(self.broker.username.as_str())
            },
            password: if self.broker.password.is_empty() {
                None
            } else {
                Some(self.broker.password.as_str())
            },
            keep_alive_interval: Some(Duration::from_secs(self.broker.keep_alive_secs)),
            crt_bundle_attach: if self.broker.use_tls {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };

        let (client, connection) = EspMqttClient::new(&url, &conf).map_err(esp_error)?;
        spawn_mqtt_receiver(
            connection,
            self.connected.clone(),
            self.topics.clone(),
            self.inbox.clone(),
        )
        .map_err(|err| TransportError::Io(err.to_string()))?;
        info!("mqtt client created for {url}");
        self.client = Some(client);
        Ok(())
    }
}

impl Session for MqttSession {
    fn connect(&mut self, client_id: &str, deadline: Duration) -> Result<(), TransportError> {
        if self.client.is_none() {
            self.create_client(client_id)?;
        }

        let started = Instant::now();
        while started.elapsed() < deadline {
            if self.connected.load(Ordering::Relaxed) {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(SESSION_POLL_MS));
        }
        Err(TransportError::Timeout(deadline))
    }

    fn is_up(&mut self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .map(|_| ())
            .map_err(esp_error)
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
        client
            .enqueue(
                &message.topic,
                QoS::AtLeastOnce,
                message.retain,
                &message.payload,
            )
            .map(|_| ())
            .map_err(esp_error)
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    connected: Arc<AtomicBool>,
    topics: TopicSet,
    inbox: SyncSender<InboundEvent>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        connected.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Some(event) = route_broker_message(&topics, topic, data) {
                            enqueue(&inbox, event);
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
}

/// Registration and threshold endpoints over the ESP-IDF HTTP client.
struct EspBackend {
    registration_url: String,
    thresholds_url: String,
    timeout: Duration,
}

impl EspBackend {
    fn new(config: &BackendConfig) -> Self {
        Self {
            registration_url: config.registration_url.clone(),
            thresholds_url: config.thresholds_url.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    fn client(&self) -> Result<HttpClient<EspHttpConnection>, TransportError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        Ok(HttpClient::wrap(
            EspHttpConnection::new(&http_conf).map_err(esp_error)?,
        ))
    }
}

impl Backend for EspBackend {
    fn register(&mut self, request: &RegistrationRequest) -> Result<u16, TransportError> {
        let body =
            serde_json::to_vec(request).map_err(|err| TransportError::Decode(err.to_string()))?;
        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];

        let mut client = self.client()?;
        let mut http_request = client
            .request(Method::Post, &self.registration_url, &headers)
            .map_err(esp_error)?;
        http_request.write_all(&body).map_err(esp_error)?;
        http_request.flush().map_err(esp_error)?;
        let response = http_request.submit().map_err(esp_error)?;
        Ok(response.status())
    }

    fn fetch_thresholds(&mut self, compact_id: &str) -> Result<ThresholdResponse, TransportError> {
        let url =
            url::Url::parse_with_params(&self.thresholds_url, &[("controller_id", compact_id)])
                .map_err(|err| TransportError::Io(err.to_string()))?;

        let mut client = self.client()?;
        let mut response = client
            .get(url.as_str())
            .map_err(esp_error)?
            .submit()
            .map_err(esp_error)?;

        let status = response.status();
        if !(200..300).contains(&status) {
            return Err(TransportError::Status(status));
        }

        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(esp_error)?;
            if read == 0 {
                break;
            }
            if body.len() + read > MAX_HTTP_BODY {
                return Err(TransportError::Decode("threshold response too large".to_string()));
            }
            body.extend_from_slice(&chunk[..read]);
        }

        ThresholdResponse::parse(&body).map_err(|err| TransportError::Decode(err.to_string()))
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
