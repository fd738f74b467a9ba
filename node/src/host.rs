use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use millo_common::{
    config::{BackendConfig, BrokerConfig},
    route_broker_message, route_credential_write, Backend, CredentialStore, CycleClock,
    CycleOutcome, Device, DeviceConfig, DeviceIdentity, DeviceStatus, InboundEvent,
    OutboundMessage, Ports, RegistrationRequest, RestartReason, Session, StoreError, StoredDevice,
    ThresholdResponse, TopicSet, TransportError,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, watch,
    },
};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::portal;
use crate::sim::{SimBoard, SimClimate, SimLink};

const DEFAULT_DATA_DIR: &str = "./.millo";
const CONFIG_FILE: &str = "config.json";
const DEVICE_FILE: &str = "device.json";
const DEFAULT_HTTP_PORT: u16 = 8080;
/// Locally administered address used when `MILLO_DEVICE_MAC` is unset.
const DEFAULT_MAC: [u8; 6] = [0x02, 0x4d, 0x49, 0x4c, 0x4c, 0x4f];
const MQTT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
struct AppState {
    inbox: mpsc::Sender<InboundEvent>,
    status: watch::Receiver<Option<DeviceStatus>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct AckBody {
    status: &'static str,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("MILLO_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

    let mut config = load_config(&data_dir).await?;
    apply_env_overrides(&mut config)?;
    config.sanitize();

    let identity = match std::env::var("MILLO_DEVICE_MAC") {
        Ok(text) => DeviceIdentity::parse(&text, &config.identity.name_prefix)
            .with_context(|| format!("invalid MILLO_DEVICE_MAC `{text}`"))?,
        Err(_) => DeviceIdentity::from_mac(DEFAULT_MAC, &config.identity.name_prefix),
    };

    info!(
        "node {} ({}) using data dir {}, broker `{}:{}`, {} telemetry",
        identity.device_name(),
        identity.controller_id(),
        data_dir.display(),
        config.broker.host,
        config.broker.port,
        config.telemetry.format.as_str(),
    );

    let http_port = std::env::var("MILLO_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);

    let (inbox_tx, inbox_rx) = mpsc::channel(config.cycle.inbox_capacity);
    let (status_tx, status_rx) = watch::channel(None);

    let control = ControlLoop {
        runtime: Handle::current(),
        config,
        identity,
        store: FileStore::new(data_dir.join(DEVICE_FILE)),
        inbox: inbox_rx,
        inbox_tx: inbox_tx.clone(),
        status: status_tx,
    };
    thread::Builder::new()
        .name("control-loop".into())
        .spawn(move || control.run())
        .context("failed to spawn control loop thread")?;

    let app_state = AppState {
        inbox: inbox_tx,
        status: status_rx,
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/save", post(save))
        .route("/provision", post(provision))
        .route("/config", get(device_config))
        .route("/factory_reset", post(factory_reset))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind setup surface at {addr}"))?;

    info!("setup surface listening on http://{addr}");

    tokio::select! {
        served = axum::serve(listener, app) => served.context("setup surface stopped")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}

async fn load_config(data_dir: &Path) -> anyhow::Result<DeviceConfig> {
    let path = data_dir.join(CONFIG_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!("ignoring invalid {}: {err}", path.display());
                Ok(local_defaults())
            }
        },
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("no {}, using defaults with a local broker", path.display());
            Ok(local_defaults())
        }
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn local_defaults() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.broker.host = "127.0.0.1".to_string();
    config.broker.port = 1883;
    config.broker.use_tls = false;
    config
}

fn apply_env_overrides(config: &mut DeviceConfig) -> anyhow::Result<()> {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.broker.port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.broker.username = user;
        config.broker.password = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(format) = std::env::var("MILLO_WIRE_FORMAT") {
        config.telemetry.format = format
            .parse()
            .map_err(|err: String| anyhow!("MILLO_WIRE_FORMAT: {err}"))?;
    }
    Ok(())
}

/// Owns the device between restarts. A restart drops every port and boots a
/// fresh `Device` from the store.
struct ControlLoop {
    runtime: Handle,
    config: DeviceConfig,
    identity: DeviceIdentity,
    store: FileStore,
    inbox: mpsc::Receiver<InboundEvent>,
    inbox_tx: mpsc::Sender<InboundEvent>,
    status: watch::Sender<Option<DeviceStatus>>,
}

impl ControlLoop {
    fn run(mut self) {
        loop {
            let reason = self.boot();
            warn!("restarting: {}", reason.as_str());
            thread::sleep(Duration::from_millis(
                self.config.provisioning.restart_delay_ms,
            ));
        }
    }

    fn boot(&mut self) -> RestartReason {
        // Requests queued before a restart do not survive it.
        while self.inbox.try_recv().is_ok() {}

        let mut device = Device::boot(
            self.config.clone(),
            self.identity.clone(),
            &self.store,
            monotonic_ms(),
        );

        let mut climate = SimClimate::from_env();
        let mut board = SimBoard::from_env();
        let mut link = SimLink::from_env();
        let mut session = MqttSession::start(
            &self.runtime,
            &device.config().broker,
            &self.identity.client_id(),
            device.topics().clone(),
            self.inbox_tx.clone(),
        );
        let mut backend = HttpBackend::new(&device.config().backend);

        device.drive_boot_outputs(&mut board);
        if device.is_provisioning() {
            info!(
                "no credentials stored; open the setup surface or join `{}`",
                device.config().provisioning.ap_ssid
            );
        }

        let period = Duration::from_millis(device.config().cycle.period_ms);
        loop {
            let started = Instant::now();
            let pending: Vec<InboundEvent> =
                std::iter::from_fn(|| self.inbox.try_recv().ok()).collect();

            let clock = CycleClock {
                now_ms: monotonic_ms(),
                epoch_secs: Utc::now().timestamp(),
            };
            let mut ports = Ports {
                climate: &mut climate,
                board: &mut board,
                link: &mut link,
                session: &mut session,
                backend: &mut backend,
                store: &self.store,
            };
            let outcome = device.run_cycle(clock, pending, &mut ports);
            self.status.send_replace(Some(device.status(clock.now_ms)));

            if let CycleOutcome::Restart(reason) = outcome {
                return reason;
            }
            if let Some(rest) = period.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}

async fn index(State(state): State<AppState>) -> Response {
    let status = state.status.borrow().clone();
    match status {
        Some(status) => Html(portal::index_page(&status)).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "device is booting"),
    }
}

async fn save(State(state): State<AppState>, body: Bytes) -> Response {
    let record = match portal::parse_form(&body) {
        Ok(record) => record,
        Err(err) => {
            warn!("rejected setup form: {err}");
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    if !enqueue(&state.inbox, InboundEvent::Credentials(record)) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device is busy, retry");
    }
    Html(portal::notice_page("Saved, restarting")).into_response()
}

/// JSON credential write, the host stand-in for the short-range exchange.
async fn provision(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(event) = route_credential_write(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "malformed credential record");
    };
    if !enqueue(&state.inbox, event) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device is busy, retry");
    }
    Json(AckBody { status: "saved" }).into_response()
}

async fn device_config(State(state): State<AppState>) -> Response {
    let status = state.status.borrow().clone();
    match status {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "device is booting"),
    }
}

async fn factory_reset(State(state): State<AppState>) -> Response {
    if !enqueue(&state.inbox, InboundEvent::FactoryReset) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "device is busy, retry");
    }
    Html(portal::notice_page("Settings erased, restarting")).into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

/// Hands an event to the control loop without waiting. A full queue drops it.
fn enqueue(inbox: &mpsc::Sender<InboundEvent>, event: InboundEvent) -> bool {
    match inbox.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("inbound queue full, dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!("control loop is gone, dropping event");
            false
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Device record kept as a JSON file under the data directory.
#[derive(Debug, Clone)]
struct FileStore {
    path: PathBuf,
}

impl FileStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> Result<StoredDevice, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => StoredDevice::from_json(&raw),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StoredDevice::default()),
            Err(err) => Err(StoreError::Backend(format!(
                "failed to read {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, device: &StoredDevice) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Backend(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let payload = serde_json::to_vec_pretty(device)?;
        std::fs::write(&self.path, payload).map_err(|err| {
            StoreError::Backend(format!("failed to write {}: {err}", self.path.display()))
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(format!(
                "failed to remove {}: {err}",
                self.path.display()
            ))),
        }
    }
}

struct ConnectRequest {
    deadline: Duration,
    reply: oneshot::Sender<Result<(), TransportError>>,
}

/// Broker session over rumqttc. The event loop runs on the tokio runtime; the
/// control loop only talks to it through non-blocking client calls and a
/// connect request that is answered within its deadline.
struct MqttSession {
    client: AsyncClient,
    requests: mpsc::Sender<ConnectRequest>,
    connected: Arc<AtomicBool>,
}

impl MqttSession {
    fn start(
        runtime: &Handle,
        broker: &BrokerConfig,
        client_id: &str,
        topics: TopicSet,
        inbox: mpsc::Sender<InboundEvent>,
    ) -> Self {
        let mut mqtt_options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs.max(5)));
        if !broker.username.is_empty() {
            mqtt_options.set_credentials(broker.username.clone(), broker.password.clone());
        }
        if broker.use_tls {
            warn!(
                "broker TLS is only wired up on esp32; using plain TCP to {}:{}",
                broker.host, broker.port
            );
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, MQTT_CHANNEL_CAPACITY);
        let (requests, pending) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(false));
        runtime.spawn(drive_session(
            eventloop,
            pending,
            connected.clone(),
            topics,
            inbox,
        ));

        Self {
            client,
            requests,
            connected,
        }
    }
}

impl Session for MqttSession {
    fn connect(&mut self, client_id: &str, deadline: Duration) -> Result<(), TransportError> {
        debug!("requesting broker session for {client_id}");
        let (reply, outcome) = oneshot::channel();
        self.requests
            .blocking_send(ConnectRequest { deadline, reply })
            .map_err(|_| TransportError::Io("session task stopped".to_string()))?;
        outcome
            .blocking_recv()
            .map_err(|_| TransportError::Io("session task stopped".to_string()))?
    }

    fn is_up(&mut self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.is_up() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.is_up() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .try_publish(
                message.topic.clone(),
                QoS::AtLeastOnce,
                message.retain,
                message.payload.clone(),
            )
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        let _ = self.client.try_disconnect();
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Incoming::ConnAck(ack)) = eventloop.poll().await? {
            info!("mqtt connected ({:?})", ack.code);
            return Ok(());
        }
    }
}

async fn drive_session(
    mut eventloop: EventLoop,
    mut requests: mpsc::Receiver<ConnectRequest>,
    connected: Arc<AtomicBool>,
    topics: TopicSet,
    inbox: mpsc::Sender<InboundEvent>,
) {
    while let Some(request) = requests.recv().await {
        let outcome = match tokio::time::timeout(request.deadline, await_connack(&mut eventloop))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TransportError::Io(err.to_string())),
            Err(_) => Err(TransportError::Timeout(request.deadline)),
        };
        let established = outcome.is_ok();
        connected.store(established, Ordering::Relaxed);
        let _ = request.reply.send(outcome);
        if !established {
            continue;
        }

        loop {
            tokio::select! {
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if let Some(event) =
                            route_broker_message(&topics, &message.topic, &message.payload)
                        {
                            enqueue(&inbox, event);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        connected.store(false, Ordering::Relaxed);
                        break;
                    }
                },
                request = requests.recv() => match request {
                    Some(request) => {
                        let _ = request.reply.send(Ok(()));
                    }
                    None => return,
                },
            }
        }
    }
}

/// Registration and threshold endpoints over ureq.
struct HttpBackend {
    agent: ureq::Agent,
    registration_url: String,
    thresholds_url: String,
    timeout: Duration,
}

impl HttpBackend {
    fn new(config: &BackendConfig) -> Self {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            registration_url: config.registration_url.clone(),
            thresholds_url: config.thresholds_url.clone(),
            timeout,
        }
    }

    fn transport_error(&self, err: ureq::Error) -> TransportError {
        match err {
            ureq::Error::Timeout(_) => TransportError::Timeout(self.timeout),
            other => TransportError::Io(other.to_string()),
        }
    }
}

impl Backend for HttpBackend {
    fn register(&mut self, request: &RegistrationRequest) -> Result<u16, TransportError> {
        let response = self
            .agent
            .post(self.registration_url.as_str())
            .send_json(request)
            .map_err(|err| self.transport_error(err))?;
        Ok(response.status().as_u16())
    }

    fn fetch_thresholds(&mut self, compact_id: &str) -> Result<ThresholdResponse, TransportError> {
        let mut response = self
            .agent
            .get(self.thresholds_url.as_str())
            .query("controller_id", compact_id)
            .call()
            .map_err(|err| self.transport_error(err))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(TransportError::Status(status));
        }

        let body = response
            .body_mut()
            .read_to_vec()
            .map_err(|err| TransportError::Decode(err.to_string()))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use millo_common::Credentials;
    use pretty_assertions::assert_eq;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("millo-node-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_store_starts_blank_and_round_trips() {
        let dir = scratch_dir("store");
        let store = FileStore::new(dir.join("nested").join(DEVICE_FILE));
        assert_eq!(store.load().unwrap(), StoredDevice::default());

        let device = StoredDevice {
            credentials: Credentials {
                ssid: "greenhouse".to_string(),
                password: "secret".to_string(),
                email: "grower@example.com".to_string(),
                controller_name: "Room 1".to_string(),
                factory_name: "North".to_string(),
            },
            registered: true,
        };
        store.save(&device).unwrap();
        assert_eq!(store.load().unwrap(), device);

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), StoredDevice::default());
        store.clear().unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = scratch_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DEVICE_FILE);
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_or_invalid_config_falls_back_to_local_broker() {
        let dir = scratch_dir("config");
        let config = load_config(&dir).await.unwrap();
        assert_eq!(config.broker.host, "127.0.0.1");
        assert!(!config.broker.use_tls);

        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), r#"{"broker":{"port":1884}}"#).unwrap();
        let config = load_config(&dir).await.unwrap();
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.host, "api.milloserver.uk");

        std::fs::write(dir.join(CONFIG_FILE), "[]").unwrap();
        let config = load_config(&dir).await.unwrap();
        assert_eq!(config.broker.port, 1883);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
