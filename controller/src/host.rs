use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

use relaynode_common::{
    input_payload, parse_command, parse_port, parse_relay_form, relay_payload, select_boot_mode,
    ConnectivityMode, DebouncedInput, DeviceIdentity, MacAddress, MqttConfig, MqttConfigView,
    MqttTopics, RelayArbiter, RelaySource, StatusPayload, WifiConfig,
};

const LOOP_PERIOD_MS: u64 = 10;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

/// Deterministic stand-in for the factory MAC on simulation builds.
const SIM_MAC: MacAddress = [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE];

#[derive(Clone)]
struct AppState {
    identity: Arc<DeviceIdentity>,
    relay: Arc<Mutex<RelayArbiter>>,
    input: Arc<Mutex<DebouncedInput>>,
    /// Simulated raw level of the dry contact; hardware builds read a GPIO.
    sim_input_open: Arc<AtomicBool>,
    mqtt_cfg: Arc<Mutex<MqttConfig>>,
    topics: Arc<Mutex<MqttTopics>>,
    session: Arc<Mutex<Option<MqttSession>>>,
    mqtt_connected: Arc<AtomicBool>,
    http_addr: Arc<String>,
    store: AppStore,
}

struct MqttSession {
    client: AsyncClient,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct AppStore {
    wifi_path: Arc<PathBuf>,
    mqtt_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    err: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let identity = DeviceIdentity::from_mac(SIM_MAC);
    info!(
        "device id {}, mDNS host {} (simulated)",
        identity.device_id, identity.mdns_host
    );

    let wifi_cfg = store.load_wifi_config().await.unwrap_or_else(|err| {
        warn!("failed to load wifi config from store: {err:#}");
        WifiConfig::default()
    });

    // On hardware the boot decision commits to one network personality;
    // the simulation always has connectivity, so association trivially
    // succeeds and provisioning mode is only reported, not entered.
    let mode = select_boot_mode(&wifi_cfg, || true);
    if mode == ConnectivityMode::AccessPoint {
        warn!("no wifi credentials stored; hardware would boot the provisioning AP");
    }

    let mqtt_cfg = store.load_mqtt_config().await.unwrap_or_else(|err| {
        warn!("failed to load mqtt config from store: {err:#}");
        MqttConfig::default()
    });
    let topics = MqttTopics::derive(&mqtt_cfg);

    let port = std::env::var("RELAYNODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    // The simulated dry contact boots open, so the relay boots off.
    let state = AppState {
        identity: Arc::new(identity),
        relay: Arc::new(Mutex::new(RelayArbiter::new(false))),
        input: Arc::new(Mutex::new(DebouncedInput::new(true, monotonic_ms()))),
        sim_input_open: Arc::new(AtomicBool::new(true)),
        mqtt_cfg: Arc::new(Mutex::new(mqtt_cfg)),
        topics: Arc::new(Mutex::new(topics)),
        session: Arc::new(Mutex::new(None)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        http_addr: Arc::new(format!("127.0.0.1:{port}")),
        store,
    };

    spawn_control_loop(state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route_service("/settings", ServeFile::new(format!("{web_root}/settings.html")))
        .route("/api/status", get(handle_get_status))
        .route("/api/relay", post(handle_post_relay))
        .route("/api/mqtt", get(handle_get_mqtt).post(handle_post_mqtt))
        .route("/sim/input", post(handle_sim_input))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().unwrap();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("relaynode controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/* ---------- control loop ---------- */

fn spawn_control_loop(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(LOOP_PERIOD_MS));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let raw_open = state.sim_input_open.load(Ordering::Relaxed);
            let (edge, input_closed) = {
                let mut input = state.input.lock().await;
                let edge = input.sample(raw_open, now_ms);
                (edge, input.is_closed())
            };

            if let Some(edge) = edge {
                info!(
                    "input settled {}",
                    if edge.open { "open" } else { "closed" }
                );
                publish_input_state(&state, edge.open).await;
            }

            reconcile_relay(&state, input_closed).await;
            ensure_mqtt_session(&state).await;
        }
    });
}

/* ---------- relay ---------- */

async fn request_relay(state: &AppState, desired: bool, source: RelaySource) {
    let changed = { state.relay.lock().await.request(desired, source) };
    if let Some(on) = changed {
        info!("relay {} ({:?})", relay_payload(on), source);
        publish_relay_state(state, on).await;
    }
}

async fn reconcile_relay(state: &AppState, input_closed: bool) {
    let changed = { state.relay.lock().await.reconcile(input_closed) };
    if let Some(on) = changed {
        info!("relay {} (input)", relay_payload(on));
        publish_relay_state(state, on).await;
    }
}

/* ---------- mqtt session ---------- */

async fn ensure_mqtt_session(state: &AppState) {
    if !state.mqtt_cfg.lock().await.ready() {
        return;
    }
    if state.session.lock().await.is_some() {
        return;
    }

    let cfg = state.mqtt_cfg.lock().await.clone();
    let mut options = MqttOptions::new(state.identity.mqtt_client_id(), cfg.host.clone(), cfg.port);
    if !cfg.user.is_empty() {
        options.set_credentials(cfg.user.clone(), cfg.pass.clone());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    let task = spawn_mqtt_loop(state.clone(), eventloop);
    *state.session.lock().await = Some(MqttSession { client, task });
    info!("mqtt session started ({}:{})", cfg.host, cfg.port);
}

async fn drop_mqtt_session(state: &AppState) {
    if let Some(session) = state.session.lock().await.take() {
        session.task.abort();
        state.mqtt_connected.store(false, Ordering::Relaxed);
        info!("mqtt session dropped; next tick reconnects with fresh settings");
    }
}

fn spawn_mqtt_loop(state: AppState, mut eventloop: rumqttc::EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    state.mqtt_connected.store(true, Ordering::Relaxed);
                    if let Err(err) = announce_session(&state).await {
                        warn!("mqtt announce failed: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&state, &message.topic, &message.payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// On broker accept: subscribe for commands and publish retained snapshots
/// of the relay and the debounced input.
async fn announce_session(state: &AppState) -> anyhow::Result<()> {
    let topics = state.topics.lock().await.clone();
    let relay_on = state.relay.lock().await.commanded();
    let input_open = state.input.lock().await.is_open();

    let client = { state.session.lock().await.as_ref().map(|s| s.client.clone()) };
    let Some(client) = client else {
        return Ok(());
    };

    client.subscribe(topics.cmd.clone(), QoS::AtMostOnce).await?;
    client
        .publish(topics.state, QoS::AtLeastOnce, true, relay_payload(relay_on))
        .await?;
    client
        .publish(topics.din, QoS::AtLeastOnce, true, input_payload(input_open))
        .await?;
    Ok(())
}

async fn handle_mqtt_message(state: &AppState, topic: &str, payload: &[u8]) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return;
    }

    let cmd_topic = state.topics.lock().await.cmd.clone();
    if topic != cmd_topic {
        return;
    }

    let Ok(message) = core::str::from_utf8(payload) else {
        return;
    };
    if let Some(desired) = parse_command(message) {
        request_relay(state, desired, RelaySource::RemoteApi).await;
    }
}

async fn publish_relay_state(state: &AppState, on: bool) {
    let topic = state.topics.lock().await.state.clone();
    publish_retained(state, topic, relay_payload(on)).await;
}

async fn publish_input_state(state: &AppState, open: bool) {
    let topic = state.topics.lock().await.din.clone();
    publish_retained(state, topic, input_payload(open)).await;
}

async fn publish_retained(state: &AppState, topic: String, payload: &'static str) {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return;
    }

    let client = { state.session.lock().await.as_ref().map(|s| s.client.clone()) };
    let Some(client) = client else {
        return;
    };

    if let Err(err) = client
        .publish(topic.clone(), QoS::AtLeastOnce, true, payload)
        .await
    {
        warn!("publish to {topic} failed: {err}");
    }
}

/* ---------- http handlers ---------- */

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let cfg = state.mqtt_cfg.lock().await.clone();

    let status = StatusPayload {
        ok: true,
        ip: state.http_addr.as_ref().clone(),
        mdns: state.identity.mdns_fqdn.clone(),
        relay: state.relay.lock().await.commanded(),
        input_pressed: state.input.lock().await.is_closed(),
        mqtt_enabled: cfg.enabled,
        mqtt_connected: state.mqtt_connected.load(Ordering::Relaxed),
        cmd_topic: cfg.cmd_topic,
    };

    Json(status)
}

async fn handle_post_relay(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("state") else {
        return error_response(StatusCode::BAD_REQUEST, "missing_state");
    };

    // The dry contact stays master; a conflicting request is corrected on
    // the next control-loop tick.
    request_relay(&state, parse_relay_form(value), RelaySource::RemoteApi).await;

    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn handle_get_mqtt(State(state): State<AppState>) -> impl IntoResponse {
    let view = MqttConfigView::from_config(&state.mqtt_cfg.lock().await.clone());
    Json(view)
}

async fn handle_post_mqtt(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let updated = {
        let mut cfg = state.mqtt_cfg.lock().await;
        cfg.enabled = params
            .get("enabled")
            .map(|v| parse_relay_form(v))
            .unwrap_or(false);
        cfg.host = params.get("host").cloned().unwrap_or_default();
        cfg.port = parse_port(params.get("port").map(String::as_str).unwrap_or_default());
        cfg.user = params.get("user").cloned().unwrap_or_default();
        if let Some(pass) = params.get("pass") {
            // Stored password only changes when a new one is supplied.
            if !pass.is_empty() {
                cfg.pass = pass.clone();
            }
        }
        cfg.cmd_topic = params.get("cmdTopic").cloned().unwrap_or_default();
        cfg.state_topic = params.get("stateTopic").cloned().unwrap_or_default();
        cfg.clone()
    };

    if let Err(err) = state.store.save_mqtt_config(&updated).await {
        warn!("failed to persist mqtt settings: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "persist_failed");
    }

    *state.topics.lock().await = MqttTopics::derive(&updated);
    drop_mqtt_session(&state).await;

    Json(serde_json::json!({ "ok": true })).into_response()
}

/// Simulation-only: flips the raw level the control loop samples, standing
/// in for the physical dry contact.
async fn handle_sim_input(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("state") else {
        return error_response(StatusCode::BAD_REQUEST, "missing_state");
    };

    let open = match value.as_str() {
        "open" => true,
        "closed" => false,
        _ => return error_response(StatusCode::BAD_REQUEST, "invalid_state"),
    };

    state.sim_input_open.store(open, Ordering::Relaxed);
    Json(serde_json::json!({ "ok": true })).into_response()
}

/* ---------- persistence ---------- */

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("RELAYNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.relaynode"));

        Self {
            wifi_path: Arc::new(data_dir.join("wifi.json")),
            mqtt_path: Arc::new(data_dir.join("mqtt.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_wifi_config(&self) -> anyhow::Result<WifiConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.wifi_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<WifiConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(WifiConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_mqtt_config(&self) -> anyhow::Result<MqttConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.mqtt_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<MqttConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(MqttConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_mqtt_config(&self, cfg: &MqttConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.mqtt_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(cfg)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

/* ---------- helpers ---------- */

fn error_response(status: StatusCode, code: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            ok: false,
            err: code.to_string(),
        }),
    )
        .into_response()
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
