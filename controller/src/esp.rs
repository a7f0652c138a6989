use std::{
    io::ErrorKind,
    net::{Ipv4Addr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, Configuration as IpConfiguration,
        DHCPClientSettings,
    },
    log::EspLogger,
    mdns::EspMdns,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use relaynode_common::{
    dns, input_payload, parse_command, parse_port, parse_relay_form, relay_payload,
    select_boot_mode, ConnectivityMode, DebouncedInput, DeviceIdentity, MacAddress, MqttConfig,
    MqttConfigView, MqttTopics, RelayArbiter, RelaySource, StatusPayload, WifiConfig,
};

const RELAY_GPIO: i32 = 16;
const INPUT_GPIO: i32 = 25;
const RELAY_ACTIVE_LOW: bool = false;

const LOOP_PERIOD_MS: u64 = 10;
const WIFI_CONNECT_TIMEOUT_MS: u64 = 20_000;
const WIFI_POLL_INTERVAL_MS: u64 = 250;
const AP_STARTUP_TIMEOUT_MS: u64 = 5_000;
const DNS_PORT: u16 = 53;
const HTTP_PORT: u16 = 80;
const PROVISION_RESTART_DELAY_MS: u64 = 350;

const NVS_NAMESPACE: &str = "relaynode";
const NVS_WIFI_KEY: &str = "wifi_json";
const NVS_MQTT_KEY: &str = "mqtt_json";
const NVS_BUFFER_SIZE: usize = 1024;

const MAX_HTTP_BODY: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

const INDEX_HTML: &str = include_str!("../web/index.html");
const SETTINGS_HTML: &str = include_str!("../web/settings.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

const AP_PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>RelayNode Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>RelayNode Setup</h1>
  <p class="muted">Enter your Wi-Fi network. The device restarts and joins it.</p>
  <div class="card">
    <label>Network name (SSID)</label><input id="ssid" type="text">
    <label>Password</label><input id="pass" type="password">
    <button id="save">Save &amp; Restart</button>
    <div id="status" class="muted"></div>
  </div>
  <script>
    const q=(id)=>document.getElementById(id);
    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const body=new URLSearchParams({ssid:q('ssid').value,pass:q('pass').value});
        const r=await fetch('/api/wifi',{method:'POST',body});
        const b=await r.json();
        if(!r.ok)throw new Error(b.err||('Request failed: '+r.status));
        q('status').className='ok';
        q('status').textContent='Saved. The device is restarting; reconnect to your own network.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });
  </script>
</body>
</html>
"#;

// Paths OS captive-portal probes request; all of them get the setup page.
const CAPTIVE_PROBE_PATHS: [&str; 7] = [
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

struct RelayOutput {
    arbiter: RelayArbiter,
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl RelayOutput {
    fn drive(&mut self, on: bool) {
        let result = if on != RELAY_ACTIVE_LOW {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive relay GPIO: {err}");
        }
    }
}

struct MqttSession {
    client: EspMqttClient<'static>,
}

#[derive(Clone)]
struct SharedState {
    identity: Arc<DeviceIdentity>,
    relay: Arc<Mutex<RelayOutput>>,
    input: Arc<Mutex<DebouncedInput>>,
    mqtt_cfg: Arc<Mutex<MqttConfig>>,
    topics: Arc<Mutex<MqttTopics>>,
    session: Arc<Mutex<Option<MqttSession>>>,
    mqtt_connected: Arc<AtomicBool>,
    ip: Arc<Mutex<String>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let identity = DeviceIdentity::from_mac(read_factory_mac());
    info!("device id {}, mDNS host {}", identity.device_id, identity.mdns_host);

    let wifi_cfg = nvs_store.load_wifi_config().unwrap_or_else(|err| {
        warn!("failed to load wifi config from NVS: {err:#}");
        WifiConfig::default()
    });
    let mqtt_cfg = nvs_store.load_mqtt_config().unwrap_or_else(|err| {
        warn!("failed to load mqtt config from NVS: {err:#}");
        MqttConfig::default()
    });
    let topics = MqttTopics::derive(&mqtt_cfg);

    let Peripherals { modem, .. } = Peripherals::take()?;

    let relay_pin = PinDriver::output(unsafe { AnyOutputPin::new(RELAY_GPIO) })?;
    let mut input_pin = PinDriver::input(unsafe { AnyIOPin::new(INPUT_GPIO) })?;
    input_pin.set_pull(Pull::Up)?;

    // Relay state is never persisted: it follows the dry contact at boot.
    let initial_open = input_pin.is_high();
    let input = DebouncedInput::new(initial_open, monotonic_ms());
    let mut relay = RelayOutput {
        arbiter: RelayArbiter::new(!initial_open),
        pin: relay_pin,
    };
    relay.drive(relay.arbiter.commanded());
    info!(
        "boot input {} -> relay {}",
        if initial_open { "open" } else { "closed" },
        relay_payload(relay.arbiter.commanded())
    );

    let state = SharedState {
        identity: Arc::new(identity),
        relay: Arc::new(Mutex::new(relay)),
        input: Arc::new(Mutex::new(input)),
        mqtt_cfg: Arc::new(Mutex::new(mqtt_cfg)),
        topics: Arc::new(Mutex::new(topics)),
        session: Arc::new(Mutex::new(None)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        ip: Arc::new(Mutex::new(String::new())),
    };

    let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

    let mode = select_boot_mode(&wifi_cfg, || {
        match associate_station(&mut wifi, &wifi_cfg, &state.identity) {
            Ok(connected) => connected,
            Err(err) => {
                warn!("wifi station setup failed: {err:#}");
                false
            }
        }
    });
    info!("committed to {} mode", mode.as_str());

    match mode {
        ConnectivityMode::Station => {
            disable_wifi_power_save();

            let ip = wifi.sta_netif().get_ip_info()?.ip;
            *state.ip.lock().unwrap() = ip.to_string();

            let _mdns = match start_mdns(&state.identity) {
                Ok(mdns) => Some(mdns),
                Err(err) => {
                    warn!("mDNS start failed: {err:#}");
                    None
                }
            };
            let _server = create_http_server(state.clone(), nvs_store)?;
            let _wifi = wifi;

            run_station_loop(&state, input_pin)
        }
        ConnectivityMode::AccessPoint => {
            let ap_ip = start_access_point(&mut wifi, &state.identity.device_id)?;
            *state.ip.lock().unwrap() = ap_ip.to_string();

            let captive_dns = CaptiveDns::bind(ap_ip)?;
            let _server = create_ap_http_server(nvs_store)?;
            let _wifi = wifi;

            run_portal_loop(&state, input_pin, captive_dns)
        }
    }
}

/* ---------- control loop ---------- */

fn run_station_loop(state: &SharedState, mut input_pin: PinDriver<'static, AnyIOPin, Input>) -> ! {
    info!("station control loop running");
    loop {
        let now_ms = monotonic_ms();
        input_relay_tick(state, &mut input_pin, now_ms);
        ensure_mqtt_session(state);
        thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
    }
}

fn run_portal_loop(
    state: &SharedState,
    mut input_pin: PinDriver<'static, AnyIOPin, Input>,
    captive_dns: CaptiveDns,
) -> ! {
    info!("provisioning portal loop running");
    loop {
        let now_ms = monotonic_ms();
        input_relay_tick(state, &mut input_pin, now_ms);
        captive_dns.service();
        thread::sleep(Duration::from_millis(LOOP_PERIOD_MS));
    }
}

/// Debounce the dry contact and re-assert its authority over the relay.
/// Runs every tick in both connectivity modes.
fn input_relay_tick(
    state: &SharedState,
    input_pin: &mut PinDriver<'static, AnyIOPin, Input>,
    now_ms: u64,
) {
    let raw_open = input_pin.is_high();

    let (edge, input_closed) = {
        let mut input = state.input.lock().unwrap();
        let edge = input.sample(raw_open, now_ms);
        (edge, input.is_closed())
    };

    if let Some(edge) = edge {
        info!("input settled {}", if edge.open { "open" } else { "closed" });
        publish_input_state(state, edge.open);
    }

    reconcile_relay(state, input_closed);
}

/* ---------- relay ---------- */

fn request_relay(state: &SharedState, desired: bool, source: RelaySource) {
    let changed = {
        let mut relay = state.relay.lock().unwrap();
        let changed = relay.arbiter.request(desired, source);
        if let Some(on) = changed {
            relay.drive(on);
        }
        changed
    };

    if let Some(on) = changed {
        info!("relay {} ({:?})", relay_payload(on), source);
        publish_relay_state(state, on);
    }
}

fn reconcile_relay(state: &SharedState, input_closed: bool) {
    let changed = {
        let mut relay = state.relay.lock().unwrap();
        let changed = relay.arbiter.reconcile(input_closed);
        if let Some(on) = changed {
            relay.drive(on);
        }
        changed
    };

    if let Some(on) = changed {
        info!("relay {} (input)", relay_payload(on));
        publish_relay_state(state, on);
    }
}

/* ---------- wifi ---------- */

fn read_factory_mac() -> MacAddress {
    let mut mac: MacAddress = [0_u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

fn build_sta_netif(hostname: &str) -> anyhow::Result<EspNetif> {
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::DHCP(
            DHCPClientSettings {
                hostname: Some(
                    hostname
                        .try_into()
                        .map_err(|_| anyhow!("hostname too long: {hostname}"))?,
                ),
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn associate_station(
    wifi: &mut EspWifi<'static>,
    network: &WifiConfig,
    identity: &DeviceIdentity,
) -> anyhow::Result<bool> {
    // Hostname has to be in place before association starts.
    let sta_netif = build_sta_netif(&identity.mdns_host)?;
    wifi.swap_netif_sta(sta_netif)
        .context("failed to apply station netif configuration")?;

    let auth_method = if network.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    wifi.connect()?;
    info!("wifi started, associating with `{}`", network.ssid);

    let deadline = Instant::now() + Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS);
    while Instant::now() < deadline {
        if wifi.is_connected().unwrap_or(false) {
            if let Ok(ip_info) = wifi.sta_netif().get_ip_info() {
                if !ip_info.ip.is_unspecified() {
                    info!("wifi connected, ip {}", ip_info.ip);
                    return Ok(true);
                }
            }
        }
        thread::sleep(Duration::from_millis(WIFI_POLL_INTERVAL_MS));
    }

    warn!(
        "wifi association timed out after {}s",
        WIFI_CONNECT_TIMEOUT_MS / 1000
    );
    let _ = wifi.disconnect();
    let _ = wifi.stop();
    Ok(false)
}

fn start_access_point(wifi: &mut EspWifi<'static>, device_id: &str) -> anyhow::Result<Ipv4Addr> {
    let ap_ssid = format!("RelayNode-{device_id}");

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP ssid too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;

    let deadline = Instant::now() + Duration::from_millis(AP_STARTUP_TIMEOUT_MS);
    loop {
        let ip = wifi.ap_netif().get_ip_info()?.ip;
        if !ip.is_unspecified() {
            info!("open AP `{ap_ssid}` up at {ip}");
            return Ok(ip);
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("access point failed to come up"));
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn start_mdns(identity: &DeviceIdentity) -> anyhow::Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(&identity.mdns_host)?;
    mdns.set_instance_name(&identity.device_id)?;
    mdns.add_service(None, "_http", "_tcp", HTTP_PORT, &[])?;
    info!("mDNS: http://{}/", identity.mdns_fqdn);
    Ok(mdns)
}

/* ---------- captive DNS ---------- */

struct CaptiveDns {
    socket: UdpSocket,
    ip: [u8; 4],
}

impl CaptiveDns {
    fn bind(ip: Ipv4Addr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DNS_PORT))
            .context("failed to bind captive DNS socket")?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            ip: ip.octets(),
        })
    }

    /// Drain pending queries; called once per portal loop iteration.
    fn service(&self) {
        let mut buf = [0_u8; 512];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    if let Some(response) = dns::answer_query(&buf[..len], self.ip) {
                        let _ = self.socket.send_to(&response, peer);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("captive DNS receive failed: {err}");
                    break;
                }
            }
        }
    }
}

/* ---------- mqtt session ---------- */

fn ensure_mqtt_session(state: &SharedState) {
    if !is_wifi_station_connected() {
        return;
    }
    if !state.mqtt_cfg.lock().unwrap().ready() {
        return;
    }
    if state.session.lock().unwrap().is_some() {
        return;
    }

    match create_mqtt_client(state) {
        Ok((client, connection)) => {
            *state.session.lock().unwrap() = Some(MqttSession { client });
            spawn_mqtt_receiver(state.clone(), connection);
            info!("mqtt session started");
        }
        Err(err) => {
            // Retried on the next control-loop tick.
            warn!("mqtt connect failed: {err:#}");
        }
    }
}

fn create_mqtt_client(
    state: &SharedState,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let cfg = state.mqtt_cfg.lock().unwrap().clone();
    let url = format!("mqtt://{}:{}", cfg.host, cfg.port);
    let client_id = state.identity.mqtt_client_id();

    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: if cfg.user.is_empty() {
            None
        } else {
            Some(cfg.user.as_str())
        },
        password: if cfg.pass.is_empty() {
            None
        } else {
            Some(cfg.pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(state: SharedState, mut connection: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = connection.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        if let Err(err) = announce_session(&state) {
                            warn!("mqtt announce failed: {err:#}");
                        }
                    }
                    EventPayload::Disconnected => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // We only process full MQTT payloads.
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
                        if let Ok(message) = core::str::from_utf8(data) {
                            handle_mqtt_message(&state, topic, message);
                        }
                    }
                    _ => {}
                }
            }

            // Connection stream ended: the session was dropped.
            state.mqtt_connected.store(false, Ordering::Relaxed);
        })
        .expect("failed to spawn mqtt receiver thread");
}

/// On broker accept: subscribe for commands and publish retained snapshots
/// of the relay and the debounced input.
fn announce_session(state: &SharedState) -> anyhow::Result<()> {
    let topics = state.topics.lock().unwrap().clone();
    let relay_on = state.relay.lock().unwrap().arbiter.commanded();
    let input_open = state.input.lock().unwrap().is_open();

    let mut session = state.session.lock().unwrap();
    let Some(session) = session.as_mut() else {
        return Ok(());
    };

    session.client.subscribe(&topics.cmd, QoS::AtMostOnce)?;
    session.client.publish(
        &topics.state,
        QoS::AtLeastOnce,
        true,
        relay_payload(relay_on).as_bytes(),
    )?;
    session.client.publish(
        &topics.din,
        QoS::AtLeastOnce,
        true,
        input_payload(input_open).as_bytes(),
    )?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    let cmd_topic = state.topics.lock().unwrap().cmd.clone();
    if topic != cmd_topic {
        return;
    }

    if let Some(desired) = parse_command(message) {
        request_relay(state, desired, RelaySource::RemoteApi);
    }
}

fn drop_mqtt_session(state: &SharedState) {
    if state.session.lock().unwrap().take().is_some() {
        state.mqtt_connected.store(false, Ordering::Relaxed);
        info!("mqtt session dropped; next tick reconnects with fresh settings");
    }
}

fn publish_relay_state(state: &SharedState, on: bool) {
    let topic = state.topics.lock().unwrap().state.clone();
    publish_retained(state, &topic, relay_payload(on));
}

fn publish_input_state(state: &SharedState, open: bool) {
    let topic = state.topics.lock().unwrap().din.clone();
    publish_retained(state, &topic, input_payload(open));
}

fn publish_retained(state: &SharedState, topic: &str, payload: &str) {
    if !state.mqtt_connected.load(Ordering::Relaxed) {
        return;
    }

    let mut session = state.session.lock().unwrap();
    let Some(session) = session.as_mut() else {
        return;
    };

    if let Err(err) = session
        .client
        .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())
    {
        warn!("publish to {topic} failed: {err:?}");
    }
}

/* ---------- http ---------- */

fn create_http_server(state: SharedState, nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/settings", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(SETTINGS_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/app.js", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/javascript")])?
            .write_all(APP_JS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/css")])?
            .write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/relay", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Some(value) = form_param(&body, "state") else {
                return write_error(req, 400, "missing_state");
            };

            // The dry contact stays master; a conflicting request is
            // corrected on the next control-loop tick.
            request_relay(&state, parse_relay_form(&value), RelaySource::RemoteApi);

            write_json(req, &serde_json::json!({ "ok": true }))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/mqtt", Method::Get, move |req| {
            let view = MqttConfigView::from_config(&state.mqtt_cfg.lock().unwrap());
            write_json(req, &view)
        })?;
    }

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/mqtt", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;

            let updated = {
                let mut cfg = state.mqtt_cfg.lock().unwrap();
                cfg.enabled = form_param(&body, "enabled")
                    .map(|v| parse_relay_form(&v))
                    .unwrap_or(false);
                cfg.host = form_param(&body, "host").unwrap_or_default();
                cfg.port = parse_port(&form_param(&body, "port").unwrap_or_default());
                cfg.user = form_param(&body, "user").unwrap_or_default();
                if let Some(pass) = form_param(&body, "pass") {
                    // Stored password only changes when a new one is supplied.
                    if !pass.is_empty() {
                        cfg.pass = pass;
                    }
                }
                cfg.cmd_topic = form_param(&body, "cmdTopic").unwrap_or_default();
                cfg.state_topic = form_param(&body, "stateTopic").unwrap_or_default();
                cfg.clone()
            };

            nvs_store.save_mqtt_config(&updated)?;
            *state.topics.lock().unwrap() = MqttTopics::derive(&updated);
            drop_mqtt_session(&state);

            write_json(req, &serde_json::json!({ "ok": true }))
        })?;
    }

    Ok(server)
}

fn create_ap_http_server(nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in CAPTIVE_PROBE_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
                .write_all(AP_PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/wifi", Method::Post, move |mut req| {
        let body = read_request_body(&mut req)?;

        let ssid = form_param(&body, "ssid").unwrap_or_default();
        if ssid.is_empty() {
            return write_error(req, 400, "ssid_required");
        }
        let pass = form_param(&body, "pass").unwrap_or_default();

        nvs_store.save_wifi_config(&WifiConfig { ssid, pass })?;
        info!("wifi credentials saved; restarting into station mode");

        restart_after(PROVISION_RESTART_DELAY_MS);
        write_json(req, &serde_json::json!({ "ok": true, "reboot": true }))
    })?;

    // Everything else a captive client probes for also lands on the portal.
    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
            .write_all(AP_PORTAL_HTML.as_bytes())?;
        Ok(())
    })?;

    Ok(server)
}

fn build_status(state: &SharedState) -> StatusPayload {
    let cfg = state.mqtt_cfg.lock().unwrap();

    StatusPayload {
        ok: true,
        ip: state.ip.lock().unwrap().clone(),
        mdns: state.identity.mdns_fqdn.clone(),
        relay: state.relay.lock().unwrap().arbiter.commanded(),
        input_pressed: state.input.lock().unwrap().is_closed(),
        mqtt_enabled: cfg.enabled,
        mqtt_connected: state.mqtt_connected.load(Ordering::Relaxed),
        cmd_topic: cfg.cmd_topic.clone(),
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<String> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn form_param(body: &str, key: &str) -> Option<String> {
    for pair in body.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(url_decode(value));
        }
    }

    None
}

fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let decoded = core::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn write_json<T: Serialize>(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    mut req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    code: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "ok": false, "err": code });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/* ---------- persistence ---------- */

impl NvsStore {
    fn load_wifi_config(&self) -> anyhow::Result<WifiConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];

        match nvs.get_str(NVS_WIFI_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<WifiConfig>(value)?),
            None => Ok(WifiConfig::default()),
        }
    }

    fn save_wifi_config(&self, cfg: &WifiConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(cfg)?;
        nvs.set_str(NVS_WIFI_KEY, &payload)?;
        Ok(())
    }

    fn load_mqtt_config(&self) -> anyhow::Result<MqttConfig> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_SIZE];

        match nvs.get_str(NVS_MQTT_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<MqttConfig>(value)?),
            None => Ok(MqttConfig::default()),
        }
    }

    fn save_mqtt_config(&self, cfg: &MqttConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(cfg)?;
        nvs.set_str(NVS_MQTT_KEY, &payload)?;
        Ok(())
    }
}

/* ---------- platform helpers ---------- */

fn restart_after(delay_ms: u64) {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
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
