use std::{
    cell::RefCell,
    ffi::CString,
    fmt::Write as _,
    io,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Gpio5, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Deserialize;

use relay_common::{
    html_escape, parse_form, run_boot, BootOutcome, ConfigStore, DoubleResetDetector, NetworkJoin,
    PortalEvent, PortalField, PortalUi, ResetMarker, Storage, ThingsBoardConfig, PORTAL_TIMEOUT_MS,
};

const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";
const TOPIC_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
const TOPIC_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

const DEFAULT_MQTT_PORT: u16 = 1883;
const TELEMETRY_INTERVAL_SECS: u64 = 30;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

const SPIFFS_BASE_PATH: &str = "/spiffs";
const CONFIG_PATH: &str = "/spiffs/config.json";

const NVS_CREDS_NAMESPACE: &str = "relay";
const NVS_WIFI_SSID_KEY: &str = "sta_ssid";
const NVS_WIFI_PASS_KEY: &str = "sta_pass";

const WIFI_SSID_FIELD: &str = "wifi_ssid";
const WIFI_PASS_FIELD: &str = "wifi_pass";
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const MAX_HTTP_BODY: usize = 2048;

// Connectivity-check URLs that phones probe after joining the AP; all
// of them get the setup form so the captive portal pops automatically.
const CAPTIVE_PROBE_PATHS: &[&str] = &[
    "/",
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

const MARKER_MAGIC: u32 = 0x524c_5932;

// RTC slow memory survives soft resets but not power loss, which is
// exactly the lifetime the double-reset marker needs.
#[link_section = ".rtc.noinit"]
static mut MARKER_MAGIC_SLOT: u32 = 0;
#[link_section = ".rtc.noinit"]
static mut MARKER_STAMP_SLOT: u64 = 0;

struct RtcResetMarker;

impl ResetMarker for RtcResetMarker {
    fn read(&mut self) -> Option<u64> {
        unsafe {
            let magic = core::ptr::read_volatile(core::ptr::addr_of!(MARKER_MAGIC_SLOT));
            (magic == MARKER_MAGIC)
                .then(|| core::ptr::read_volatile(core::ptr::addr_of!(MARKER_STAMP_SLOT)))
        }
    }

    fn write(&mut self, stamp_ms: u64) {
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!(MARKER_STAMP_SLOT), stamp_ms);
            core::ptr::write_volatile(core::ptr::addr_of_mut!(MARKER_MAGIC_SLOT), MARKER_MAGIC);
        }
    }

    fn clear(&mut self) {
        unsafe {
            core::ptr::write_volatile(core::ptr::addr_of_mut!(MARKER_MAGIC_SLOT), 0);
        }
    }
}

struct SpiffsStorage;

impl Storage for SpiffsStorage {
    fn mount(&mut self) -> bool {
        let Ok(base_path) = CString::new(SPIFFS_BASE_PATH) else {
            return false;
        };
        let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
            base_path: base_path.as_ptr(),
            partition_label: core::ptr::null(),
            max_files: 4,
            format_if_mount_failed: true,
        };
        let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
        rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE
    }

    fn read(&mut self) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(CONFIG_PATH) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        // Write-then-rename so an interrupted write leaves the previous
        // record intact instead of a half-written one.
        let staging = format!("{CONFIG_PATH}.tmp");
        std::fs::write(&staging, bytes)?;
        std::fs::rename(&staging, CONFIG_PATH)
    }

    fn erase(&mut self) -> io::Result<()> {
        match std::fs::remove_file(CONFIG_PATH) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

struct RelayWifi {
    wifi: BlockingWifi<EspWifi<'static>>,
    creds: EspNvs<NvsDefault>,
}

impl RelayWifi {
    fn stored_credentials(&mut self) -> Option<(String, String)> {
        let mut buffer = vec![0_u8; 128];
        let ssid = self
            .creds
            .get_str(NVS_WIFI_SSID_KEY, &mut buffer)
            .ok()??
            .to_string();
        if ssid.is_empty() {
            return None;
        }

        let mut buffer = vec![0_u8; 128];
        let pass = self
            .creds
            .get_str(NVS_WIFI_PASS_KEY, &mut buffer)
            .ok()
            .flatten()
            .unwrap_or_default()
            .to_string();
        Some((ssid, pass))
    }

    fn store_credentials(&mut self, ssid: &str, pass: &str) {
        if let Err(err) = self.creds.set_str(NVS_WIFI_SSID_KEY, ssid) {
            warn!("failed to store wifi ssid: {err:?}");
        }
        if let Err(err) = self.creds.set_str(NVS_WIFI_PASS_KEY, pass) {
            warn!("failed to store wifi password: {err:?}");
        }
    }

    fn join_station(&mut self) -> anyhow::Result<()> {
        let (ssid, pass) = self
            .stored_credentials()
            .ok_or_else(|| anyhow!("no stored wifi credentials"))?;

        let auth_method = if pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi ssid too long"))?,
                password: pass
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        info!("wifi started, connecting to `{ssid}`");

        let mut last_err = None;
        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            match self
                .wifi
                .connect()
                .and_then(|()| self.wifi.wait_netif_up())
            {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    return Ok(());
                }
                Err(err) => {
                    warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                    last_err = Some(err);
                }
            }

            if attempt < WIFI_CONNECT_ATTEMPTS {
                let _ = self.wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }

        let _ = self.wifi.stop();
        Err(last_err
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("wifi connect failed")))
    }

    fn start_ap(&mut self, ssid: &str) -> anyhow::Result<()> {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();

        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| anyhow!("provisioning AP ssid too long"))?,
                auth_method: AuthMethod::None,
                channel: 1,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        self.wifi.wait_netif_up()?;
        info!("provisioning AP started on `{ssid}`");
        Ok(())
    }

    fn stop_ap(&mut self) {
        let _ = self.wifi.stop();
    }
}

struct StationJoin(Rc<RefCell<RelayWifi>>);

impl NetworkJoin for StationJoin {
    fn join(&mut self) -> bool {
        match self.0.borrow_mut().join_station() {
            Ok(()) => true,
            Err(err) => {
                warn!("station join failed: {err:#}");
                false
            }
        }
    }
}

enum Submission {
    Saved(Vec<(String, String)>),
    Reset,
}

/// Open provisioning AP named after the device, serving a captive
/// setup form. Blocks the boot sequence until submit, reset, or the
/// portal window elapses.
struct ApPortal {
    wifi: Rc<RefCell<RelayWifi>>,
    device_id: String,
}

impl PortalUi for ApPortal {
    fn capture(&mut self, fields: &[PortalField], timeout_ms: u64) -> PortalEvent {
        match self.capture_inner(fields, timeout_ms) {
            Ok(event) => event,
            Err(err) => {
                warn!("provisioning portal failed: {err:#}");
                PortalEvent::TimedOut
            }
        }
    }
}

impl ApPortal {
    fn capture_inner(
        &mut self,
        fields: &[PortalField],
        timeout_ms: u64,
    ) -> anyhow::Result<PortalEvent> {
        self.wifi.borrow_mut().start_ap(&self.device_id)?;

        let slot: Arc<(Mutex<Option<Submission>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let page = render_setup_page(&self.device_id, fields);

        let conf = HttpConfiguration {
            stack_size: 10 * 1024,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        for path in CAPTIVE_PROBE_PATHS {
            let page = page.clone();
            server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "text/html; charset=utf-8")],
                )?
                .write_all(page.as_bytes())?;
                Ok(())
            })?;
        }

        {
            let slot = slot.clone();
            server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
                let body = read_request_body(&mut req)?;
                let pairs = parse_form(&body);
                {
                    let (lock, signal) = &*slot;
                    *lock.lock().unwrap() = Some(Submission::Saved(pairs));
                    signal.notify_all();
                }
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "text/html; charset=utf-8")],
                )?
                .write_all(b"<p>Saved. The device will now reconnect.</p>")?;
                Ok(())
            })?;
        }

        {
            let slot = slot.clone();
            server.fn_handler::<anyhow::Error, _>("/reset", Method::Post, move |req| {
                {
                    let (lock, signal) = &*slot;
                    *lock.lock().unwrap() = Some(Submission::Reset);
                    signal.notify_all();
                }
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "text/html; charset=utf-8")],
                )?
                .write_all(b"<p>Settings cleared. The device will restart.</p>")?;
                Ok(())
            })?;
        }

        let event = {
            let (lock, signal) = &*slot;
            let guard = lock.lock().unwrap();
            let (mut guard, _timeout) = signal
                .wait_timeout_while(guard, Duration::from_millis(timeout_ms), |slot| {
                    slot.is_none()
                })
                .unwrap();

            match guard.take() {
                Some(Submission::Saved(pairs)) => {
                    let mut wifi_ssid = String::new();
                    let mut wifi_pass = String::new();
                    let mut values = Vec::new();
                    for (key, value) in pairs {
                        match key.as_str() {
                            WIFI_SSID_FIELD => wifi_ssid = value,
                            WIFI_PASS_FIELD => wifi_pass = value,
                            _ if fields.iter().any(|field| field.key == key) => {
                                values.push((key, value));
                            }
                            _ => {}
                        }
                    }
                    if !wifi_ssid.is_empty() {
                        self.wifi
                            .borrow_mut()
                            .store_credentials(&wifi_ssid, &wifi_pass);
                    }
                    PortalEvent::Submitted(values)
                }
                Some(Submission::Reset) => PortalEvent::ResetRequested,
                None => PortalEvent::TimedOut,
            }
        };

        drop(server);
        self.wifi.borrow_mut().stop_ap();
        Ok(event)
    }
}

fn render_setup_page(device_id: &str, fields: &[PortalField]) -> String {
    let mut inputs = String::new();
    for field in fields {
        let _ = write!(
            &mut inputs,
            r#"<label>{label}</label><input name="{key}" type="text" maxlength="{max_len}" value="{value}">"#,
            label = field.label,
            key = field.key,
            max_len = field.max_len,
            value = html_escape(&field.value),
        );
    }

    format!(
        r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{device_id} Setup</title>
  <style>
    body{{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}}
    h1{{margin:0 0 .5rem}}.muted{{color:#555}}
    label{{display:block;margin:.5rem 0 .2rem}}
    input[type=text],input[type=password]{{width:100%;padding:.5rem;box-sizing:border-box}}
    button{{padding:.55rem .9rem;margin-top:.8rem}}
  </style>
</head>
<body>
  <h1>{device_id} Setup</h1>
  <p class="muted">Join the device to your network and link your ThingsBoard account.</p>
  <form method="post" action="/save">
    <label>WiFi SSID</label><input name="{ssid_field}" type="text">
    <label>WiFi Password</label><input name="{pass_field}" type="password">
    {inputs}
    <button type="submit">Save</button>
  </form>
  <form method="post" action="/reset">
    <button type="submit">Reset Settings</button>
  </form>
</body>
</html>
"#,
        ssid_field = WIFI_SSID_FIELD,
        pass_field = WIFI_PASS_FIELD,
    )
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
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

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn device_identity() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
    if rc == esp_idf_svc::sys::ESP_OK {
        format!("Relay-{:02x}{:02x}{:02x}", mac[3], mac[4], mac[5])
    } else {
        "Relay-0000".to_string()
    }
}

fn restart_after(delay_ms: u64) {
    if delay_ms > 0 {
        thread::sleep(Duration::from_millis(delay_ms));
    }
    info!("restarting");
    unsafe { esp_idf_svc::sys::esp_restart() };
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;

    let device_id = device_identity();
    info!("device identity `{device_id}`");

    let esp_wifi = EspWifi::new(
        peripherals.modem,
        sys_loop.clone(),
        Some(nvs_partition.clone()),
    )?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    let creds = EspNvs::new(nvs_partition, NVS_CREDS_NAMESPACE, true)?;
    let shared_wifi = Rc::new(RefCell::new(RelayWifi { wifi, creds }));

    let mut store = ConfigStore::new(SpiffsStorage);
    let mut detector = DoubleResetDetector::new(RtcResetMarker);
    let mut network = StationJoin(shared_wifi.clone());
    let mut portal = ApPortal {
        wifi: shared_wifi,
        device_id: device_id.clone(),
    };

    let config = loop {
        let outcome: BootOutcome<ThingsBoardConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut portal,
            &device_id,
            wall_clock_ms(),
            PORTAL_TIMEOUT_MS,
        );

        match outcome {
            BootOutcome::Ready(config) => break config,
            BootOutcome::Restart { delay_ms } => restart_after(delay_ms),
        }
    };

    let relay = PinDriver::output(peripherals.pins.gpio5)?;
    run_device(config, relay)
}

#[derive(Clone)]
struct DeviceState {
    relay: Arc<Mutex<PinDriver<'static, Gpio5, Output>>>,
    relay_on: Arc<AtomicBool>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// Splits `host[:port]`, falling back to the ThingsBoard MQTT default.
fn split_server(server: &str) -> (String, u16) {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (server.to_string(), DEFAULT_MQTT_PORT),
        },
        _ => (server.to_string(), DEFAULT_MQTT_PORT),
    }
}

fn run_device(
    config: ThingsBoardConfig,
    relay: PinDriver<'static, Gpio5, Output>,
) -> anyhow::Result<()> {
    let (host, port) = split_server(&config.server);
    let url = format!("mqtt://{host}:{port}");

    // ThingsBoard authenticates devices with the access token as the
    // MQTT username.
    let conf = MqttClientConfiguration {
        client_id: Some("relay-thingsboard"),
        username: if config.token.is_empty() {
            None
        } else {
            Some(config.token.as_str())
        },
        ..Default::default()
    };

    let (mqtt, conn) = EspMqttClient::new(&url, &conf)?;
    let state = DeviceState {
        relay: Arc::new(Mutex::new(relay)),
        relay_on: Arc::new(AtomicBool::new(false)),
        mqtt: Arc::new(Mutex::new(mqtt)),
    };

    state
        .mqtt
        .lock()
        .unwrap()
        .subscribe(&format!("{TOPIC_RPC_REQUEST_PREFIX}+"), QoS::AtLeastOnce)
        .context("failed to subscribe to rpc requests")?;

    spawn_mqtt_receiver(state.clone(), conn);

    info!("reporting to `{}`", config.server);
    loop {
        if let Err(err) = publish_telemetry(&state) {
            warn!("telemetry publish failed: {err:#}");
        }
        thread::sleep(Duration::from_secs(TELEMETRY_INTERVAL_SECS));
    }
}

fn spawn_mqtt_receiver(state: DeviceState, mut conn: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8192)
        .spawn(move || {
            loop {
                match conn.next() {
                    Ok(event) => {
                        if let EventPayload::Received {
                            topic: Some(topic),
                            data,
                            details,
                            ..
                        } = event.payload()
                        {
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

                            if let Err(err) = handle_rpc(&state, topic, data) {
                                warn!("rpc handling failed: {err:#}");
                            }
                        }
                    }
                    Err(err) => {
                        warn!("mqtt receive loop error: {err:?}");
                        thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_rpc(state: &DeviceState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    let Some(request_id) = topic.strip_prefix(TOPIC_RPC_REQUEST_PREFIX) else {
        return Ok(());
    };

    let request: RpcRequest =
        serde_json::from_slice(payload).context("invalid rpc payload")?;

    match request.method.as_str() {
        "setValue" => {
            let on = request
                .params
                .as_bool()
                .context("setValue expects a boolean")?;

            {
                let mut pin = state.relay.lock().unwrap();
                if on {
                    pin.set_high()?;
                } else {
                    pin.set_low()?;
                }
            }

            let previous = state.relay_on.swap(on, Ordering::Relaxed);
            if previous != on {
                info!("relay: {on}");
                publish_telemetry(state)?;
            }
        }
        "getValue" => {}
        other => warn!("unsupported rpc method `{other}`"),
    }

    let current = state.relay_on.load(Ordering::Relaxed);
    let response = serde_json::to_vec(&current)?;
    state
        .mqtt
        .lock()
        .unwrap()
        .publish(
            &format!("{TOPIC_RPC_RESPONSE_PREFIX}{request_id}"),
            QoS::AtLeastOnce,
            false,
            &response,
        )
        .context("failed to publish rpc response")?;
    Ok(())
}

fn publish_telemetry(state: &DeviceState) -> anyhow::Result<()> {
    let on = state.relay_on.load(Ordering::Relaxed);
    let payload = serde_json::to_vec(&serde_json::json!({ "on": on }))?;
    state
        .mqtt
        .lock()
        .unwrap()
        .publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, &payload)
        .context("failed to publish telemetry")?;
    Ok(())
}
