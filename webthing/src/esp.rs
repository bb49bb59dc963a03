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
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Gpio5, Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Deserialize;

use relay_common::{
    html_escape, parse_form, run_boot, BootOutcome, ConfigStore, DoubleResetDetector, NetworkJoin,
    PortalEvent, PortalField, PortalUi, ResetMarker, Storage, WebThingConfig, PORTAL_TIMEOUT_MS,
};

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

const MARKER_MAGIC: u32 = 0x524c_5931;

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
  <p class="muted">Join the device to your network and name it.</p>
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

fn write_json<T: serde::Serialize>(
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
        let outcome: BootOutcome<WebThingConfig> = run_boot(
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
    serve_thing(config, relay)
}

#[derive(Debug, Deserialize)]
struct OnProperty {
    on: bool,
}

fn thing_description(config: &WebThingConfig) -> serde_json::Value {
    serde_json::json!({
        "id": config.thing_id,
        "title": config.thing_name,
        "@context": "https://webthings.io/schemas",
        "@type": ["OnOffSwitch", "Relay"],
        "properties": {
            "on": {
                "@type": "OnOffProperty",
                "title": "On/Off",
                "type": "boolean",
                "links": [
                    { "href": format!("/things/{}/properties/on", config.thing_id) }
                ],
            }
        }
    })
}

fn serve_thing(
    config: WebThingConfig,
    relay: PinDriver<'static, Gpio5, Output>,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let relay = Arc::new(Mutex::new(relay));
    let relay_on = Arc::new(AtomicBool::new(false));

    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    let thing_path = format!("/things/{}", config.thing_id);
    let on_path = format!("{thing_path}/properties/on");

    {
        let config = config.clone();
        server.fn_handler(&thing_path, Method::Get, move |req| {
            write_json(req, &thing_description(&config))
        })?;
    }

    {
        let relay_on = relay_on.clone();
        server.fn_handler(&on_path, Method::Get, move |req| {
            let on = relay_on.load(Ordering::Relaxed);
            write_json(req, &serde_json::json!({ "on": on }))
        })?;
    }

    {
        let config = config.clone();
        let relay = relay.clone();
        let relay_on = relay_on.clone();
        server.fn_handler::<anyhow::Error, _>(&on_path, Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: OnProperty =
                serde_json::from_slice(&body).context("invalid property payload")?;

            {
                let mut pin = relay.lock().unwrap();
                if update.on {
                    pin.set_high()?;
                } else {
                    pin.set_low()?;
                }
            }

            let previous = relay_on.swap(update.on, Ordering::Relaxed);
            if previous != update.on {
                info!("{}: {}", config.thing_id, update.on);
            }

            write_json(req, &serde_json::json!({ "on": update.on }))
        })?;
    }

    info!("thing `{}` ready at {thing_path}", config.thing_id);

    // Keep services alive for the program lifetime.
    let _server = server;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
