use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use tracing::{info, warn};

use relay_common::{
    run_boot, BootOutcome, ConfigStore, DoubleResetDetector, FileResetMarker, FsStorage,
    NetworkJoin, PortalEvent, PortalField, PortalUi, ThingsBoardConfig, PORTAL_TIMEOUT_MS,
};

const TOPIC_TELEMETRY: &str = "v1/devices/me/telemetry";
const TOPIC_RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
const TOPIC_RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

const DEFAULT_MQTT_PORT: u16 = 1883;
const TELEMETRY_INTERVAL_SECS: u64 = 30;

// The host simulator cannot power-cycle itself, so a boot sequence
// that keeps asking for restarts eventually becomes an error.
const MAX_BOOT_ATTEMPTS: u32 = 3;

#[derive(Clone)]
struct AppState {
    relay_on: Arc<AtomicBool>,
    mqtt: AsyncClient,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// Simulated station join: fails the first `RELAY_JOIN_FAILURES`
/// attempts, then succeeds, which exercises the provisioning path.
struct HostNetwork {
    join_failures: u32,
    attempts: u32,
}

impl HostNetwork {
    fn from_env() -> Self {
        let join_failures = std::env::var("RELAY_JOIN_FAILURES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        Self {
            join_failures,
            attempts: 0,
        }
    }
}

impl NetworkJoin for HostNetwork {
    fn join(&mut self) -> bool {
        self.attempts += 1;
        self.attempts > self.join_failures
    }
}

/// Captive portal stand-in: field values come from
/// `RELAY_PORTAL_<KEY>` environment variables.
struct EnvPortal;

impl PortalUi for EnvPortal {
    fn capture(&mut self, fields: &[PortalField], _timeout_ms: u64) -> PortalEvent {
        if std::env::var("RELAY_PORTAL_RESET").is_ok_and(|value| value == "1") {
            return PortalEvent::ResetRequested;
        }

        let mut values = Vec::new();
        for field in fields {
            let var = format!("RELAY_PORTAL_{}", field.key.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                values.push((field.key.to_string(), value));
            }
        }

        if values.is_empty() {
            warn!("no RELAY_PORTAL_* values set, provisioning cannot complete");
            return PortalEvent::TimedOut;
        }
        PortalEvent::Submitted(values)
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

async fn boot_device(data_dir: &Path, device_id: &str) -> anyhow::Result<ThingsBoardConfig> {
    let mut store = ConfigStore::new(FsStorage::new(data_dir.join("config.json")));
    let mut detector =
        DoubleResetDetector::new(FileResetMarker::new(data_dir.join("reset-marker")));
    let mut network = HostNetwork::from_env();
    let mut portal = EnvPortal;

    for attempt in 1..=MAX_BOOT_ATTEMPTS {
        let outcome: BootOutcome<ThingsBoardConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut portal,
            device_id,
            wall_clock_ms(),
            PORTAL_TIMEOUT_MS,
        );

        match outcome {
            BootOutcome::Ready(config) => return Ok(config),
            BootOutcome::Restart { delay_ms } => {
                warn!("boot attempt {attempt}/{MAX_BOOT_ATTEMPTS} resolved to a restart");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }

    bail!("provisioning failed after {MAX_BOOT_ATTEMPTS} boot attempts")
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

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("RELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relay-thingsboard"));
    let device_id =
        std::env::var("RELAY_DEVICE_ID").unwrap_or_else(|_| "Relay-host".to_string());

    let config = boot_device(&data_dir, &device_id).await?;
    info!("boot complete, reporting to `{}`", config.server);

    let (mqtt_host, mqtt_port) = split_server(&config.server);
    let mut mqtt_options = MqttOptions::new(device_id, mqtt_host, mqtt_port);
    if !config.token.is_empty() {
        // ThingsBoard authenticates devices with the access token as
        // the MQTT username.
        mqtt_options.set_credentials(config.token.clone(), "");
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    mqtt.subscribe(format!("{TOPIC_RPC_REQUEST_PREFIX}+"), QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to rpc requests")?;

    let state = AppState {
        relay_on: Arc::new(AtomicBool::new(false)),
        mqtt,
    };

    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if let Err(err) =
                            handle_rpc(&state, &message.topic, &message.payload).await
                        {
                            warn!("rpc handling error: {err:#}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    let mut interval = tokio::time::interval(Duration::from_secs(TELEMETRY_INTERVAL_SECS));
    loop {
        interval.tick().await;
        if let Err(err) = publish_telemetry(&state).await {
            warn!("telemetry publish failed: {err:#}");
        }
    }
}

async fn handle_rpc(state: &AppState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
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

            // Hardware integration point: drives the relay on GPIO 5 on
            // the ESP target; the host build only tracks and logs it.
            let previous = state.relay_on.swap(on, Ordering::Relaxed);
            if previous != on {
                info!("relay: {on}");
                publish_telemetry(state).await?;
            }
        }
        "getValue" => {}
        other => warn!("unsupported rpc method `{other}`"),
    }

    let current = state.relay_on.load(Ordering::Relaxed);
    state
        .mqtt
        .publish(
            format!("{TOPIC_RPC_RESPONSE_PREFIX}{request_id}"),
            QoS::AtLeastOnce,
            false,
            serde_json::to_vec(&current)?,
        )
        .await
        .context("failed to publish rpc response")?;
    Ok(())
}

async fn publish_telemetry(state: &AppState) -> anyhow::Result<()> {
    let on = state.relay_on.load(Ordering::Relaxed);
    let payload = serde_json::to_vec(&serde_json::json!({ "on": on }))?;
    state
        .mqtt
        .publish(TOPIC_TELEMETRY, QoS::AtLeastOnce, false, payload)
        .await
        .context("failed to publish telemetry")?;
    Ok(())
}
