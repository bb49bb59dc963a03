use std::{
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use relay_common::{
    run_boot, BootOutcome, ConfigStore, DoubleResetDetector, FileResetMarker, FsStorage,
    NetworkJoin, PortalEvent, PortalField, PortalUi, WebThingConfig, PORTAL_TIMEOUT_MS,
};

// The host simulator cannot power-cycle itself, so a boot sequence
// that keeps asking for restarts eventually becomes an error.
const MAX_BOOT_ATTEMPTS: u32 = 3;

#[derive(Clone)]
struct AppState {
    config: Arc<WebThingConfig>,
    relay_on: Arc<AtomicBool>,
}

#[derive(Debug, Deserialize)]
struct OnProperty {
    on: bool,
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

async fn boot_device(data_dir: &FsPath, device_id: &str) -> anyhow::Result<WebThingConfig> {
    let mut store = ConfigStore::new(FsStorage::new(data_dir.join("config.json")));
    let mut detector =
        DoubleResetDetector::new(FileResetMarker::new(data_dir.join("reset-marker")));
    let mut network = HostNetwork::from_env();
    let mut portal = EnvPortal;

    for attempt in 1..=MAX_BOOT_ATTEMPTS {
        let outcome: BootOutcome<WebThingConfig> = run_boot(
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

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("RELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.relay-webthing"));
    let device_id =
        std::env::var("RELAY_DEVICE_ID").unwrap_or_else(|_| "Relay-host".to_string());

    let config = boot_device(&data_dir, &device_id).await?;
    info!("boot complete, thing id `{}`", config.thing_id);

    let state = AppState {
        config: Arc::new(config),
        relay_on: Arc::new(AtomicBool::new(false)),
    };

    let app = Router::new()
        .route("/things/{id}", get(handle_get_thing))
        .route(
            "/things/{id}/properties/on",
            get(handle_get_on).put(handle_put_on),
        )
        .with_state(state.clone());

    let port = std::env::var("RELAY_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind thing server at {addr}"))?;

    info!(
        "thing available at http://{addr}/things/{}",
        state.config.thing_id
    );
    axum::serve(listener, app).await?;
    Ok(())
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

async fn handle_get_thing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if id != state.config.thing_id {
        return unknown_thing();
    }
    Json(thing_description(&state.config)).into_response()
}

async fn handle_get_on(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if id != state.config.thing_id {
        return unknown_thing();
    }
    let on = state.relay_on.load(Ordering::Relaxed);
    Json(serde_json::json!({ "on": on })).into_response()
}

async fn handle_put_on(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<OnProperty>,
) -> impl IntoResponse {
    if id != state.config.thing_id {
        return unknown_thing();
    }

    // Hardware integration point: drives the relay on GPIO 5 on the
    // ESP target; the host build only tracks and logs the state.
    let previous = state.relay_on.swap(update.on, Ordering::Relaxed);
    if previous != update.on {
        info!("{}: {}", state.config.thing_id, update.on);
    }

    Json(serde_json::json!({ "on": update.on })).into_response()
}

fn unknown_thing() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "unknown thing" })),
    )
        .into_response()
}
