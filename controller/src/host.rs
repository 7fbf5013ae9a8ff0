use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{debug, error, info, warn};

use smartlock_common::{
    status_channel, DeviceConfig, DeviceKeys, DeviceSession, LoopEvent, LoopSnapshot, LoopState,
    ReconciliationLoop, RuntimeConfig, TickOutcome,
};

use crate::{
    http::{HttpCommandSource, HttpStatusReporter},
    sim::{self, Discovered, SimOptions, SimulatedLock},
};

const DEFAULT_DIAG_PORT: u16 = 8080;

#[derive(Clone)]
struct AppState {
    diagnostics: Arc<Mutex<Diagnostics>>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct Diagnostics {
    identifier: String,
    model: &'static str,
    #[serde(rename = "sessionState")]
    session_state: &'static str,
    #[serde(rename = "startedEpoch")]
    started_epoch: i64,
    #[serde(rename = "lastTickEpoch")]
    last_tick_epoch: Option<i64>,
    #[serde(rename = "loop")]
    snapshot: Option<LoopSnapshot>,
}

#[derive(Debug, Serialize)]
struct HealthView {
    ok: bool,
    state: &'static str,
    #[serde(rename = "consecutiveFailures")]
    consecutive_failures: u32,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime configuration is incomplete")?;

    let keys = resolve_keys(&runtime.device)?;
    info!("device key fingerprint {}", keys.fingerprint());
    let sim_options = SimOptions::from_env();
    let discovered = sim::select_device(
        &sim::advertisements(&sim_options, &runtime.device.identifier),
        &runtime.device.identifier,
    )
    .context("device discovery failed")?;

    let app_state = AppState {
        diagnostics: Arc::new(Mutex::new(Diagnostics {
            identifier: runtime.device.identifier.clone(),
            model: discovered.model.display_name(),
            session_state: "IDLE",
            started_epoch: Utc::now().timestamp(),
            last_tick_epoch: None,
            snapshot: None,
        })),
    };

    spawn_control_loop(
        runtime,
        keys,
        discovered,
        sim_options,
        app_state.diagnostics.clone(),
    )?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/health", get(handle_get_health))
        .with_state(app_state);

    let port = std::env::var("LOCK_DIAG_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_DIAG_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind diagnostics server at {addr}"))?;

    info!("diagnostics listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("LOCK_API_HOST") {
        runtime.api.host = host;
    }
    if let Some(port) = lookup("LOCK_API_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.api.port = port;
    }
    if let Some(path) = lookup("LOCK_API_PATH") {
        runtime.api.command_path = path;
    }
    if let Some(path) = lookup("LOCK_REPORT_PATH") {
        runtime.api.report_path = Some(path);
    }
    if let Some(key) = lookup("LOCK_API_KEY") {
        runtime.api.api_key = key;
    }
    if let Some(identifier) = lookup("LOCK_DEVICE_ID") {
        runtime.device.identifier = identifier;
    }
    if let Some(key) = lookup("LOCK_PUBLIC_KEY") {
        runtime.device.public_key_hex = key;
    }
    if let Some(key) = lookup("LOCK_SECRET_KEY") {
        runtime.device.secret_key_hex = key;
    }
}

/// The simulated lock accepts its own demo keys when none are provisioned.
fn resolve_keys(device: &DeviceConfig) -> anyhow::Result<DeviceKeys> {
    if device.public_key_hex.is_empty() && device.secret_key_hex.is_empty() {
        warn!("no device keys configured; using simulator demo keys");
        return Ok(sim::demo_keys());
    }
    device
        .decode_keys()
        .context("device key material is invalid")
}

fn spawn_control_loop(
    runtime: RuntimeConfig,
    keys: DeviceKeys,
    discovered: Discovered,
    sim_options: SimOptions,
    diagnostics: Arc<Mutex<Diagnostics>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("lock-loop".to_string())
        .spawn(move || {
            // Blocking HTTP clients must not be created on the async runtime.
            let sources = HttpCommandSource::new(&runtime.api)
                .and_then(|source| Ok((source, HttpStatusReporter::new(&runtime.api)?)));
            let (mut source, mut reporter) = match sources {
                Ok(pair) => pair,
                Err(err) => {
                    error!("control loop cannot start: {err:#}");
                    return;
                }
            };

            let (notifier, inbox) = status_channel();
            let mut session = SimulatedLock::new(discovered.kind, &keys, notifier, &sim_options);
            let mut engine =
                ReconciliationLoop::new(runtime.control.clone(), discovered.kind, inbox);

            info!(
                "control loop started: polling {} every {} ms",
                runtime.api.command_url(),
                runtime.control.poll_interval_ms
            );

            loop {
                let outcome = engine.tick(monotonic_ms(), &mut source, &mut session, &mut reporter);
                log_outcome(&outcome);

                {
                    let mut diag = diagnostics.blocking_lock();
                    diag.session_state = session.state().as_str();
                    diag.last_tick_epoch = Some(Utc::now().timestamp());
                    diag.snapshot = Some(engine.snapshot());
                }

                thread::sleep(Duration::from_millis(outcome.delay_ms));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn log_outcome(outcome: &TickOutcome) {
    for event in &outcome.events {
        match event {
            LoopEvent::Fetched(command) if !command.needs_session() => {
                debug!("{event}");
            }
            event if event.is_failure() => warn!("{event}"),
            event => info!("{event}"),
        }
    }

    if outcome.transitioned() {
        info!(
            "loop {} -> {}",
            outcome.previous.as_str(),
            outcome.state.as_str()
        );
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let diagnostics = state.diagnostics.lock().await.clone();
    Json(diagnostics)
}

async fn handle_get_health(State(state): State<AppState>) -> impl IntoResponse {
    let diagnostics = state.diagnostics.lock().await;
    let Some(snapshot) = diagnostics.snapshot.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop not started");
    };

    let loop_state = parse_loop_state(snapshot.state);
    let ok = loop_state.is_some_and(is_healthy);
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthView {
            ok,
            state: snapshot.state,
            consecutive_failures: snapshot.consecutive_failures,
        }),
    )
        .into_response()
}

fn parse_loop_state(name: &str) -> Option<LoopState> {
    [
        LoopState::Idle,
        LoopState::Connecting,
        LoopState::AwaitingSession,
        LoopState::Reconciling,
        LoopState::Draining,
        LoopState::Failed,
        LoopState::Terminated,
    ]
    .into_iter()
    .find(|state| state.as_str() == name)
}

fn is_healthy(state: LoopState) -> bool {
    !matches!(state, LoopState::Failed | LoopState::Terminated)
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("SMARTLOCK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.smartlock"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
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

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn env_overrides_replace_stored_values() {
        let mut runtime = RuntimeConfig::default();
        runtime.api.host = "stored.example".to_string();
        runtime.device.identifier = "stored-id".to_string();

        let vars: HashMap<&str, &str> = [
            ("LOCK_API_HOST", "api.example"),
            ("LOCK_API_PORT", "8443"),
            ("LOCK_REPORT_PATH", "/report"),
            ("LOCK_DEVICE_ID", "AA:BB:CC:DD:EE:FF"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut runtime, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(runtime.api.host, "api.example");
        assert_eq!(runtime.api.port, 8443);
        assert_eq!(runtime.api.command_path, "/get-status");
        assert_eq!(runtime.api.report_path.as_deref(), Some("/report"));
        assert_eq!(runtime.device.identifier, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn unparsable_port_keeps_stored_value() {
        let mut runtime = RuntimeConfig::default();
        apply_env_overrides(&mut runtime, |key| {
            (key == "LOCK_API_PORT").then(|| "https".to_string())
        });
        assert_eq!(runtime.api.port, 443);
    }

    #[test]
    fn blank_keys_fall_back_to_demo_keys() {
        let keys = resolve_keys(&DeviceConfig::default()).unwrap();
        assert_eq!(keys, sim::demo_keys());

        let partial = DeviceConfig {
            secret_key_hex: "00".repeat(16),
            ..DeviceConfig::default()
        };
        assert!(resolve_keys(&partial).is_err());
    }

    #[test]
    fn health_tracks_terminal_states() {
        assert!(is_healthy(LoopState::Idle));
        assert!(is_healthy(LoopState::Draining));
        assert!(!is_healthy(LoopState::Failed));
        assert!(!is_healthy(LoopState::Terminated));
        assert_eq!(
            parse_loop_state("AWAITING_SESSION"),
            Some(LoopState::AwaitingSession)
        );
        assert_eq!(parse_loop_state("bogus"), None);
    }
}
