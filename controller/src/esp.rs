use core::convert::TryInto;
use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};

use smartlock_common::{
    directive::{
        encode_report_body, parse_directive_bytes, API_KEY_HEADER, MAX_DIRECTIVE_BYTES,
        REPORT_CONTENT_TYPE,
    },
    link::SessionLayer,
    status_channel, ApiConfig, CommandSource, DeviceKeys, LoopEvent, LoopState, NetworkConfig,
    ReconciliationLoop, RemoteCommand, RuntimeConfig, StatusReporter, TickOutcome,
};

use crate::ble::{self, Discovered, NimbleSession};

const NVS_NAMESPACE: &str = "smartlock";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const STATUS_LED_PIN: i32 = 48;
const LED_FAST_BLINK_MS: u64 = 200;
const LED_SLOW_BLINK_MS: u64 = 900;
// Upper bound on one sleep between watchdog feeds and LED updates.
const LOOP_SLICE_MS: u64 = 100;

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = match nvs_store.load_runtime_config() {
        Ok(Some(runtime)) => {
            info!("using runtime config stored in NVS");
            runtime
        }
        Ok(None) => compile_time_defaults(),
        Err(err) => {
            warn!("failed to load runtime config from NVS: {err:#}");
            compile_time_defaults()
        }
    };
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime configuration is incomplete")?;
    let keys = runtime
        .device
        .decode_keys()
        .context("device key material is invalid")?;
    let layer = session_layer(&keys)?;

    info!(
        "config loaded: ssid=`{}`, api=`{}`, device=`{}`, key=`{}`",
        runtime.network.wifi_ssid,
        runtime.api.command_url(),
        runtime.device.identifier,
        keys.fingerprint(),
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let discovered = ble::discover(&runtime.device.identifier, runtime.device.scan_duration_ms)
        .context("device discovery failed")?;
    let status_led = init_status_led(STATUS_LED_PIN);

    spawn_control_loop(runtime, discovered, layer, status_led)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// Plain frames are only understood by bench peers; real locks need the
/// vendor layer linked in here.
#[cfg(feature = "plain-link")]
fn session_layer(keys: &DeviceKeys) -> anyhow::Result<Box<dyn SessionLayer>> {
    warn!("using plain link framing; production locks will reject it");
    Ok(Box::new(smartlock_common::link::PlainLayer::new(keys)))
}

#[cfg(not(feature = "plain-link"))]
fn session_layer(_keys: &DeviceKeys) -> anyhow::Result<Box<dyn SessionLayer>> {
    bail!(
        "no vendor session layer is linked into this firmware; \
         enable `plain-link` only for bench peers"
    )
}

fn compile_time_defaults() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    runtime.api.host = option_env!("LOCK_API_HOST").unwrap_or_default().to_string();
    if let Some(port) = option_env!("LOCK_API_PORT").and_then(|value| value.parse().ok()) {
        runtime.api.port = port;
    }
    if let Some(path) = option_env!("LOCK_API_PATH") {
        runtime.api.command_path = path.to_string();
    }
    runtime.api.report_path = option_env!("LOCK_REPORT_PATH").map(str::to_string);
    runtime.api.api_key = option_env!("LOCK_API_KEY").unwrap_or_default().to_string();
    runtime.device.identifier = option_env!("LOCK_DEVICE_ID").unwrap_or_default().to_string();
    runtime.device.public_key_hex = option_env!("LOCK_PUBLIC_KEY")
        .unwrap_or_default()
        .to_string();
    runtime.device.secret_key_hex = option_env!("LOCK_SECRET_KEY")
        .unwrap_or_default()
        .to_string();
    runtime
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        bail!("wifi ssid is not configured");
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        bail!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
    }
    Ok(esp_wifi)
}

fn http_client(api: &ApiConfig) -> anyhow::Result<HttpClient<EspHttpConnection>> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_millis(api.timeout_ms)),
        crt_bundle_attach: if api.is_tls() {
            Some(esp_idf_svc::sys::esp_crt_bundle_attach)
        } else {
            None
        },
        ..Default::default()
    };
    Ok(HttpClient::wrap(EspHttpConnection::new(&http_conf)?))
}

fn request_headers<'a>(
    api_key: &'a str,
    extra: &[(&'a str, &'a str)],
) -> Vec<(&'a str, &'a str)> {
    let mut headers = vec![("Connection", "close")];
    headers.extend_from_slice(extra);
    if !api_key.is_empty() {
        headers.push((API_KEY_HEADER, api_key));
    }
    headers
}

struct EspCommandSource {
    api: ApiConfig,
    url: String,
}

impl EspCommandSource {
    fn new(api: &ApiConfig) -> Self {
        Self {
            api: api.clone(),
            url: api.command_url(),
        }
    }

    fn try_fetch(&self) -> anyhow::Result<RemoteCommand> {
        let mut client = http_client(&self.api)?;
        let headers = request_headers(&self.api.api_key, &[]);
        let request = client.request(Method::Get, &self.url, &headers)?;
        let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

        let status = response.status();
        if !(200..300).contains(&status) {
            bail!("unexpected HTTP status {status}");
        }

        let mut body = [0_u8; MAX_DIRECTIVE_BYTES];
        let mut len = 0;
        while len < body.len() {
            let read = response
                .read(&mut body[len..])
                .map_err(|e| anyhow!("{e:?}"))?;
            if read == 0 {
                break;
            }
            len += read;
        }
        Ok(parse_directive_bytes(&body[..len]))
    }
}

impl CommandSource for EspCommandSource {
    fn fetch(&mut self) -> RemoteCommand {
        self.try_fetch().unwrap_or_else(|err| {
            warn!("directive fetch from {} failed: {err:#}", self.url);
            RemoteCommand::FetchFailed
        })
    }
}

struct EspStatusReporter {
    api: ApiConfig,
    url: Option<String>,
}

impl EspStatusReporter {
    fn new(api: &ApiConfig) -> Self {
        Self {
            api: api.clone(),
            url: api.report_url(),
        }
    }

    fn try_report(&self, url: &str, status_line: &str) -> anyhow::Result<()> {
        let body = encode_report_body(status_line);
        let content_length = body.len().to_string();
        let headers = request_headers(
            &self.api.api_key,
            &[
                ("Content-Type", REPORT_CONTENT_TYPE),
                ("Content-Length", content_length.as_str()),
            ],
        );

        let mut client = http_client(&self.api)?;
        let mut request = client.request(Method::Post, url, &headers)?;
        request
            .write_all(body.as_bytes())
            .map_err(|e| anyhow!("{e:?}"))?;
        request.flush().map_err(|e| anyhow!("{e:?}"))?;
        let response = request.submit().map_err(|e| anyhow!("{e:?}"))?;
        debug!("status report answered with HTTP {}", response.status());
        Ok(())
    }
}

impl StatusReporter for EspStatusReporter {
    fn report(&mut self, status_line: &str) {
        let Some(url) = self.url.as_deref() else {
            return;
        };
        if let Err(err) = self.try_report(url, status_line) {
            warn!("status report to {url} failed: {err:#}");
        }
    }
}

fn spawn_control_loop(
    runtime: RuntimeConfig,
    discovered: Discovered,
    layer: Box<dyn SessionLayer>,
    mut status_led: Option<StatusLed>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("lock-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let (notifier, inbox) = status_channel();
            let mut session = NimbleSession::new(&discovered, layer, notifier);
            let mut source = EspCommandSource::new(&runtime.api);
            let mut reporter = EspStatusReporter::new(&runtime.api);
            let mut engine =
                ReconciliationLoop::new(runtime.control.clone(), discovered.kind, inbox);
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            info!(
                "control loop started for {} ({})",
                discovered.address,
                discovered.model.display_name()
            );

            loop {
                feed_watchdog();
                let outcome = engine.tick(monotonic_ms(), &mut source, &mut session, &mut reporter);
                log_outcome(&outcome);

                let deadline_ms = monotonic_ms().saturating_add(outcome.delay_ms);
                loop {
                    feed_watchdog();
                    let now_ms = monotonic_ms();
                    let wifi_connected = is_wifi_station_connected();
                    supervise_wifi(&mut wifi_disconnected_since_ms, wifi_connected, now_ms);
                    update_status_led(&mut status_led, engine.state(), wifi_connected, now_ms);

                    if now_ms >= deadline_ms {
                        break;
                    }
                    let remaining = deadline_ms - now_ms;
                    thread::sleep(Duration::from_millis(remaining.min(LOOP_SLICE_MS)));
                }
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn log_outcome(outcome: &TickOutcome) {
    for event in &outcome.events {
        match event {
            LoopEvent::Fetched(command) if !command.needs_session() => debug!("{event}"),
            LoopEvent::Escalated { .. } | LoopEvent::Halted => error!("{event}"),
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

fn supervise_wifi(disconnected_since_ms: &mut Option<u64>, wifi_connected: bool, now_ms: u64) {
    if wifi_connected {
        *disconnected_since_ms = None;
        return;
    }

    let Some(since_ms) = *disconnected_since_ms else {
        *disconnected_since_ms = Some(now_ms);
        return;
    };

    if now_ms.saturating_sub(since_ms) >= WIFI_RESTART_GRACE_MS {
        warn!(
            "wifi disconnected for {}s; restarting device for recovery",
            WIFI_RESTART_GRACE_MS / 1000
        );
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(Some(serde_json::from_str::<RuntimeConfig>(value)?)),
            None => Ok(None),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

/// Solid while idle, fast blink with a session open, dark once failed.
/// A lost station link overrides with a slow blink.
fn update_status_led(
    status_led: &mut Option<StatusLed>,
    loop_state: LoopState,
    wifi_connected: bool,
    now_ms: u64,
) {
    let desired_on = if !wifi_connected {
        ((now_ms / LED_SLOW_BLINK_MS) % 2) == 0
    } else {
        match loop_state {
            LoopState::Idle => true,
            LoopState::Failed | LoopState::Terminated => false,
            LoopState::Connecting
            | LoopState::AwaitingSession
            | LoopState::Reconciling
            | LoopState::Draining => ((now_ms / LED_FAST_BLINK_MS) % 2) == 0,
        }
    };

    let Some(led) = status_led.as_mut() else {
        return;
    };

    if desired_on == led.lit {
        return;
    }

    let result = if desired_on {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = desired_on;
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
