use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use esp32_nimble::{utilities::BleUuid, uuid128, BLEAddress, BLEClient, BLEDevice};
use esp_idf_svc::hal::task::block_on;
use log::{debug, info, warn};

use smartlock_common::{
    link::{
        decode_notification, encode_command, Notification, SessionLayer, ITEM_LOGIN, NONCE_BYTES,
    },
    DeviceCommand, DeviceKind, DeviceModel, DeviceSession, HistoryTag, SessionState,
    StatusNotifier,
};

const SERVICE_UUID: BleUuid = BleUuid::from_uuid16(0xfd81);
const WRITE_UUID: BleUuid = uuid128!("16860002-a5ae-9856-b6d3-dbb4c676993e");
const NOTIFY_UUID: BleUuid = uuid128!("16860003-a5ae-9856-b6d3-dbb4c676993e");

pub struct Discovered {
    pub address: BLEAddress,
    pub model: DeviceModel,
    pub kind: DeviceKind,
}

/// Scans until the configured lock advertises or the window closes.
pub fn discover(identifier: &str, scan_duration_ms: u64) -> anyhow::Result<Discovered> {
    let ble_device = BLEDevice::take();
    let scan = ble_device.get_scan();
    scan.active_scan(true).interval(100).window(99);

    info!("scanning {scan_duration_ms} ms for `{identifier}`");
    let window = i32::try_from(scan_duration_ms).unwrap_or(i32::MAX);
    let found = block_on(scan.start(ble_device, window, |device, data| {
        if !device.addr().to_string().eq_ignore_ascii_case(identifier) {
            return None;
        }
        let manufacturer = data.manufacture_data()?;
        let mut raw = manufacturer.company_identifier.to_le_bytes().to_vec();
        raw.extend_from_slice(manufacturer.payload);
        Some((*device.addr(), DeviceModel::from_manufacturer_data(&raw)))
    }))
    .map_err(|err| anyhow!("BLE scan failed: {err:?}"))?;

    let Some((address, model)) = found else {
        bail!("device `{identifier}` not found during scan");
    };
    let model = model.ok_or_else(|| anyhow!("device `{identifier}` is not a supported lock"))?;
    let kind = model
        .kind()
        .ok_or_else(|| anyhow!("{} cannot be controlled", model.display_name()))?;

    info!("found {} at {address}", model.display_name());
    Ok(Discovered {
        address,
        model,
        kind,
    })
}

/// Link state written from the notification callback.
#[derive(Default)]
struct LinkShared {
    nonce: Option<[u8; NONCE_BYTES]>,
    login: Option<bool>,
}

type SharedLayer = Arc<Mutex<Box<dyn SessionLayer>>>;

/// Drives one lock over GATT. Every frame passes through the session layer
/// supplied at bootstrap.
pub struct NimbleSession {
    client: BLEClient,
    address: BLEAddress,
    kind: DeviceKind,
    layer: SharedLayer,
    notifier: StatusNotifier,
    shared: Arc<Mutex<LinkShared>>,
    state: SessionState,
    login_sent: bool,
}

impl NimbleSession {
    pub fn new(
        discovered: &Discovered,
        layer: Box<dyn SessionLayer>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            client: BLEDevice::take().new_client(),
            address: discovered.address,
            kind: discovered.kind,
            layer: Arc::new(Mutex::new(layer)),
            notifier,
            shared: Arc::new(Mutex::new(LinkShared::default())),
            state: SessionState::Idle,
            login_sent: false,
        }
    }

    fn open(&mut self) -> anyhow::Result<()> {
        if let Ok(mut shared) = self.shared.lock() {
            *shared = LinkShared::default();
        }
        if let Ok(mut layer) = self.layer.lock() {
            layer.reset();
        }
        self.login_sent = false;

        let kind = self.kind;
        let layer = self.layer.clone();
        let shared = self.shared.clone();
        let notifier = self.notifier.clone();
        let address = self.address;
        let client = &mut self.client;

        block_on(async move {
            client.connect(&address).await?;
            let service = client.get_service(SERVICE_UUID).await?;
            let notify = service.get_characteristic(NOTIFY_UUID).await?;
            notify.on_notify(move |frame| handle_frame(kind, frame, &layer, &shared, &notifier));
            notify.subscribe_notify(false).await
        })
        .map_err(|err| anyhow!("{err:?}"))
    }

    fn write_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let client = &mut self.client;
        block_on(async move {
            let service = client.get_service(SERVICE_UUID).await?;
            let write = service.get_characteristic(WRITE_UUID).await?;
            write.write_value(frame, true).await
        })
        .map_err(|err| anyhow!("{err:?}"))
    }

    fn submit(&mut self, command: DeviceCommand, tag: &HistoryTag) -> bool {
        if self.state != SessionState::Active || !self.client.connected() {
            return false;
        }
        let sealed = match self.layer.lock() {
            Ok(mut layer) => layer.seal(encode_command(command, tag)),
            Err(_) => return false,
        };
        match self.write_frame(&sealed) {
            Ok(()) => true,
            Err(err) => {
                warn!("{command:?} write failed: {err:#}");
                false
            }
        }
    }
}

fn handle_frame(
    kind: DeviceKind,
    raw: &[u8],
    layer: &SharedLayer,
    shared: &Mutex<LinkShared>,
    notifier: &StatusNotifier,
) {
    let opened = match layer.lock() {
        Ok(mut layer) => layer.open(raw),
        Err(_) => return,
    };
    let frame = match opened {
        Ok(frame) => frame,
        Err(err) => {
            warn!("dropping unreadable notification: {err}");
            return;
        }
    };
    match decode_notification(kind, &frame) {
        Ok(Notification::Initial { nonce }) => {
            if let Ok(mut shared) = shared.lock() {
                shared.nonce = Some(nonce);
            }
        }
        Ok(Notification::MechStatus(status)) => notifier.notify(status),
        Ok(Notification::Response {
            item: ITEM_LOGIN,
            success,
        }) => {
            if let Ok(mut shared) = shared.lock() {
                shared.login = Some(success);
            }
        }
        Ok(Notification::Response { item, success }) => {
            debug!("response for item {item}: success={success}");
        }
        Err(err) => warn!("dropping malformed notification: {err}"),
    }
}

impl DeviceSession for NimbleSession {
    fn connect(&mut self, max_attempts: u32) -> bool {
        self.state = SessionState::Connecting;
        for attempt in 1..=max_attempts.max(1) {
            match self.open() {
                Ok(()) => {
                    info!("connected to {} on attempt {attempt}", self.address);
                    self.state = SessionState::Connected;
                    return true;
                }
                Err(err) => {
                    warn!("connect attempt {attempt}/{max_attempts} failed: {err:#}");
                    let _ = self.client.disconnect();
                }
            }
        }
        self.state = SessionState::ConnectFailed;
        false
    }

    fn is_session_active(&mut self) -> bool {
        match self.state {
            SessionState::Active => return self.client.connected(),
            SessionState::Connected | SessionState::Authenticating => {}
            _ => return false,
        }
        if !self.client.connected() {
            self.state = SessionState::Idle;
            return false;
        }

        let (nonce, login) = match self.shared.lock() {
            Ok(shared) => (shared.nonce, shared.login),
            Err(_) => (None, None),
        };

        match login {
            Some(true) => self.state = SessionState::Active,
            Some(false) => self.state = SessionState::AuthFailed,
            None => {
                if let (Some(nonce), false) = (nonce, self.login_sent) {
                    let login = match self.layer.lock() {
                        Ok(mut layer) => layer.login(&nonce),
                        Err(_) => return false,
                    };
                    match self.write_frame(&login) {
                        Ok(()) => {
                            self.login_sent = true;
                            self.state = SessionState::Authenticating;
                        }
                        Err(err) => warn!("login write failed: {err:#}"),
                    }
                }
            }
        }
        self.state == SessionState::Active
    }

    fn lock(&mut self, tag: &HistoryTag) -> bool {
        self.submit(DeviceCommand::Lock, tag)
    }

    fn unlock(&mut self, tag: &HistoryTag) -> bool {
        self.submit(DeviceCommand::Unlock, tag)
    }

    fn disconnect(&mut self) {
        if self.state == SessionState::Idle && !self.client.connected() {
            return;
        }
        self.state = SessionState::Disconnecting;
        if self.client.connected() {
            if let Err(err) = self.client.disconnect() {
                warn!("disconnect failed: {err:?}");
            }
        }
        self.state = SessionState::Idle;
    }

    fn state(&self) -> SessionState {
        self.state
    }
}
