//! In-process lock peer for running the controller without a radio.
//!
//! Both directions go through the same frame codec and [`SessionLayer`] seam
//! the BLE transport uses, so the handshake and status decoding paths are
//! exercised end to end.

use anyhow::{anyhow, bail};
use tracing::{debug, info, warn};

use smartlock_common::{
    link::{
        decode_notification, encode_command, encode_mech_status, login_token, Notification,
        PlainLayer, SessionLayer, ITEM_INITIAL, ITEM_LOCK, ITEM_LOGIN, ITEM_UNLOCK, NONCE_BYTES,
        OP_ASYNC, OP_PUBLISH, OP_RESPONSE, OP_SYNC, TOKEN_BYTES,
    },
    DeviceCommand, DeviceKeys, DeviceKind, DeviceModel, DeviceSession, DeviceStatus, HistoryTag,
    SessionState, StatusNotifier,
};

const LOCKED_POSITION: i16 = -90;
const UNLOCKED_POSITION: i16 = 90;
const NOMINAL_VOLTAGE: f32 = 5.9;

/// Knobs for the simulated peer, read from `LOCK_SIM_*`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimOptions {
    pub model: DeviceModel,
    /// Advertised identifier, or `None` to advertise the configured one.
    pub identifier: Option<String>,
    pub connect_failures: u32,
    pub handshake_polls: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            model: DeviceModel::Sesame5,
            identifier: None,
            connect_failures: 0,
            handshake_polls: 1,
        }
    }
}

impl SimOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        if let Some(name) = lookup("LOCK_SIM_MODEL") {
            match DeviceModel::from_name(&name) {
                Some(model) => options.model = model,
                None => warn!("ignoring unknown LOCK_SIM_MODEL `{name}`"),
            }
        }
        options.identifier = lookup("LOCK_SIM_IDENTIFIER").filter(|value| !value.is_empty());
        if let Some(value) = lookup("LOCK_SIM_CONNECT_FAILURES").and_then(|v| v.parse().ok()) {
            options.connect_failures = value;
        }
        if let Some(value) = lookup("LOCK_SIM_HANDSHAKE_POLLS").and_then(|v| v.parse().ok()) {
            options.handshake_polls = value;
        }
        options
    }
}

#[derive(Debug, Clone)]
pub struct Advertisement {
    pub identifier: String,
    pub manufacturer_data: Vec<u8>,
    pub rssi: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovered {
    pub model: DeviceModel,
    pub kind: DeviceKind,
}

/// What the simulated radio hears: the lock plus unrelated neighbours.
pub fn advertisements(options: &SimOptions, configured_identifier: &str) -> Vec<Advertisement> {
    let identifier = options
        .identifier
        .clone()
        .unwrap_or_else(|| configured_identifier.to_string());
    vec![
        Advertisement {
            identifier: "3c:22:fb:00:00:01".to_string(),
            manufacturer_data: vec![0x4c, 0x00, 0x10, 0x05],
            rssi: -81,
        },
        Advertisement {
            identifier: "wifi-module-2".to_string(),
            manufacturer_data: DeviceModel::WifiModule2.manufacturer_data(),
            rssi: -70,
        },
        Advertisement {
            identifier,
            manufacturer_data: options.model.manufacturer_data(),
            rssi: -58,
        },
    ]
}

/// Picks the configured lock out of a scan. The first match wins.
pub fn select_device(
    advertisements: &[Advertisement],
    identifier: &str,
) -> anyhow::Result<Discovered> {
    let Some(found) = advertisements
        .iter()
        .find(|ad| ad.identifier.eq_ignore_ascii_case(identifier))
    else {
        bail!("device `{identifier}` not found during scan");
    };

    let model = DeviceModel::from_manufacturer_data(&found.manufacturer_data)
        .ok_or_else(|| anyhow!("device `{identifier}` is not a supported lock"))?;
    let kind = model
        .kind()
        .ok_or_else(|| anyhow!("{} cannot be controlled", model.display_name()))?;

    info!(
        "found {} `{}` (rssi {})",
        model.display_name(),
        found.identifier,
        found.rssi
    );
    Ok(Discovered { model, kind })
}

/// Device side of the link.
struct Peer {
    kind: DeviceKind,
    secret_key: [u8; 16],
    status: DeviceStatus,
    nonce: [u8; NONCE_BYTES],
    nonce_seed: u32,
    authenticated: bool,
}

impl Peer {
    fn new(kind: DeviceKind, secret_key: [u8; 16]) -> Self {
        Self {
            kind,
            secret_key,
            status: DeviceStatus {
                locked: false,
                unlocked: true,
                position: UNLOCKED_POSITION,
                voltage: NOMINAL_VOLTAGE,
                voltage_critical: false,
            },
            nonce: [0; NONCE_BYTES],
            nonce_seed: 0x5eed_1234,
            authenticated: false,
        }
    }

    fn on_connect(&mut self) -> Vec<u8> {
        self.nonce_seed = self.nonce_seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.nonce = self.nonce_seed.to_le_bytes();
        self.authenticated = false;

        let mut frame = vec![OP_PUBLISH, ITEM_INITIAL];
        frame.extend_from_slice(&self.nonce);
        frame
    }

    fn receive(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        match frame {
            [OP_SYNC, ITEM_LOGIN, token @ ..] if token.len() >= TOKEN_BYTES => {
                let expected = login_token(&self.secret_key, &self.nonce);
                self.authenticated = token[..TOKEN_BYTES] == expected;
                let mut replies = vec![response(ITEM_LOGIN, self.authenticated)];
                if self.authenticated {
                    replies.push(encode_mech_status(self.kind, &self.status));
                }
                replies
            }
            [OP_ASYNC, item @ (ITEM_LOCK | ITEM_UNLOCK), ..] => {
                if !self.authenticated {
                    return vec![response(*item, false)];
                }
                let locked = *item == ITEM_LOCK;
                self.status.locked = locked;
                self.status.unlocked = !locked;
                self.status.position = if locked {
                    LOCKED_POSITION
                } else {
                    UNLOCKED_POSITION
                };
                vec![
                    response(*item, true),
                    encode_mech_status(self.kind, &self.status),
                ]
            }
            _ => Vec::new(),
        }
    }
}

fn response(item: u8, success: bool) -> Vec<u8> {
    vec![OP_RESPONSE, item, u8::from(!success)]
}

/// Session controller backed by an in-process [`Peer`].
pub struct SimulatedLock {
    kind: DeviceKind,
    layer: Box<dyn SessionLayer>,
    notifier: StatusNotifier,
    peer: Peer,
    state: SessionState,
    nonce: Option<[u8; NONCE_BYTES]>,
    connect_failures_left: u32,
    handshake_polls: u32,
    polls: u32,
}

impl SimulatedLock {
    pub fn new(
        kind: DeviceKind,
        keys: &DeviceKeys,
        notifier: StatusNotifier,
        options: &SimOptions,
    ) -> Self {
        Self {
            kind,
            layer: Box::new(PlainLayer::new(keys)),
            notifier,
            peer: Peer::new(kind, keys.secret_key),
            state: SessionState::Idle,
            nonce: None,
            connect_failures_left: options.connect_failures,
            handshake_polls: options.handshake_polls.max(1),
            polls: 0,
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) {
        let frame = match self.layer.open(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("dropping unreadable frame: {err}");
                return;
            }
        };
        match decode_notification(self.kind, &frame) {
            Ok(Notification::Initial { nonce }) => self.nonce = Some(nonce),
            Ok(Notification::MechStatus(status)) => {
                debug!("mech status: {}", status.log_line());
                self.notifier.notify(status);
            }
            Ok(Notification::Response {
                item: ITEM_LOGIN,
                success,
            }) => {
                self.state = if success {
                    SessionState::Active
                } else {
                    SessionState::AuthFailed
                };
            }
            Ok(Notification::Response { item, success }) => {
                debug!("response for item {item}: success={success}");
            }
            Err(err) => warn!("dropping malformed frame: {err}"),
        }
    }

    fn send(&mut self, frame: &[u8]) {
        for reply in self.peer.receive(frame) {
            self.handle_frame(&reply);
        }
    }

    fn submit(&mut self, command: DeviceCommand, tag: &HistoryTag) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        let sealed = self.layer.seal(encode_command(command, tag));
        self.send(&sealed);
        true
    }
}

impl DeviceSession for SimulatedLock {
    fn connect(&mut self, max_attempts: u32) -> bool {
        self.state = SessionState::Connecting;
        for attempt in 1..=max_attempts.max(1) {
            if self.connect_failures_left > 0 {
                self.connect_failures_left -= 1;
                debug!("simulated connect attempt {attempt} failed");
                continue;
            }

            self.state = SessionState::Connected;
            self.polls = 0;
            let initial = self.peer.on_connect();
            self.handle_frame(&initial);
            return true;
        }

        self.state = SessionState::ConnectFailed;
        false
    }

    fn is_session_active(&mut self) -> bool {
        match self.state {
            SessionState::Active => return true,
            SessionState::Connected | SessionState::Authenticating => {}
            _ => return false,
        }

        self.polls += 1;
        if self.polls < self.handshake_polls {
            self.state = SessionState::Authenticating;
            return false;
        }

        if let Some(nonce) = self.nonce {
            let login = self.layer.login(&nonce);
            self.state = SessionState::Authenticating;
            self.send(&login);
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
        if self.state == SessionState::Idle {
            return;
        }
        self.state = SessionState::Disconnecting;
        self.nonce = None;
        self.layer.reset();
        self.peer.authenticated = false;
        self.state = SessionState::Idle;
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

/// Fixed key material used when the host config carries none.
pub fn demo_keys() -> DeviceKeys {
    DeviceKeys {
        public_key: [0x42; 64],
        secret_key: *b"smartlock-sim-16",
    }
}
