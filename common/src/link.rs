//! Frame codec for the lock's BLE command and notification characteristics.
//!
//! Frames are `[op, item, payload..]` in the plain framing the simulated
//! peer speaks. Nothing here is encrypted, and the SHA-256 login token is not
//! the vendor handshake. Production locks only talk through a
//! [`SessionLayer`] that wraps these frames; [`PlainLayer`] is the
//! pass-through used against the simulator and bench peers.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    config::DeviceKeys,
    device::{DeviceCommand, DeviceKind, HistoryTag, MAX_HISTORY_TAG_BYTES},
    types::DeviceStatus,
};

pub const OP_ASYNC: u8 = 0x05;
pub const OP_SYNC: u8 = 0x06;
pub const OP_RESPONSE: u8 = 0x07;
pub const OP_PUBLISH: u8 = 0x08;

pub const ITEM_LOGIN: u8 = 2;
pub const ITEM_INITIAL: u8 = 14;
pub const ITEM_MECH_STATUS: u8 = 81;
pub const ITEM_LOCK: u8 = 82;
pub const ITEM_UNLOCK: u8 = 83;

pub const NONCE_BYTES: usize = 4;
pub const TOKEN_BYTES: usize = 4;

const MECH_STATUS_BYTES: usize = 7;
const FLAG_IN_LOCK: u8 = 0x02;
const FLAG_IN_UNLOCK: u8 = 0x04;
const FLAG_BATTERY_CRITICAL: u8 = 0x20;
// Raw ADC counts to volts.
const BATTERY_VOLTS_PER_COUNT: f32 = 7.2 / 1023.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("frame is shorter than its header")]
    MissingHeader,
    #[error("item {item} payload is {actual} bytes, expected {expected}")]
    Truncated {
        item: u8,
        expected: usize,
        actual: usize,
    },
    #[error("unknown op code {0:#04x}")]
    UnknownOp(u8),
    #[error("unexpected item {item} for op {op:#04x}")]
    UnexpectedItem { op: u8, item: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Initial { nonce: [u8; NONCE_BYTES] },
    MechStatus(DeviceStatus),
    Response { item: u8, success: bool },
}

pub fn decode_notification(kind: DeviceKind, frame: &[u8]) -> Result<Notification, LinkError> {
    let [op, item, payload @ ..] = frame else {
        return Err(LinkError::MissingHeader);
    };

    match (*op, *item) {
        (OP_PUBLISH, ITEM_INITIAL) => {
            let nonce = payload
                .get(..NONCE_BYTES)
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or(LinkError::Truncated {
                    item: *item,
                    expected: NONCE_BYTES,
                    actual: payload.len(),
                })?;
            Ok(Notification::Initial { nonce })
        }
        (OP_PUBLISH, ITEM_MECH_STATUS) => {
            decode_mech_status(kind, payload).map(Notification::MechStatus)
        }
        (OP_PUBLISH, other) => Err(LinkError::UnexpectedItem {
            op: OP_PUBLISH,
            item: other,
        }),
        (OP_RESPONSE, item) => {
            let result = payload.first().ok_or(LinkError::Truncated {
                item,
                expected: 1,
                actual: 0,
            })?;
            Ok(Notification::Response {
                item,
                success: *result == 0,
            })
        }
        (op, _) => Err(LinkError::UnknownOp(op)),
    }
}

fn decode_mech_status(kind: DeviceKind, payload: &[u8]) -> Result<DeviceStatus, LinkError> {
    if payload.len() < MECH_STATUS_BYTES {
        return Err(LinkError::Truncated {
            item: ITEM_MECH_STATUS,
            expected: MECH_STATUS_BYTES,
            actual: payload.len(),
        });
    }

    let battery = u16::from_le_bytes([payload[0], payload[1]]);
    // Bot frames carry motor state where latches report the knob angle.
    let position = match kind {
        DeviceKind::Bot => 0,
        DeviceKind::Latch | DeviceKind::Cycle => i16::from_le_bytes([payload[4], payload[5]]),
    };
    let flags = payload[6];

    Ok(DeviceStatus {
        locked: flags & FLAG_IN_LOCK != 0,
        unlocked: flags & FLAG_IN_UNLOCK != 0,
        position,
        voltage: f32::from(battery) * BATTERY_VOLTS_PER_COUNT,
        voltage_critical: flags & FLAG_BATTERY_CRITICAL != 0,
    })
}

/// Device-side encoding of a mechanical status publish.
pub fn encode_mech_status(kind: DeviceKind, status: &DeviceStatus) -> Vec<u8> {
    let battery = (status.voltage / BATTERY_VOLTS_PER_COUNT)
        .round()
        .clamp(0.0, f32::from(u16::MAX)) as u16;
    let mut flags = 0_u8;
    if status.locked {
        flags |= FLAG_IN_LOCK;
    }
    if status.unlocked {
        flags |= FLAG_IN_UNLOCK;
    }
    if status.voltage_critical {
        flags |= FLAG_BATTERY_CRITICAL;
    }

    let mut frame = vec![OP_PUBLISH, ITEM_MECH_STATUS];
    frame.extend_from_slice(&battery.to_le_bytes());
    match kind {
        DeviceKind::Bot => frame.extend_from_slice(&[0, 0, 0, 0]),
        DeviceKind::Latch | DeviceKind::Cycle => {
            frame.extend_from_slice(&status.position.to_le_bytes());
            frame.extend_from_slice(&status.position.to_le_bytes());
        }
    }
    frame.push(flags);
    frame
}

pub fn encode_command(command: DeviceCommand, tag: &HistoryTag) -> Vec<u8> {
    let item = match command {
        DeviceCommand::Lock => ITEM_LOCK,
        DeviceCommand::Unlock => ITEM_UNLOCK,
    };
    let tag_bytes = tag.as_bytes();

    let mut frame = Vec::with_capacity(3 + MAX_HISTORY_TAG_BYTES);
    frame.push(OP_ASYNC);
    frame.push(item);
    frame.push(tag_bytes.len() as u8);
    frame.extend_from_slice(tag_bytes);
    frame.resize(3 + MAX_HISTORY_TAG_BYTES, 0);
    frame
}

/// Login token proving possession of the secret key for this nonce.
pub fn login_token(secret_key: &[u8; 16], nonce: &[u8; NONCE_BYTES]) -> [u8; TOKEN_BYTES] {
    let mut hasher = Sha256::new();
    hasher.update(secret_key);
    hasher.update(nonce);
    let digest = hasher.finalize();

    let mut token = [0_u8; TOKEN_BYTES];
    token.copy_from_slice(&digest[..TOKEN_BYTES]);
    token
}

pub fn encode_login(token: &[u8; TOKEN_BYTES]) -> Vec<u8> {
    let mut frame = vec![OP_SYNC, ITEM_LOGIN];
    frame.extend_from_slice(token);
    frame
}

/// Login and per-frame protection applied on top of the plain framing.
pub trait SessionLayer: Send {
    /// Login frame answering the nonce from the initial publish.
    fn login(&mut self, nonce: &[u8; NONCE_BYTES]) -> Vec<u8>;

    /// Wraps an outgoing frame for the write characteristic.
    fn seal(&mut self, frame: Vec<u8>) -> Vec<u8>;

    /// Unwraps a notification into a plain frame for [`decode_notification`].
    fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError>;

    /// Forgets per-connection state.
    fn reset(&mut self);
}

/// Unprotected frames with the SHA-256 login token.
pub struct PlainLayer {
    secret_key: [u8; 16],
}

impl PlainLayer {
    pub fn new(keys: &DeviceKeys) -> Self {
        Self {
            secret_key: keys.secret_key,
        }
    }
}

impl SessionLayer for PlainLayer {
    fn login(&mut self, nonce: &[u8; NONCE_BYTES]) -> Vec<u8> {
        encode_login(&login_token(&self.secret_key, nonce))
    }

    fn seal(&mut self, frame: Vec<u8>) -> Vec<u8> {
        frame
    }

    fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
        Ok(frame.to_vec())
    }

    fn reset(&mut self) {}
}
