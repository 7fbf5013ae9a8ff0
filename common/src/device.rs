use serde::{Deserialize, Serialize};

/// Maximum history tag length accepted by the lock firmware, in bytes.
pub const MAX_HISTORY_TAG_BYTES: usize = 21;

/// Bluetooth SIG company identifier carried in the lock's advertisements.
pub const MANUFACTURER_ID: u16 = 0x055a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceModel {
    Sesame3,
    WifiModule2,
    Bot,
    Cycle,
    Sesame4,
    Sesame5,
    Unknown,
}

impl DeviceModel {
    /// Decodes the model byte carried in the advertisement manufacturer data.
    pub fn from_model_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Sesame3,
            1 => Self::WifiModule2,
            2 => Self::Bot,
            3 => Self::Cycle,
            4 => Self::Sesame4,
            5 => Self::Sesame5,
            _ => Self::Unknown,
        }
    }

    pub fn model_byte(self) -> u8 {
        match self {
            Self::Sesame3 => 0,
            Self::WifiModule2 => 1,
            Self::Bot => 2,
            Self::Cycle => 3,
            Self::Sesame4 => 4,
            Self::Sesame5 => 5,
            Self::Unknown => u8::MAX,
        }
    }

    /// Reads the model from advertised manufacturer data
    /// (`[company id LE, model, ..]`). Foreign vendors yield `None`.
    pub fn from_manufacturer_data(data: &[u8]) -> Option<Self> {
        let [lo, hi, model, ..] = data else {
            return None;
        };
        (u16::from_le_bytes([*lo, *hi]) == MANUFACTURER_ID).then(|| Self::from_model_byte(*model))
    }

    pub fn manufacturer_data(self) -> Vec<u8> {
        let mut data = MANUFACTURER_ID.to_le_bytes().to_vec();
        data.push(self.model_byte());
        data.push(0);
        data
    }

    /// Parses a configured model name such as `sesame5` or `SESAME_5`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "sesame3" => Some(Self::Sesame3),
            "wifimodule2" => Some(Self::WifiModule2),
            "bot" | "sesamebot" => Some(Self::Bot),
            "cycle" | "sesamecycle" => Some(Self::Cycle),
            "sesame4" => Some(Self::Sesame4),
            "sesame5" => Some(Self::Sesame5),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Sesame3 => "SESAME 3",
            Self::WifiModule2 => "Wi-Fi Module 2",
            Self::Bot => "SESAME bot",
            Self::Cycle => "SESAME Cycle",
            Self::Sesame4 => "SESAME 4",
            Self::Sesame5 => "SESAME 5",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Actuator family, or `None` for models that cannot be driven.
    pub fn kind(self) -> Option<DeviceKind> {
        match self {
            Self::Sesame3 | Self::Sesame4 | Self::Sesame5 => Some(DeviceKind::Latch),
            Self::Bot => Some(DeviceKind::Bot),
            Self::Cycle => Some(DeviceKind::Cycle),
            Self::WifiModule2 | Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    Lock,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Latch,
    Bot,
    Cycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Lock,
    Unlock,
}

impl DeviceKind {
    /// Maps a requested action onto the command this actuator accepts.
    ///
    /// A bot takes the same lock and unlock commands as a latch and differs
    /// only in its status layout. A cycle lock only latches by hand, so
    /// remote locking is unsupported.
    pub fn command_for(self, action: LockAction) -> Option<DeviceCommand> {
        match (self, action) {
            (Self::Latch | Self::Bot, LockAction::Lock) => Some(DeviceCommand::Lock),
            (Self::Latch | Self::Bot | Self::Cycle, LockAction::Unlock) => {
                Some(DeviceCommand::Unlock)
            }
            (Self::Cycle, LockAction::Lock) => None,
        }
    }
}

/// UTF-8 label recorded in the lock's history for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTag(String);

impl HistoryTag {
    pub fn new(text: &str) -> Self {
        let mut end = text.len().min(MAX_HISTORY_TAG_BYTES);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        Self(text[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
