use serde::{Deserialize, Serialize};

/// Directive fetched from the remote command source on one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteCommand {
    Lock,
    Unlock,
    QueryStatus,
    None,
    FetchFailed,
}

impl RemoteCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "LOCK",
            Self::Unlock => "UNLOCK",
            Self::QueryStatus => "QUERY_STATUS",
            Self::None => "NONE",
            Self::FetchFailed => "FETCH_FAILED",
        }
    }

    /// Whether this directive needs a device session to be reconciled.
    pub fn needs_session(self) -> bool {
        matches!(self, Self::Lock | Self::Unlock | Self::QueryStatus)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    #[serde(rename = "inLock")]
    pub locked: bool,
    #[serde(rename = "inUnlock")]
    pub unlocked: bool,
    pub position: i16,
    pub voltage: f32,
    #[serde(rename = "voltageCritical")]
    pub voltage_critical: bool,
}

impl DeviceStatus {
    /// Text form pushed upstream by the status reporter.
    pub fn status_line(&self) -> String {
        format!(
            "lock={},in_unlock={},pos={},volt={:.2},volt_crit={}",
            u8::from(self.locked),
            u8::from(self.unlocked),
            self.position,
            self.voltage,
            u8::from(self.voltage_critical),
        )
    }

    /// Text form used for device-side log lines.
    pub fn log_line(&self) -> String {
        format!(
            "in_lock={},in_unlock={},pos={},volt={:.2},volt_crit={}",
            u8::from(self.locked),
            u8::from(self.unlocked),
            self.position,
            self.voltage,
            u8::from(self.voltage_critical),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Idle,
    Connecting,
    AwaitingSession,
    Reconciling,
    Draining,
    Failed,
    Terminated,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::AwaitingSession => "AWAITING_SESSION",
            Self::Reconciling => "RECONCILING",
            Self::Draining => "DRAINING",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        }
    }
}

/// Lifecycle of the BLE session as reported by the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Authenticating,
    Active,
    Disconnecting,
    ConnectFailed,
    AuthFailed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticating => "AUTHENTICATING",
            Self::Active => "ACTIVE",
            Self::Disconnecting => "DISCONNECTING",
            Self::ConnectFailed => "CONNECT_FAILED",
            Self::AuthFailed => "AUTH_FAILED",
        }
    }
}
