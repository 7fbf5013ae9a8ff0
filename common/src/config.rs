use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

const PUBLIC_KEY_BYTES: usize = 64;
const SECRET_KEY_BYTES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("api host is not configured")]
    MissingApiHost,
    #[error("api path `{0}` must start with `/`")]
    InvalidApiPath(String),
    #[error("target device identifier is not configured")]
    MissingDeviceIdentifier,
    #[error("{name} must be {expected} hex characters, got {actual}")]
    KeyLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} is not valid hex")]
    KeyEncoding { name: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Stop polling for good once the loop fails.
    Halt,
    /// Return to idle polling after the cooldown elapses.
    Recover {
        #[serde(rename = "cooldownMs")]
        cooldown_ms: u64,
    },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Recover { cooldown_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub poll_interval_ms: u64,
    pub connect_attempts: u32,
    /// Waits allowed for the handshake; the session is checked once more
    /// after the last wait.
    pub session_wait_polls: u32,
    pub session_poll_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub failure_policy: FailurePolicy,
    pub lock_tag: String,
    pub unlock_tag: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            connect_attempts: 3,
            session_wait_polls: 3,
            session_poll_interval_ms: 800,
            max_consecutive_failures: 3,
            failure_policy: FailurePolicy::default(),
            lock_tag: "lock:remote".to_string(),
            unlock_tag: "unlock:remote".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub command_path: String,
    pub report_enabled: bool,
    pub report_host: Option<String>,
    pub report_path: Option<String>,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: HTTPS_PORT,
            command_path: "/get-status".to_string(),
            report_enabled: true,
            report_host: None,
            report_path: None,
            api_key: String::new(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub identifier: String,
    pub public_key_hex: String,
    pub secret_key_hex: String,
    pub scan_duration_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            public_key_hex: String::new(),
            secret_key_hex: String::new(),
            scan_duration_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(rename = "loop")]
    pub control: LoopConfig,
    pub api: ApiConfig,
    pub device: DeviceConfig,
    pub network: NetworkConfig,
}

/// Decoded key material for the target lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeys {
    pub public_key: [u8; PUBLIC_KEY_BYTES],
    pub secret_key: [u8; SECRET_KEY_BYTES],
}

impl DeviceKeys {
    /// Short hex digest of the public key, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.public_key)[..4])
    }
}

impl LoopConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(1_000, 3_600_000);
        self.connect_attempts = self.connect_attempts.clamp(1, 10);
        self.session_wait_polls = self.session_wait_polls.clamp(1, 50);
        self.session_poll_interval_ms = self.session_poll_interval_ms.clamp(100, 10_000);
        self.max_consecutive_failures = self.max_consecutive_failures.clamp(1, 100);
        if let FailurePolicy::Recover { cooldown_ms } = &mut self.failure_policy {
            *cooldown_ms = (*cooldown_ms).clamp(1_000, 86_400_000);
        }
    }
}

impl ApiConfig {
    pub fn sanitize(&mut self) {
        self.host = self.host.trim().to_string();
        self.timeout_ms = self.timeout_ms.clamp(500, 60_000);
        if self.port == 0 {
            self.port = HTTPS_PORT;
        }
    }

    pub fn is_tls(&self) -> bool {
        self.port == HTTPS_PORT
    }

    pub fn command_url(&self) -> String {
        self.url(&self.host, &self.command_path)
    }

    pub fn report_url(&self) -> Option<String> {
        if !self.report_enabled {
            return None;
        }
        let host = self.report_host.as_deref().unwrap_or(&self.host);
        let path = self.report_path.as_deref().unwrap_or(&self.command_path);
        Some(self.url(host, path))
    }

    fn url(&self, host: &str, path: &str) -> String {
        let scheme = if self.is_tls() { "https" } else { "http" };
        match self.port {
            HTTPS_PORT | HTTP_PORT => format!("{scheme}://{host}{path}"),
            port => format!("{scheme}://{host}:{port}{path}"),
        }
    }
}

impl DeviceConfig {
    pub fn decode_keys(&self) -> Result<DeviceKeys, ConfigError> {
        Ok(DeviceKeys {
            public_key: decode_hex_key("public key", &self.public_key_hex)?,
            secret_key: decode_hex_key("secret key", &self.secret_key_hex)?,
        })
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.control.sanitize();
        self.api.sanitize();
        self.device.identifier = self.device.identifier.trim().to_string();
        self.device.scan_duration_ms = self.device.scan_duration_ms.clamp(1_000, 60_000);
    }

    /// Checks the fields the control loop cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.host.is_empty() {
            return Err(ConfigError::MissingApiHost);
        }
        for path in [Some(&self.api.command_path), self.api.report_path.as_ref()]
            .into_iter()
            .flatten()
        {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidApiPath(path.clone()));
            }
        }
        if self.device.identifier.is_empty() {
            return Err(ConfigError::MissingDeviceIdentifier);
        }
        Ok(())
    }
}

fn decode_hex_key<const N: usize>(name: &'static str, value: &str) -> Result<[u8; N], ConfigError> {
    let value = value.trim();
    if value.len() != N * 2 {
        return Err(ConfigError::KeyLength {
            name,
            expected: N * 2,
            actual: value.len(),
        });
    }
    let mut key = [0_u8; N];
    hex::decode_to_slice(value, &mut key).map_err(|_| ConfigError::KeyEncoding { name })?;
    Ok(key)
}
