pub mod config;
pub mod device;
pub mod directive;
pub mod link;
pub mod reconcile;
pub mod session;
pub mod types;

pub use config::{
    ApiConfig, ConfigError, DeviceConfig, DeviceKeys, FailurePolicy, LoopConfig, NetworkConfig,
    RuntimeConfig,
};
pub use device::{DeviceCommand, DeviceKind, DeviceModel, HistoryTag, LockAction};
pub use reconcile::{LoopEvent, LoopSnapshot, LoopStats, ReconciliationLoop, TickOutcome};
pub use session::{
    status_channel, CommandSource, DeviceSession, StatusInbox, StatusNotifier, StatusReporter,
};
pub use types::{DeviceStatus, LoopState, RemoteCommand, SessionState};
