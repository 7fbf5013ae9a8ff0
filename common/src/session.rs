use std::sync::mpsc::{self, Receiver, Sender};

use crate::{
    device::HistoryTag,
    types::{DeviceStatus, RemoteCommand, SessionState},
};

/// Session-oriented controller for one lock device.
///
/// `lock` and `unlock` report transmission only; the resulting lock state
/// arrives later through the [`StatusNotifier`] handed out at bootstrap.
pub trait DeviceSession {
    /// Opens the link, retrying up to `max_attempts` times.
    fn connect(&mut self, max_attempts: u32) -> bool;

    /// True once the session handshake has completed.
    fn is_session_active(&mut self) -> bool;

    fn lock(&mut self, tag: &HistoryTag) -> bool;

    fn unlock(&mut self, tag: &HistoryTag) -> bool;

    /// Safe to call when not connected.
    fn disconnect(&mut self);

    fn state(&self) -> SessionState;
}

pub trait CommandSource {
    fn fetch(&mut self) -> RemoteCommand;
}

/// Best-effort upstream status push. Failures are the implementor's to log.
pub trait StatusReporter {
    fn report(&mut self, status_line: &str);
}

/// Creates the status hand-off between the session's event handler and the loop.
pub fn status_channel() -> (StatusNotifier, StatusInbox) {
    let (tx, rx) = mpsc::channel();
    (StatusNotifier { tx }, StatusInbox { rx })
}

/// Write side, owned by the session controller's notification handler.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    tx: Sender<DeviceStatus>,
}

impl StatusNotifier {
    /// Never blocks. A dropped inbox silently discards the snapshot.
    pub fn notify(&self, status: DeviceStatus) {
        let _ = self.tx.send(status);
    }
}

/// Read side, drained by the reconciliation loop on every tick.
#[derive(Debug)]
pub struct StatusInbox {
    rx: Receiver<DeviceStatus>,
}

impl StatusInbox {
    pub fn drain(&self) -> Vec<DeviceStatus> {
        self.rx.try_iter().collect()
    }
}
