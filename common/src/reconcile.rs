use core::fmt;

use serde::Serialize;

use crate::{
    config::{FailurePolicy, LoopConfig},
    device::{DeviceCommand, DeviceKind, HistoryTag, LockAction},
    session::{CommandSource, DeviceSession, StatusInbox, StatusReporter},
    types::{DeviceStatus, LoopState, RemoteCommand, SessionState},
};

/// Tick spacing once the loop has stopped for good.
pub const TERMINATED_TICK_MS: u64 = 60_000;

/// Something the loop did on a tick, for the platform layer to log or display.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Fetched(RemoteCommand),
    StatusReported(String),
    StatusChanged(DeviceStatus),
    ConnectFailed { attempts: u32 },
    SessionActive { polls: u32 },
    SessionTimedOut { polls: u32 },
    SessionLost,
    CommandSent(DeviceCommand),
    CommandFailed(DeviceCommand),
    CommandUnsupported(LockAction),
    ForcedReportRequested { session: SessionState },
    Disconnected,
    Escalated { failures: u32 },
    Halted,
    Recovered,
}

impl fmt::Display for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetched(command) => write!(f, "fetched directive {}", command.as_str()),
            Self::StatusReported(line) => write!(f, "status reported: {line}"),
            Self::StatusChanged(status) => write!(f, "status {}", status.log_line()),
            Self::ConnectFailed { attempts } => {
                write!(f, "connect failed after {attempts} attempts")
            }
            Self::SessionActive { polls } => write!(f, "session active after {polls} polls"),
            Self::SessionTimedOut { polls } => {
                write!(f, "session not active after {polls} polls; skipping command")
            }
            Self::SessionLost => write!(f, "session dropped before command submission"),
            Self::CommandSent(command) => write!(f, "{command:?} command sent"),
            Self::CommandFailed(command) => write!(f, "{command:?} command submission failed"),
            Self::CommandUnsupported(action) => {
                write!(f, "{action:?} is not supported by this device")
            }
            Self::ForcedReportRequested { session } => {
                write!(f, "status report forced (session {})", session.as_str())
            }
            Self::Disconnected => write!(f, "session closed"),
            Self::Escalated { failures } => {
                write!(f, "{failures} consecutive failed cycles; loop failed")
            }
            Self::Halted => write!(f, "loop halted; no further polling"),
            Self::Recovered => write!(f, "failure cooldown elapsed; resuming polling"),
        }
    }
}

impl LoopEvent {
    /// Whether the event marks a failure worth a warning-level log line.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::SessionTimedOut { .. }
                | Self::SessionLost
                | Self::CommandFailed(_)
                | Self::CommandUnsupported(_)
                | Self::Escalated { .. }
                | Self::Halted
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub previous: LoopState,
    pub state: LoopState,
    /// How long the caller should wait before the next tick.
    pub delay_ms: u64,
    pub events: Vec<LoopEvent>,
}

impl TickOutcome {
    pub fn transitioned(&self) -> bool {
        self.previous != self.state
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    #[serde(rename = "fetchFailures")]
    pub fetch_failures: u64,
    #[serde(rename = "commandsSent")]
    pub commands_sent: u64,
    #[serde(rename = "commandFailures")]
    pub command_failures: u64,
    #[serde(rename = "connectFailures")]
    pub connect_failures: u64,
    #[serde(rename = "sessionTimeouts")]
    pub session_timeouts: u64,
    #[serde(rename = "reportsSent")]
    pub reports_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopSnapshot {
    pub state: &'static str,
    #[serde(rename = "pendingCommand")]
    pub pending_command: Option<&'static str>,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "forceReport")]
    pub force_report: bool,
    #[serde(rename = "lastStatus")]
    pub last_status: Option<DeviceStatus>,
    pub stats: LoopStats,
}

/// Fetch → connect → await session → act → drain state machine.
///
/// One transition per [`tick`](Self::tick); the returned delay is the
/// caller's sleep before the next tick, so the loop itself never blocks.
#[derive(Debug)]
pub struct ReconciliationLoop {
    config: LoopConfig,
    kind: DeviceKind,
    lock_tag: HistoryTag,
    unlock_tag: HistoryTag,
    inbox: StatusInbox,

    state: LoopState,
    pending: Option<RemoteCommand>,
    session_polls: u32,
    cycle_failed: bool,
    consecutive_failures: u32,
    failed_at_ms: Option<u64>,

    last_status: Option<DeviceStatus>,
    force_report: bool,
    pending_report: Option<String>,

    stats: LoopStats,
}

impl ReconciliationLoop {
    pub fn new(mut config: LoopConfig, kind: DeviceKind, inbox: StatusInbox) -> Self {
        config.sanitize();
        Self {
            lock_tag: HistoryTag::new(&config.lock_tag),
            unlock_tag: HistoryTag::new(&config.unlock_tag),
            config,
            kind,
            inbox,
            state: LoopState::Idle,
            pending: None,
            session_polls: 0,
            cycle_failed: false,
            consecutive_failures: 0,
            failed_at_ms: None,
            last_status: None,
            force_report: false,
            pending_report: None,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        LoopSnapshot {
            state: self.state.as_str(),
            pending_command: self.pending.map(RemoteCommand::as_str),
            consecutive_failures: self.consecutive_failures,
            force_report: self.force_report,
            last_status: self.last_status,
            stats: self.stats,
        }
    }

    pub fn tick<C, D, R>(
        &mut self,
        now_ms: u64,
        source: &mut C,
        session: &mut D,
        reporter: &mut R,
    ) -> TickOutcome
    where
        C: CommandSource + ?Sized,
        D: DeviceSession + ?Sized,
        R: StatusReporter + ?Sized,
    {
        let previous = self.state;
        let mut events = Vec::new();

        self.drain_status(&mut events);

        let delay_ms = match self.state {
            LoopState::Idle => self.tick_idle(source, reporter, &mut events),
            LoopState::Connecting => self.tick_connecting(session, &mut events),
            LoopState::AwaitingSession => self.tick_awaiting(session, &mut events),
            LoopState::Reconciling => self.tick_reconciling(session, &mut events),
            LoopState::Draining => self.tick_draining(now_ms, session, &mut events),
            LoopState::Failed => self.tick_failed(now_ms, &mut events),
            LoopState::Terminated => TERMINATED_TICK_MS,
        };

        TickOutcome {
            previous,
            state: self.state,
            delay_ms,
            events,
        }
    }

    fn drain_status(&mut self, events: &mut Vec<LoopEvent>) {
        for status in self.inbox.drain() {
            if self.last_status == Some(status) && !self.force_report {
                continue;
            }
            self.last_status = Some(status);
            self.force_report = false;
            self.pending_report = Some(status.status_line());
            events.push(LoopEvent::StatusChanged(status));
        }
    }

    fn tick_idle<C, R>(
        &mut self,
        source: &mut C,
        reporter: &mut R,
        events: &mut Vec<LoopEvent>,
    ) -> u64
    where
        C: CommandSource + ?Sized,
        R: StatusReporter + ?Sized,
    {
        if let Some(line) = self.pending_report.take() {
            reporter.report(&line);
            self.stats.reports_sent = self.stats.reports_sent.saturating_add(1);
            events.push(LoopEvent::StatusReported(line));
        }

        let command = source.fetch();
        events.push(LoopEvent::Fetched(command));

        if command == RemoteCommand::FetchFailed {
            self.stats.fetch_failures = self.stats.fetch_failures.saturating_add(1);
        }

        if !command.needs_session() {
            return self.config.poll_interval_ms;
        }

        self.pending = Some(command);
        self.session_polls = 0;
        self.cycle_failed = false;
        self.state = LoopState::Connecting;
        0
    }

    fn tick_connecting<D>(&mut self, session: &mut D, events: &mut Vec<LoopEvent>) -> u64
    where
        D: DeviceSession + ?Sized,
    {
        if session.connect(self.config.connect_attempts) {
            self.state = LoopState::AwaitingSession;
        } else {
            self.stats.connect_failures = self.stats.connect_failures.saturating_add(1);
            events.push(LoopEvent::ConnectFailed {
                attempts: self.config.connect_attempts,
            });
            self.fail_cycle();
        }
        0
    }

    fn tick_awaiting<D>(&mut self, session: &mut D, events: &mut Vec<LoopEvent>) -> u64
    where
        D: DeviceSession + ?Sized,
    {
        self.session_polls = self.session_polls.saturating_add(1);

        if session.is_session_active() {
            events.push(LoopEvent::SessionActive {
                polls: self.session_polls,
            });
            self.state = LoopState::Reconciling;
            return 0;
        }

        // The budget counts waits between checks, so the final check comes
        // after the last wait.
        if self.session_polls > self.config.session_wait_polls {
            self.stats.session_timeouts = self.stats.session_timeouts.saturating_add(1);
            events.push(LoopEvent::SessionTimedOut {
                polls: self.session_polls,
            });
            self.fail_cycle();
            return 0;
        }

        self.config.session_poll_interval_ms
    }

    fn tick_reconciling<D>(&mut self, session: &mut D, events: &mut Vec<LoopEvent>) -> u64
    where
        D: DeviceSession + ?Sized,
    {
        self.state = LoopState::Draining;

        // Taken here so a command is submitted at most once per fetch.
        let Some(command) = self.pending.take() else {
            return 0;
        };

        if !session.is_session_active() {
            events.push(LoopEvent::SessionLost);
            self.cycle_failed = true;
            return 0;
        }

        let action = match command {
            RemoteCommand::Lock => LockAction::Lock,
            RemoteCommand::Unlock => LockAction::Unlock,
            RemoteCommand::QueryStatus => {
                // A snapshot cached earlier in this cycle has already been
                // deduplicated, so queue it directly.
                match self.last_status {
                    Some(status) => self.pending_report = Some(status.status_line()),
                    None => self.force_report = true,
                }
                events.push(LoopEvent::ForcedReportRequested {
                    session: session.state(),
                });
                return 0;
            }
            RemoteCommand::None | RemoteCommand::FetchFailed => return 0,
        };

        let Some(device_command) = self.kind.command_for(action) else {
            events.push(LoopEvent::CommandUnsupported(action));
            return 0;
        };

        let sent = match device_command {
            DeviceCommand::Lock => session.lock(&self.lock_tag),
            DeviceCommand::Unlock => session.unlock(&self.unlock_tag),
        };

        if sent {
            self.stats.commands_sent = self.stats.commands_sent.saturating_add(1);
            events.push(LoopEvent::CommandSent(device_command));
        } else {
            self.stats.command_failures = self.stats.command_failures.saturating_add(1);
            events.push(LoopEvent::CommandFailed(device_command));
        }
        0
    }

    fn tick_draining<D>(
        &mut self,
        now_ms: u64,
        session: &mut D,
        events: &mut Vec<LoopEvent>,
    ) -> u64
    where
        D: DeviceSession + ?Sized,
    {
        session.disconnect();
        events.push(LoopEvent::Disconnected);

        self.pending = None;
        self.stats.cycles = self.stats.cycles.saturating_add(1);

        if !self.cycle_failed {
            self.consecutive_failures = 0;
            self.state = LoopState::Idle;
            return self.config.poll_interval_ms;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            events.push(LoopEvent::Escalated {
                failures: self.consecutive_failures,
            });
            self.state = LoopState::Failed;
            self.failed_at_ms = Some(now_ms);
            return 0;
        }

        self.state = LoopState::Idle;
        self.config.poll_interval_ms
    }

    fn tick_failed(&mut self, now_ms: u64, events: &mut Vec<LoopEvent>) -> u64 {
        match self.config.failure_policy {
            FailurePolicy::Halt => {
                events.push(LoopEvent::Halted);
                self.state = LoopState::Terminated;
                TERMINATED_TICK_MS
            }
            FailurePolicy::Recover { cooldown_ms } => {
                let failed_at = *self.failed_at_ms.get_or_insert(now_ms);
                let elapsed = now_ms.saturating_sub(failed_at);
                if elapsed < cooldown_ms {
                    return cooldown_ms - elapsed;
                }

                events.push(LoopEvent::Recovered);
                self.failed_at_ms = None;
                self.consecutive_failures = 0;
                self.state = LoopState::Idle;
                0
            }
        }
    }

    fn fail_cycle(&mut self) {
        self.cycle_failed = true;
        self.state = LoopState::Draining;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::{status_channel, StatusNotifier};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect(u32),
        IsActive,
        Lock(String),
        Unlock(String),
        Disconnect,
    }

    struct ScriptedSource {
        commands: VecDeque<RemoteCommand>,
    }

    impl ScriptedSource {
        fn new(commands: &[RemoteCommand]) -> Self {
            Self {
                commands: commands.iter().copied().collect(),
            }
        }
    }

    impl CommandSource for ScriptedSource {
        fn fetch(&mut self) -> RemoteCommand {
            self.commands.pop_front().unwrap_or(RemoteCommand::None)
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        lines: Vec<String>,
    }

    impl StatusReporter for RecordingReporter {
        fn report(&mut self, status_line: &str) {
            self.lines.push(status_line.to_string());
        }
    }

    struct FakeSession {
        calls: Vec<Call>,
        connect_ok: bool,
        // Number of is_session_active polls answered false before going active.
        inactive_polls: Option<u32>,
        command_ok: bool,
        active: bool,
        // Snapshot published each time the handshake completes.
        on_active: Option<(StatusNotifier, DeviceStatus)>,
    }

    impl FakeSession {
        fn ready() -> Self {
            Self {
                calls: Vec::new(),
                connect_ok: true,
                inactive_polls: Some(0),
                command_ok: true,
                active: false,
                on_active: None,
            }
        }

        fn count(&self, call: &Call) -> usize {
            self.calls.iter().filter(|c| *c == call).count()
        }

        fn locks(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Lock(_)))
                .count()
        }

        fn unlocks(&self) -> usize {
            self.calls
                .iter()
                .filter(|c| matches!(c, Call::Unlock(_)))
                .count()
        }
    }

    impl DeviceSession for FakeSession {
        fn connect(&mut self, max_attempts: u32) -> bool {
            self.calls.push(Call::Connect(max_attempts));
            self.connect_ok
        }

        fn is_session_active(&mut self) -> bool {
            self.calls.push(Call::IsActive);
            if self.active {
                return true;
            }
            match self.inactive_polls.as_mut() {
                Some(0) => {
                    self.active = true;
                    if let Some((notifier, status)) = &self.on_active {
                        notifier.notify(*status);
                    }
                    true
                }
                Some(remaining) => {
                    *remaining -= 1;
                    false
                }
                None => false,
            }
        }

        fn lock(&mut self, tag: &HistoryTag) -> bool {
            assert!(self.active, "lock issued on an inactive session");
            self.calls.push(Call::Lock(tag.as_str().to_string()));
            self.command_ok
        }

        fn unlock(&mut self, tag: &HistoryTag) -> bool {
            assert!(self.active, "unlock issued on an inactive session");
            self.calls.push(Call::Unlock(tag.as_str().to_string()));
            self.command_ok
        }

        fn disconnect(&mut self) {
            self.calls.push(Call::Disconnect);
            self.active = false;
        }

        fn state(&self) -> SessionState {
            if self.active {
                SessionState::Active
            } else {
                SessionState::Idle
            }
        }
    }

    struct Harness {
        engine: ReconciliationLoop,
        notifier: StatusNotifier,
        source: ScriptedSource,
        session: FakeSession,
        reporter: RecordingReporter,
        now_ms: u64,
        outcomes: Vec<TickOutcome>,
    }

    impl Harness {
        fn new(config: LoopConfig, commands: &[RemoteCommand], session: FakeSession) -> Self {
            Self::with_kind(config, DeviceKind::Latch, commands, session)
        }

        fn with_kind(
            config: LoopConfig,
            kind: DeviceKind,
            commands: &[RemoteCommand],
            session: FakeSession,
        ) -> Self {
            let (notifier, inbox) = status_channel();
            Self {
                engine: ReconciliationLoop::new(config, kind, inbox),
                notifier,
                source: ScriptedSource::new(commands),
                session,
                reporter: RecordingReporter::default(),
                now_ms: 0,
                outcomes: Vec::new(),
            }
        }

        fn tick(&mut self) -> TickOutcome {
            let outcome = self.engine.tick(
                self.now_ms,
                &mut self.source,
                &mut self.session,
                &mut self.reporter,
            );
            self.now_ms += outcome.delay_ms;
            self.outcomes.push(outcome.clone());
            outcome
        }

        /// Ticks until the loop settles back into idle (or fails).
        fn run_cycle(&mut self) {
            let first = self.tick();
            if first.state == LoopState::Idle {
                return;
            }
            for _ in 0..32 {
                let outcome = self.tick();
                if matches!(
                    outcome.state,
                    LoopState::Idle | LoopState::Failed | LoopState::Terminated
                ) {
                    return;
                }
            }
            panic!("cycle did not complete");
        }

        fn events(&self) -> Vec<LoopEvent> {
            self.outcomes
                .iter()
                .flat_map(|outcome| outcome.events.clone())
                .collect()
        }
    }

    fn status(locked: bool) -> DeviceStatus {
        DeviceStatus {
            locked,
            unlocked: !locked,
            position: if locked { -90 } else { 90 },
            voltage: 5.9,
            voltage_critical: false,
        }
    }

    #[test]
    fn no_op_directives_never_touch_the_session() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::FetchFailed, RemoteCommand::None],
            FakeSession::ready(),
        );

        let first = harness.tick();
        let second = harness.tick();

        assert!(harness.session.calls.is_empty());
        assert_eq!(first.state, LoopState::Idle);
        assert_eq!(first.delay_ms, 5_000);
        assert_eq!(second.delay_ms, 5_000);
        assert_eq!(harness.engine.stats().fetch_failures, 1);
    }

    #[test]
    fn lock_cycle_walks_every_state() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::Lock],
            FakeSession::ready(),
        );
        harness.run_cycle();

        let states: Vec<_> = harness.outcomes.iter().map(|o| o.state).collect();
        assert_eq!(
            states,
            vec![
                LoopState::Connecting,
                LoopState::AwaitingSession,
                LoopState::Reconciling,
                LoopState::Draining,
                LoopState::Idle,
            ]
        );
        assert_eq!(
            harness.session.calls,
            vec![
                Call::Connect(3),
                Call::IsActive,
                Call::IsActive,
                Call::Lock("lock:remote".to_string()),
                Call::Disconnect,
            ]
        );
        assert_eq!(harness.outcomes.last().map(|o| o.delay_ms), Some(5_000));
    }

    #[test]
    fn fetch_sequence_issues_one_lock_per_lock_fetch() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[
                RemoteCommand::FetchFailed,
                RemoteCommand::None,
                RemoteCommand::Lock,
                RemoteCommand::Lock,
            ],
            FakeSession::ready(),
        );

        for _ in 0..4 {
            harness.run_cycle();
        }
        // Further polls return None and must not repeat the command.
        for _ in 0..3 {
            harness.run_cycle();
        }

        assert_eq!(harness.session.locks(), 2);
        assert_eq!(harness.session.unlocks(), 0);
        assert_eq!(harness.session.count(&Call::Connect(3)), 2);
        assert_eq!(harness.session.count(&Call::Disconnect), 2);
    }

    #[test]
    fn unlock_never_maps_to_lock() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::Unlock],
            FakeSession::ready(),
        );
        harness.run_cycle();

        assert_eq!(harness.session.locks(), 0);
        assert_eq!(harness.session.unlocks(), 1);
        assert!(harness
            .events()
            .contains(&LoopEvent::CommandSent(DeviceCommand::Unlock)));
    }

    #[test]
    fn connect_failure_skips_readiness_polling() {
        let mut session = FakeSession::ready();
        session.connect_ok = false;
        let mut harness = Harness::new(LoopConfig::default(), &[RemoteCommand::Lock], session);
        harness.run_cycle();

        assert_eq!(
            harness.session.calls,
            vec![Call::Connect(3), Call::Disconnect]
        );
        assert_eq!(harness.session.count(&Call::IsActive), 0);
        assert_eq!(harness.engine.consecutive_failures(), 1);
        assert_eq!(harness.engine.state(), LoopState::Idle);
        assert!(harness
            .events()
            .contains(&LoopEvent::ConnectFailed { attempts: 3 }));
    }

    #[test]
    fn session_timeout_issues_no_command() {
        let mut session = FakeSession::ready();
        session.inactive_polls = None;
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::Lock, RemoteCommand::QueryStatus],
            session,
        );
        harness.run_cycle();
        harness.run_cycle();

        assert_eq!(harness.session.locks(), 0);
        assert_eq!(harness.session.unlocks(), 0);
        assert_eq!(harness.session.count(&Call::IsActive), 8);
        assert_eq!(harness.session.count(&Call::Disconnect), 2);
        assert!(!harness
            .events()
            .iter()
            .any(|event| matches!(event, LoopEvent::ForcedReportRequested { .. })));
        assert!(!harness.engine.snapshot().force_report);
    }

    #[test]
    fn readiness_polls_are_spaced_by_poll_interval() {
        let mut session = FakeSession::ready();
        session.inactive_polls = Some(2);
        let mut harness = Harness::new(LoopConfig::default(), &[RemoteCommand::Lock], session);
        harness.run_cycle();

        let awaiting: Vec<_> = harness
            .outcomes
            .iter()
            .filter(|o| o.previous == LoopState::AwaitingSession)
            .map(|o| (o.state, o.delay_ms))
            .collect();
        assert_eq!(
            awaiting,
            vec![
                (LoopState::AwaitingSession, 800),
                (LoopState::AwaitingSession, 800),
                (LoopState::Reconciling, 0),
            ]
        );
        assert_eq!(harness.session.locks(), 1);
    }

    #[test]
    fn readiness_budget_counts_waits_between_checks() {
        let mut session = FakeSession::ready();
        session.inactive_polls = Some(3);
        let mut harness = Harness::new(LoopConfig::default(), &[RemoteCommand::Lock], session);
        harness.run_cycle();
        assert_eq!(harness.session.locks(), 1);
        assert_eq!(harness.session.count(&Call::IsActive), 5);

        let mut session = FakeSession::ready();
        session.inactive_polls = None;
        let mut harness = Harness::new(LoopConfig::default(), &[RemoteCommand::Lock], session);
        harness.run_cycle();

        let awaiting: Vec<_> = harness
            .outcomes
            .iter()
            .filter(|o| o.previous == LoopState::AwaitingSession)
            .map(|o| (o.state, o.delay_ms))
            .collect();
        assert_eq!(
            awaiting,
            vec![
                (LoopState::AwaitingSession, 800),
                (LoopState::AwaitingSession, 800),
                (LoopState::AwaitingSession, 800),
                (LoopState::Draining, 0),
            ]
        );
        assert_eq!(harness.session.count(&Call::IsActive), 4);
        assert!(harness
            .events()
            .contains(&LoopEvent::SessionTimedOut { polls: 4 }));
    }

    #[test]
    fn disconnect_once_per_cycle_on_every_path() {
        let mut config = LoopConfig::default();
        config.max_consecutive_failures = 100;

        for (connect_ok, inactive_polls) in [(true, Some(0)), (false, Some(0)), (true, None)] {
            let mut session = FakeSession::ready();
            session.connect_ok = connect_ok;
            session.inactive_polls = inactive_polls;
            let mut harness = Harness::new(
                config.clone(),
                &[RemoteCommand::Lock, RemoteCommand::Unlock, RemoteCommand::QueryStatus],
                session,
            );
            for _ in 0..3 {
                harness.run_cycle();
            }
            assert_eq!(harness.session.count(&Call::Disconnect), 3);
        }
    }

    #[test]
    fn command_failure_is_not_retried() {
        let mut session = FakeSession::ready();
        session.command_ok = false;
        let mut harness = Harness::new(LoopConfig::default(), &[RemoteCommand::Lock], session);
        harness.run_cycle();
        harness.run_cycle();

        assert_eq!(harness.session.locks(), 1);
        assert_eq!(harness.engine.stats().command_failures, 1);
        assert_eq!(harness.engine.consecutive_failures(), 0);
    }

    #[test]
    fn repeated_failures_escalate_and_halt() {
        let mut config = LoopConfig::default();
        config.failure_policy = FailurePolicy::Halt;
        let mut session = FakeSession::ready();
        session.connect_ok = false;
        let mut harness = Harness::new(config, &[RemoteCommand::Lock; 3], session);

        for _ in 0..3 {
            harness.run_cycle();
        }
        assert_eq!(harness.engine.state(), LoopState::Failed);
        assert!(harness
            .events()
            .contains(&LoopEvent::Escalated { failures: 3 }));

        let halted = harness.tick();
        assert_eq!(halted.state, LoopState::Terminated);
        assert!(halted.events.contains(&LoopEvent::Halted));

        let calls_before = harness.session.calls.len();
        for _ in 0..5 {
            let outcome = harness.tick();
            assert_eq!(outcome.state, LoopState::Terminated);
            assert_eq!(outcome.delay_ms, TERMINATED_TICK_MS);
        }
        assert_eq!(harness.session.calls.len(), calls_before);
        assert_eq!(harness.source.commands.len(), 0);
    }

    #[test]
    fn recover_policy_returns_to_idle_after_cooldown() {
        let mut config = LoopConfig::default();
        config.max_consecutive_failures = 1;
        config.failure_policy = FailurePolicy::Recover { cooldown_ms: 30_000 };
        let mut session = FakeSession::ready();
        session.connect_ok = false;
        let mut harness = Harness::new(
            config,
            &[RemoteCommand::Lock, RemoteCommand::None],
            session,
        );

        harness.run_cycle();
        assert_eq!(harness.engine.state(), LoopState::Failed);

        let waiting = harness.tick();
        assert_eq!(waiting.state, LoopState::Failed);
        assert_eq!(waiting.delay_ms, 30_000);

        let recovered = harness.tick();
        assert_eq!(recovered.state, LoopState::Idle);
        assert!(recovered.events.contains(&LoopEvent::Recovered));
        assert_eq!(harness.engine.consecutive_failures(), 0);

        let polled = harness.tick();
        assert_eq!(polled.events, vec![LoopEvent::Fetched(RemoteCommand::None)]);
    }

    #[test]
    fn successful_cycle_resets_failure_count() {
        let mut session = FakeSession::ready();
        session.inactive_polls = None;
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::Lock, RemoteCommand::Lock],
            session,
        );
        harness.run_cycle();
        assert_eq!(harness.engine.consecutive_failures(), 1);

        harness.session.inactive_polls = Some(0);
        harness.run_cycle();
        assert_eq!(harness.engine.consecutive_failures(), 0);
        assert_eq!(harness.session.locks(), 1);
    }

    #[test]
    fn identical_snapshots_are_reported_once() {
        let mut harness = Harness::new(LoopConfig::default(), &[], FakeSession::ready());
        harness.notifier.notify(status(true));
        harness.notifier.notify(status(true));
        harness.tick();
        harness.notifier.notify(status(true));
        harness.tick();
        harness.tick();

        assert_eq!(
            harness.reporter.lines,
            vec!["lock=1,in_unlock=0,pos=-90,volt=5.90,volt_crit=0".to_string()]
        );

        harness.notifier.notify(status(false));
        harness.tick();
        assert_eq!(harness.reporter.lines.len(), 2);
        assert_eq!(harness.engine.stats().reports_sent, 2);
    }

    #[test]
    fn query_status_reports_cached_status_in_the_same_cycle() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::QueryStatus],
            FakeSession::ready(),
        );
        harness.notifier.notify(status(true));
        harness.run_cycle();
        assert_eq!(harness.reporter.lines.len(), 1);
        assert_eq!(harness.session.locks(), 0);
        assert_eq!(harness.session.unlocks(), 0);
        assert!(harness.events().contains(&LoopEvent::ForcedReportRequested {
            session: SessionState::Active
        }));
        assert!(!harness.engine.snapshot().force_report);

        let next = harness.tick();
        assert_eq!(
            next.events,
            vec![
                LoopEvent::StatusReported(status(true).status_line()),
                LoopEvent::Fetched(RemoteCommand::None),
            ]
        );

        // Nothing left armed: the same snapshot again is deduplicated.
        harness.notifier.notify(status(true));
        harness.tick();
        harness.tick();
        assert_eq!(harness.reporter.lines.len(), 2);
    }

    #[test]
    fn query_status_before_any_snapshot_reports_the_next_one() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::QueryStatus],
            FakeSession::ready(),
        );
        harness.run_cycle();
        assert!(harness.reporter.lines.is_empty());
        assert!(harness.engine.snapshot().force_report);

        harness.notifier.notify(status(false));
        harness.tick();
        assert_eq!(harness.reporter.lines, vec![status(false).status_line()]);
        assert!(!harness.engine.snapshot().force_report);
    }

    #[test]
    fn query_after_lock_reports_the_handshake_snapshot_again() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::Lock, RemoteCommand::QueryStatus],
            FakeSession::ready(),
        );
        harness.session.on_active = Some((harness.notifier.clone(), status(true)));

        for _ in 0..20 {
            harness.tick();
        }

        let line = status(true).status_line();
        assert_eq!(harness.reporter.lines, vec![line.clone(), line]);
        assert_eq!(harness.session.locks(), 1);
        assert!(!harness.engine.snapshot().force_report);
        assert_eq!(harness.engine.state(), LoopState::Idle);
    }

    #[test]
    fn status_report_is_flushed_before_the_next_fetch() {
        let mut harness = Harness::new(
            LoopConfig::default(),
            &[RemoteCommand::Lock],
            FakeSession::ready(),
        );
        harness.tick();
        harness.notifier.notify(status(true));
        harness.run_cycle();
        assert!(harness.reporter.lines.is_empty());

        let next = harness.tick();
        assert_eq!(
            next.events,
            vec![
                LoopEvent::StatusReported(status(true).status_line()),
                LoopEvent::Fetched(RemoteCommand::None),
            ]
        );
    }

    #[test]
    fn cycle_lock_is_unsupported_but_unlock_is_sent() {
        let mut harness = Harness::with_kind(
            LoopConfig::default(),
            DeviceKind::Cycle,
            &[RemoteCommand::Lock, RemoteCommand::Unlock],
            FakeSession::ready(),
        );
        harness.run_cycle();
        harness.run_cycle();

        assert_eq!(harness.session.locks(), 0);
        assert_eq!(harness.session.unlocks(), 1);
        assert!(harness
            .events()
            .contains(&LoopEvent::CommandUnsupported(LockAction::Lock)));
        assert_eq!(harness.session.count(&Call::Disconnect), 2);
    }

    #[test]
    fn bot_takes_both_commands() {
        let mut harness = Harness::with_kind(
            LoopConfig::default(),
            DeviceKind::Bot,
            &[RemoteCommand::Lock, RemoteCommand::Unlock],
            FakeSession::ready(),
        );
        harness.run_cycle();
        harness.run_cycle();

        assert_eq!(
            harness.session.calls,
            vec![
                Call::Connect(3),
                Call::IsActive,
                Call::IsActive,
                Call::Lock("lock:remote".to_string()),
                Call::Disconnect,
                Call::Connect(3),
                Call::IsActive,
                Call::IsActive,
                Call::Unlock("unlock:remote".to_string()),
                Call::Disconnect,
            ]
        );
    }

    #[test]
    fn session_dropped_before_command_is_a_failed_cycle() {
        struct FlakySession {
            inner: FakeSession,
            polls: u32,
        }

        impl DeviceSession for FlakySession {
            fn connect(&mut self, max_attempts: u32) -> bool {
                self.inner.connect(max_attempts)
            }
            fn is_session_active(&mut self) -> bool {
                self.polls += 1;
                self.polls == 1
            }
            fn lock(&mut self, tag: &HistoryTag) -> bool {
                self.inner.lock(tag)
            }
            fn unlock(&mut self, tag: &HistoryTag) -> bool {
                self.inner.unlock(tag)
            }
            fn disconnect(&mut self) {
                self.inner.disconnect();
            }
            fn state(&self) -> SessionState {
                self.inner.state()
            }
        }

        let (_notifier, inbox) = status_channel();
        let mut engine = ReconciliationLoop::new(LoopConfig::default(), DeviceKind::Latch, inbox);
        let mut source = ScriptedSource::new(&[RemoteCommand::Lock]);
        let mut session = FlakySession {
            inner: FakeSession::ready(),
            polls: 0,
        };
        let mut reporter = RecordingReporter::default();

        let mut events = Vec::new();
        for now_ms in 0..5 {
            events.extend(engine.tick(now_ms, &mut source, &mut session, &mut reporter).events);
        }

        assert!(events.contains(&LoopEvent::SessionLost));
        assert_eq!(session.inner.locks(), 0);
        assert_eq!(session.inner.count(&Call::Disconnect), 1);
        assert_eq!(engine.consecutive_failures(), 1);
        assert_eq!(engine.state(), LoopState::Idle);
    }

    #[test]
    fn failure_events_are_classified() {
        assert!(LoopEvent::ConnectFailed { attempts: 3 }.is_failure());
        assert!(LoopEvent::Escalated { failures: 3 }.is_failure());
        assert!(!LoopEvent::Fetched(RemoteCommand::FetchFailed).is_failure());
        assert!(!LoopEvent::CommandSent(DeviceCommand::Lock).is_failure());
        assert_eq!(
            LoopEvent::SessionTimedOut { polls: 3 }.to_string(),
            "session not active after 3 polls; skipping command"
        );
    }
}
