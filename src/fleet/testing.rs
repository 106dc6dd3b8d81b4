//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::mpsc;

use crate::fleet::clock::Clock;
use crate::fleet::error::FleetError;
use crate::fleet::hosts::{Credentials, Host};
use crate::fleet::parsers::CommandRunner;
use crate::fleet::registry::{PtySize, RemoteSessions, ShellChannel, ShellCommand};
use crate::fleet::types::{CommandOutput, SessionInfo, Timestamp};

/// Clock whose time only moves when told to.
pub(crate) struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, now: Timestamp) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

/// Milliseconds of tokio time since construction; follows paused test time.
pub(crate) struct TokioClock(tokio::time::Instant);

impl TokioClock {
    pub fn new() -> Self {
        Self(tokio::time::Instant::now())
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> Timestamp {
        self.0.elapsed().as_millis() as Timestamp
    }
}

/// [`CommandRunner`] answering from a fixed script.
///
/// Unscripted commands exit 127 with empty stdout.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    responses: HashMap<String, Result<CommandOutput, FleetError>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, command: &str, output: CommandOutput) -> Self {
        self.responses.insert(command.to_string(), Ok(output));
        self
    }

    pub fn with_error(mut self, command: &str, error: FleetError) -> Self {
        self.responses.insert(command.to_string(), Err(error));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, FleetError> {
        self.log.lock().unwrap().push(command.to_string());
        tokio::task::yield_now().await;
        self.responses
            .get(command)
            .cloned()
            .unwrap_or_else(|| Ok(CommandOutput::new("", "command not found", 127)))
    }
}

enum Matcher {
    Exact(String),
    Prefix(String),
}

impl Matcher {
    fn matches(&self, command: &str) -> bool {
        match self {
            Matcher::Exact(expected) => command == expected,
            Matcher::Prefix(prefix) => command.starts_with(prefix.as_str()),
        }
    }
}

/// Remote end of a shell opened through [`ScriptedRegistry`].
pub(crate) struct RemoteShell {
    pub host_id: String,
    pub size: PtySize,
    pub commands: mpsc::Receiver<ShellCommand>,
    pub output: mpsc::Sender<Vec<u8>>,
}

/// In-memory [`RemoteSessions`] with scripted command results.
///
/// Unscripted commands succeed with empty output. Rules are checked newest
/// first so a test can override an earlier answer.
#[derive(Default)]
pub(crate) struct ScriptedRegistry {
    connected: DashSet<String>,
    connect_failures: Mutex<HashMap<String, FleetError>>,
    rules: Mutex<Vec<(Matcher, Result<CommandOutput, FleetError>)>>,
    executed: Mutex<Vec<(String, String)>>,
    connect_calls: AtomicUsize,
    exec_delay: Mutex<Option<Duration>>,
    shells: Mutex<Vec<RemoteShell>>,
}

impl ScriptedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self, host_id: &str) {
        self.connected.insert(host_id.to_string());
    }

    /// Simulate the transport dropping the session.
    pub fn drop_connection(&self, host_id: &str) {
        self.connected.remove(host_id);
    }

    pub fn fail_connect(&self, host_id: &str, error: FleetError) {
        self.connect_failures
            .lock()
            .unwrap()
            .insert(host_id.to_string(), error);
    }

    pub fn allow_connect(&self, host_id: &str) {
        self.connect_failures.lock().unwrap().remove(host_id);
    }

    pub fn respond(&self, command: &str, output: CommandOutput) {
        self.push_rule(Matcher::Exact(command.to_string()), Ok(output));
    }

    pub fn respond_prefix(&self, prefix: &str, output: CommandOutput) {
        self.push_rule(Matcher::Prefix(prefix.to_string()), Ok(output));
    }

    pub fn fail(&self, command: &str, error: FleetError) {
        self.push_rule(Matcher::Exact(command.to_string()), Err(error));
    }

    pub fn fail_prefix(&self, prefix: &str, error: FleetError) {
        self.push_rule(Matcher::Prefix(prefix.to_string()), Err(error));
    }

    fn push_rule(&self, matcher: Matcher, result: Result<CommandOutput, FleetError>) {
        self.rules.lock().unwrap().push((matcher, result));
    }

    /// Make every command take `delay` of (tokio) time.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = Some(delay);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn executed_count(&self, command: &str) -> usize {
        self.executed()
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Take the remote end of the oldest shell not yet taken.
    pub fn take_shell(&self) -> Option<RemoteShell> {
        let mut shells = self.shells.lock().unwrap();
        (!shells.is_empty()).then(|| shells.remove(0))
    }
}

#[async_trait]
impl RemoteSessions for ScriptedRegistry {
    async fn connect(
        &self,
        host: &Host,
        _credentials: Option<Credentials>,
    ) -> Result<SessionInfo, FleetError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let failure = self.connect_failures.lock().unwrap().get(&host.id).cloned();
        if let Some(error) = failure {
            return Err(error);
        }
        let reused = !self.connected.insert(host.id.clone());
        Ok(SessionInfo {
            host_id: host.id.clone(),
            address: host.address.clone(),
            username: host.username.clone(),
            connected_at: "2024-01-01T00:00:00+00:00".to_string(),
            reused,
        })
    }

    async fn disconnect(&self, host_id: &str) -> bool {
        self.connected.remove(host_id).is_some()
    }

    async fn execute(
        &self,
        host_id: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, FleetError> {
        if !self.connected.contains(host_id) {
            return Err(FleetError::NotConnected(host_id.to_string()));
        }
        self.executed
            .lock()
            .unwrap()
            .push((host_id.to_string(), command.to_string()));

        let delay = *self.exec_delay.lock().unwrap();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let rules = self.rules.lock().unwrap();
        rules
            .iter()
            .rev()
            .find(|(matcher, _)| matcher.matches(command))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }

    fn is_connected(&self, host_id: &str) -> bool {
        self.connected.contains(host_id)
    }

    async fn is_alive(&self, host_id: &str) -> bool {
        self.connected.contains(host_id)
    }

    async fn open_shell(&self, host_id: &str, size: PtySize) -> Result<ShellChannel, FleetError> {
        if !self.connected.contains(host_id) {
            return Err(FleetError::NotConnected(host_id.to_string()));
        }
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::channel(16);
        self.shells.lock().unwrap().push(RemoteShell {
            host_id: host_id.to_string(),
            size,
            commands: input_rx,
            output: output_tx,
        });
        Ok(ShellChannel {
            input: input_tx,
            output: output_rx,
        })
    }
}
