//! Per-connection ownership of every process a client started.
//!
//! A `SessionRegistry` holds three tables:
//!
//! - **terminals**: `terminalId` → [`TerminalSession`] (persistent pty shells)
//! - **transient**: correlation id → one-shot process that is running
//! - **paused**: correlation id → one-shot process blocked on a prompt
//!
//! plus two short-lived lookups that only exist so `kill` can answer sensibly
//! for a while after the fact: commands typed into terminals, and
//! correlation ids whose process already exited. Both are evicted after the
//! retention window.
//!
//! Each spawned process gets exactly one pump task. The pump forwards output
//! to the connection's [`Outbox`] in order and, when the process exits, is the
//! only place that removes it from the tables. `kill` only signals, so a kill
//! racing a natural exit still removes the entry once.
//!
//! The table lock is a `parking_lot::Mutex` and is never held across an
//! `.await`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::auth::ConnectionId;
use crate::bridge::{self, BridgeEvents, ExitInfo, Mode, OutputChunk, ProcessBridge, SpawnSpec, Stream};
use crate::classifier::CommandClassifier;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::pause::{self, PauseDetector, PauseMatch};
use crate::protocol::{Outbox, ServerMessage};
use crate::session::{self, CreateStep, TerminalSession, LINE_TERMINATOR};

/// How long to keep reading output after the exit notification, per chunk.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Ctrl-C as typed into a terminal.
const INTERRUPT: &[u8] = b"\x03";

pub const MAX_DIMENSION: u32 = 1000;

/// Knobs a registry needs from the server configuration.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub shell: String,
    pub default_cwd: PathBuf,
    pub ready_timeout: Duration,
    pub retention: Duration,
}

impl From<&GatewayConfig> for RegistrySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            default_cwd: config.default_cwd.clone(),
            ready_timeout: config.ready_timeout,
            retention: config.retention,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    Persistent,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Paused,
}

/// One entry of a `process_list` reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub command: String,
    pub mode: Mode,
    pub kind: ProcessKind,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// The id is known but its process is gone already.
    AlreadyExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    /// False when the terminal was already running.
    pub created: bool,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub terminals: usize,
    pub transient: usize,
    pub paused: usize,
}

struct TransientProcess {
    bridge: Arc<ProcessBridge>,
    resume: Arc<Notify>,
}

struct PausedProcess {
    process: TransientProcess,
    prompt: String,
    paused_at: DateTime<Utc>,
}

struct CommandRecord {
    terminal_id: String,
}

#[derive(Default)]
struct Tables {
    terminals: HashMap<String, TerminalSession>,
    transient: HashMap<String, TransientProcess>,
    paused: HashMap<String, PausedProcess>,
    commands: HashMap<String, CommandRecord>,
    exited: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum Retained {
    Command,
    Exited,
}

struct Inner {
    conn: ConnectionId,
    settings: RegistrySettings,
    detector: Arc<PauseDetector>,
    classifier: &'static CommandClassifier,
    outbox: Outbox,
    tables: Mutex<Tables>,
    closed: CancellationToken,
}

/// Everything one authenticated connection owns.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("conn", &self.inner.conn)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(
        conn: impl Into<ConnectionId>,
        settings: RegistrySettings,
        detector: Arc<PauseDetector>,
        outbox: Outbox,
    ) -> Self {
        Self::with_classifier(conn, settings, detector, CommandClassifier::standard(), outbox)
    }

    /// Like [`SessionRegistry::new`] with a custom command policy table.
    pub fn with_classifier(
        conn: impl Into<ConnectionId>,
        settings: RegistrySettings,
        detector: Arc<PauseDetector>,
        classifier: &'static CommandClassifier,
        outbox: Outbox,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn: conn.into(),
                settings,
                detector,
                classifier,
                outbox,
                tables: Mutex::new(Tables::default()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.conn
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    pub fn counts(&self) -> RegistryCounts {
        let tables = self.inner.tables.lock();
        RegistryCounts {
            terminals: tables.terminals.values().filter(|s| s.is_ready()).count(),
            transient: tables.transient.len(),
            paused: tables.paused.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistent terminals
    // -----------------------------------------------------------------------

    /// Make sure `terminal_id` has a running shell. Idempotent.
    pub async fn create_terminal(&self, terminal_id: &str) -> Result<CreateOutcome, GatewayError> {
        session::validate_terminal_id(terminal_id)?;
        let (_, created) = self.ensure_terminal(terminal_id).await?;
        let cwd = self
            .inner
            .tables
            .lock()
            .terminals
            .get(terminal_id)
            .map(|s| s.cwd().to_path_buf())
            .unwrap_or_else(|| self.inner.settings.default_cwd.clone());
        Ok(CreateOutcome { created, cwd })
    }

    /// Type `command` into a terminal, creating it first if needed.
    ///
    /// There is no per-command exit in a shell: the command is tracked under
    /// `process_id` only so `kill` can interrupt it during the retention
    /// window. Output arrives as the terminal's `terminal-output`.
    pub async fn execute(
        &self,
        process_id: &str,
        terminal_id: &str,
        command: &str,
    ) -> Result<(), GatewayError> {
        session::validate_terminal_id(terminal_id)?;
        if command.trim().is_empty() {
            return Err(GatewayError::EmptyCommand);
        }

        let (bridge, _) = self.ensure_terminal(terminal_id).await?;

        {
            let mut tables = self.inner.tables.lock();
            if let Some(session) = tables.terminals.get_mut(terminal_id) {
                session.record(command, process_id);
            }
            tables.commands.insert(
                process_id.to_string(),
                CommandRecord {
                    terminal_id: terminal_id.to_string(),
                },
            );
        }

        self.inner
            .outbox
            .send(ServerMessage::process_info(
                format!("executing: {command}"),
                process_id,
                Some(terminal_id),
            ))
            .await;

        if let Err(e) = bridge.write(format!("{command}{LINE_TERMINATOR}")) {
            self.inner.tables.lock().commands.remove(process_id);
            return Err(GatewayError::Io(e));
        }

        tracing::debug!(conn = %self.inner.conn, terminal = terminal_id, process_id, "command written to terminal");
        self.forget_later(process_id.to_string(), Retained::Command);
        Ok(())
    }

    /// Raw keystrokes for a terminal. The terminal must already be running.
    pub fn write_input(&self, terminal_id: &str, input: &str) -> Result<(), GatewayError> {
        session::validate_terminal_id(terminal_id)?;
        let bridge = self
            .terminal_bridge(terminal_id)
            .ok_or_else(|| GatewayError::NotReady(terminal_id.to_string()))?;
        bridge
            .write(Bytes::copy_from_slice(input.as_bytes()))
            .map_err(GatewayError::Io)
    }

    /// Resize a terminal. Returns `false` (and does nothing) when it is not
    /// running.
    pub fn resize(&self, terminal_id: &str, cols: u32, rows: u32) -> Result<bool, GatewayError> {
        session::validate_terminal_id(terminal_id)?;
        if !(1..=MAX_DIMENSION).contains(&cols) || !(1..=MAX_DIMENSION).contains(&rows) {
            return Err(GatewayError::InvalidRequest(format!(
                "cols and rows must be between 1 and {MAX_DIMENSION} (got {cols}x{rows})"
            )));
        }
        match self.terminal_bridge(terminal_id) {
            Some(bridge) => {
                bridge
                    .resize(cols as u16, rows as u16)
                    .map_err(GatewayError::Io)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Kill a terminal's shell and forget the terminal and its history.
    pub fn close_terminal(&self, terminal_id: &str) -> Result<(), GatewayError> {
        session::validate_terminal_id(terminal_id)?;
        let session = {
            let mut tables = self.inner.tables.lock();
            let session = tables.terminals.remove(terminal_id);
            tables.commands.retain(|_, r| r.terminal_id != terminal_id);
            session
        }
        .ok_or_else(|| GatewayError::TerminalNotFound(terminal_id.to_string()))?;

        if let Some(bridge) = session.close() {
            tracing::info!(conn = %self.inner.conn, terminal = terminal_id, pid = ?bridge.pid(), "closing terminal");
            bridge.terminate();
        }
        Ok(())
    }

    fn terminal_bridge(&self, terminal_id: &str) -> Option<Arc<ProcessBridge>> {
        self.inner
            .tables
            .lock()
            .terminals
            .get(terminal_id)
            .and_then(|s| s.bridge())
            .cloned()
    }

    /// Returns the shell and whether this call started it.
    async fn ensure_terminal(&self, terminal_id: &str) -> Result<(Arc<ProcessBridge>, bool), GatewayError> {
        let step = {
            let mut tables = self.inner.tables.lock();
            if self.is_closed() {
                return Err(GatewayError::ConnectionClosed);
            }
            let cwd = &self.inner.settings.default_cwd;
            let session = tables
                .terminals
                .entry(terminal_id.to_string())
                .or_insert_with(|| TerminalSession::new(terminal_id, cwd.clone()));
            let previous = session.last_exit().cloned();
            let step = session.begin_create(&self.inner.settings.shell);
            if let (CreateStep::Spawn { generation, .. }, Some(exit)) = (&step, previous) {
                if *generation > 1 {
                    tracing::info!(conn = %self.inner.conn, terminal = terminal_id, code = ?exit.code, signal = ?exit.signal, "restarting exited terminal");
                }
            }
            step
        };

        match step {
            CreateStep::Ready(bridge) => Ok((bridge, false)),
            CreateStep::Wait(ready) => {
                session::wait_ready(
                    ready,
                    self.inner.settings.ready_timeout,
                    &self.inner.closed,
                    terminal_id,
                )
                .await?;
                self.terminal_bridge(terminal_id)
                    .map(|bridge| (bridge, false))
                    .ok_or_else(|| GatewayError::NotReady(terminal_id.to_string()))
            }
            CreateStep::Spawn { generation, spec } => {
                let bridge = self.spawn_terminal(terminal_id, generation, spec).await?;
                Ok((bridge, true))
            }
        }
    }

    async fn spawn_terminal(
        &self,
        terminal_id: &str,
        generation: u64,
        spec: SpawnSpec,
    ) -> Result<Arc<ProcessBridge>, GatewayError> {
        let (bridge, events) = match bridge::spawn(spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(conn = %self.inner.conn, terminal = terminal_id, "failed to start terminal: {e}");
                if let Some(session) = self.inner.tables.lock().terminals.get_mut(terminal_id) {
                    session.finish_create(generation, Err(e.to_string()));
                }
                return Err(GatewayError::Spawn(e));
            }
        };

        let accepted = self
            .inner
            .tables
            .lock()
            .terminals
            .get_mut(terminal_id)
            .is_some_and(|s| s.finish_create(generation, Ok(Arc::clone(&bridge))));
        if !accepted {
            // Closed (or the connection went away) while the shell was starting.
            bridge.terminate();
            return Err(if self.is_closed() {
                GatewayError::ConnectionClosed
            } else {
                GatewayError::TerminalNotFound(terminal_id.to_string())
            });
        }

        tracing::info!(conn = %self.inner.conn, terminal = terminal_id, pid = ?bridge.pid(), "terminal started");
        tokio::spawn(self.clone().pump_terminal(terminal_id.to_string(), generation, events));
        Ok(bridge)
    }

    async fn pump_terminal(self, terminal_id: String, generation: u64, events: BridgeEvents) {
        let BridgeEvents { mut data, mut exit } = events;
        let render = |chunk: OutputChunk| ServerMessage::TerminalOutput {
            process_id: None,
            terminal_id: Some(terminal_id.clone()),
            data: chunk.text,
        };
        let info = self.forward_until_exit(&mut data, &mut exit, &render).await;

        let current = self
            .inner
            .tables
            .lock()
            .terminals
            .get_mut(&terminal_id)
            .is_some_and(|s| s.mark_exited(generation, info.clone()));
        if current {
            tracing::info!(conn = %self.inner.conn, terminal = %terminal_id, code = ?info.code, "terminal shell exited");
            self.inner
                .outbox
                .send(ServerMessage::TerminalExit {
                    terminal_id,
                    exit_code: info.code,
                    signal: info.signal,
                })
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // One-shot processes
    // -----------------------------------------------------------------------

    /// Run `command` once, outside any terminal.
    ///
    /// Commands that need a terminal device get a private pty (after the
    /// classifier's rewrite); everything else runs on pipes with pause
    /// detection on its output. Returns the mode chosen.
    pub async fn execute_transient(
        &self,
        process_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<Mode, GatewayError> {
        if command.trim().is_empty() {
            return Err(GatewayError::EmptyCommand);
        }
        let cwd = cwd
            .map(PathBuf::from)
            .unwrap_or_else(|| self.inner.settings.default_cwd.clone());
        if !cwd.is_dir() {
            return Err(GatewayError::InvalidWorkingDirectory(cwd.display().to_string()));
        }
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }

        let classification = self.inner.classifier.classify(command);
        let mode = if classification.needs_pty { Mode::Pty } else { Mode::Pipe };
        let command_line = if classification.was_rewritten(command) {
            tracing::debug!(process_id, original = command, rewritten = %classification.rewritten, "rewrote interactive command");
            classification.rewritten.as_str()
        } else {
            command
        };

        self.inner
            .outbox
            .send(ServerMessage::process_info(format!("executing: {command}"), process_id, None))
            .await;

        let mut spec = SpawnSpec::one_shot(mode, command_line).cwd(cwd);
        spec.command = command.to_string();
        let (bridge, events) = bridge::spawn(spec).await.map_err(GatewayError::Spawn)?;

        let resume = Arc::new(Notify::new());
        let inserted = {
            let mut tables = self.inner.tables.lock();
            if self.is_closed() {
                false
            } else {
                tables.transient.insert(
                    process_id.to_string(),
                    TransientProcess {
                        bridge: Arc::clone(&bridge),
                        resume: Arc::clone(&resume),
                    },
                );
                true
            }
        };
        if !inserted {
            bridge.terminate();
            return Err(GatewayError::ConnectionClosed);
        }

        tracing::info!(conn = %self.inner.conn, process_id, pid = ?bridge.pid(), ?mode, "process started");
        tokio::spawn(self.clone().pump_transient(process_id.to_string(), bridge, events, resume));
        Ok(mode)
    }

    async fn pump_transient(
        self,
        process_id: String,
        bridge: Arc<ProcessBridge>,
        events: BridgeEvents,
        resume: Arc<Notify>,
    ) {
        let BridgeEvents { mut data, mut exit } = events;
        let detect_pauses = bridge.mode() == Mode::Pipe;
        let render = |chunk: OutputChunk| render_transient(&process_id, chunk);
        let mut data_open = true;

        let info = loop {
            tokio::select! {
                chunk = data.recv(), if data_open => {
                    let Some(chunk) = chunk else {
                        data_open = false;
                        continue;
                    };
                    if detect_pauses {
                        if let Some(found) = self.inner.detector.detect(&chunk.text) {
                            if self.pause(&process_id, found, chunk.text.clone()).await {
                                // Nothing more is read (so nothing is emitted)
                                // until a response arrives or the process dies.
                                tokio::select! {
                                    _ = resume.notified() => continue,
                                    info = &mut exit => break info.unwrap_or_default(),
                                }
                            }
                        }
                    }
                    self.inner.outbox.send(render(chunk)).await;
                }
                info = &mut exit => break info.unwrap_or_default(),
            }
        };

        if data_open {
            self.drain(&mut data, &render).await;
        }
        self.finish_transient(&process_id, info).await;
    }

    /// Move a running process to the paused table and tell the client.
    async fn pause(&self, process_id: &str, found: PauseMatch, chunk: String) -> bool {
        {
            let mut tables = self.inner.tables.lock();
            let Some(process) = tables.transient.remove(process_id) else {
                return false;
            };
            tables.paused.insert(
                process_id.to_string(),
                PausedProcess {
                    process,
                    prompt: found.prompt.clone(),
                    paused_at: Utc::now(),
                },
            );
        }
        tracing::info!(conn = %self.inner.conn, process_id, rule = found.rule, "process paused on prompt");
        self.inner
            .outbox
            .send(ServerMessage::PauseDetected {
                process_id: process_id.to_string(),
                prompt: found.prompt,
                data: chunk,
                rule: found.rule.to_string(),
                confidence: found.confidence,
            })
            .await;
        true
    }

    /// The single removal point for one-shot processes.
    async fn finish_transient(&self, process_id: &str, info: ExitInfo) {
        let removed = {
            let mut tables = self.inner.tables.lock();
            let removed = tables
                .transient
                .remove(process_id)
                .map(|p| p.bridge)
                .or_else(|| tables.paused.remove(process_id).map(|p| p.process.bridge));
            if removed.is_some() {
                tables.exited.insert(process_id.to_string(), Utc::now());
            }
            removed
        };
        let Some(bridge) = removed else {
            return;
        };

        tracing::info!(conn = %self.inner.conn, process_id, pid = ?bridge.pid(), code = ?info.code, signal = ?info.signal, "process exited");
        self.inner
            .outbox
            .send(ServerMessage::Close {
                process_id: process_id.to_string(),
                exit_code: info.code,
                message: describe_exit(&info),
                signal: info.signal,
            })
            .await;
        self.forget_later(process_id.to_string(), Retained::Exited);
    }

    /// Answer a paused process's prompt and let its output flow again.
    pub async fn resume_paused(&self, process_id: &str, response: &str) -> Result<(), GatewayError> {
        let (bridge, resume) = {
            let mut tables = self.inner.tables.lock();
            let paused = tables
                .paused
                .remove(process_id)
                .ok_or_else(|| GatewayError::NotPaused(process_id.to_string()))?;
            tracing::debug!(process_id, prompt = %paused.prompt, since = %paused.paused_at, "resuming paused process");
            let bridge = Arc::clone(&paused.process.bridge);
            let resume = Arc::clone(&paused.process.resume);
            tables.transient.insert(process_id.to_string(), paused.process);
            (bridge, resume)
        };

        let input = pause::response_input(response);
        let written = bridge.write(input);
        if written.is_ok() {
            self.inner
                .outbox
                .send(ServerMessage::PauseResumed {
                    process_id: process_id.to_string(),
                    response: response.to_string(),
                })
                .await;
        }
        resume.notify_one();
        written.map_err(GatewayError::Io)
    }

    // -----------------------------------------------------------------------
    // Shared
    // -----------------------------------------------------------------------

    /// Terminate whatever `process_id` names.
    ///
    /// One-shot processes (running or paused) get SIGTERM, then SIGKILL. A
    /// command typed into a terminal (or the terminal id itself) gets Ctrl-C
    /// so the shell survives. Ids of processes that already exited succeed
    /// with [`KillOutcome::AlreadyExited`] while they are retained.
    pub fn kill(&self, process_id: &str) -> Result<KillOutcome, GatewayError> {
        enum Target {
            Process(Arc<ProcessBridge>),
            Interrupt(Arc<ProcessBridge>),
            Gone,
        }

        let target = {
            let tables = self.inner.tables.lock();
            let terminal_shell = |terminal_id: &str| {
                tables
                    .terminals
                    .get(terminal_id)
                    .and_then(|s| s.bridge())
                    .cloned()
                    .map_or(Target::Gone, Target::Interrupt)
            };
            if let Some(p) = tables.transient.get(process_id) {
                Target::Process(Arc::clone(&p.bridge))
            } else if let Some(p) = tables.paused.get(process_id) {
                Target::Process(Arc::clone(&p.process.bridge))
            } else if let Some(record) = tables.commands.get(process_id) {
                terminal_shell(&record.terminal_id)
            } else if tables.terminals.contains_key(process_id) {
                terminal_shell(process_id)
            } else if tables.exited.contains_key(process_id) {
                Target::Gone
            } else {
                return Err(GatewayError::ProcessNotFound(process_id.to_string()));
            }
        };

        match target {
            Target::Process(bridge) => {
                tracing::info!(conn = %self.inner.conn, process_id, pid = ?bridge.pid(), "killing process");
                bridge.terminate();
                Ok(KillOutcome::Killed)
            }
            Target::Interrupt(bridge) => {
                tracing::info!(conn = %self.inner.conn, process_id, "interrupting terminal command");
                bridge
                    .write(Bytes::from_static(INTERRUPT))
                    .map_err(GatewayError::Io)?;
                Ok(KillOutcome::Killed)
            }
            Target::Gone => Ok(KillOutcome::AlreadyExited),
        }
    }

    /// Everything this connection currently owns, oldest first.
    pub fn list_owned(&self) -> Vec<ProcessInfo> {
        let tables = self.inner.tables.lock();
        let transient = |id: &String, bridge: &ProcessBridge, status| ProcessInfo {
            id: id.clone(),
            command: bridge.command().to_string(),
            mode: bridge.mode(),
            kind: ProcessKind::Transient,
            pid: bridge.pid(),
            terminal_id: None,
            start_time: bridge.started_at(),
            status,
        };

        let mut list: Vec<ProcessInfo> = tables
            .terminals
            .iter()
            .filter_map(|(id, session)| {
                let bridge = session.bridge()?;
                Some(ProcessInfo {
                    id: id.clone(),
                    command: bridge.command().to_string(),
                    mode: bridge.mode(),
                    kind: ProcessKind::Persistent,
                    pid: bridge.pid(),
                    terminal_id: Some(id.clone()),
                    start_time: bridge.started_at(),
                    status: ProcessStatus::Running,
                })
            })
            .chain(
                tables
                    .transient
                    .iter()
                    .map(|(id, p)| transient(id, p.bridge.as_ref(), ProcessStatus::Running)),
            )
            .chain(
                tables
                    .paused
                    .iter()
                    .map(|(id, p)| transient(id, p.process.bridge.as_ref(), ProcessStatus::Paused)),
            )
            .collect();
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Kill every process this connection owns and empty all tables.
    /// Returns how many processes were signaled.
    pub fn teardown(&self) -> usize {
        self.inner.closed.cancel();
        let tables = std::mem::take(&mut *self.inner.tables.lock());

        let bridges: Vec<Arc<ProcessBridge>> = tables
            .terminals
            .into_values()
            .filter_map(TerminalSession::close)
            .chain(tables.transient.into_values().map(|p| p.bridge))
            .chain(tables.paused.into_values().map(|p| p.process.bridge))
            .collect();

        for bridge in &bridges {
            bridge.terminate();
        }
        tracing::info!(conn = %self.inner.conn, processes = bridges.len(), "connection processes torn down");
        bridges.len()
    }

    async fn forward_until_exit(
        &self,
        data: &mut mpsc::Receiver<OutputChunk>,
        exit: &mut oneshot::Receiver<ExitInfo>,
        render: &impl Fn(OutputChunk) -> ServerMessage,
    ) -> ExitInfo {
        let mut data_open = true;
        let info = loop {
            tokio::select! {
                chunk = data.recv(), if data_open => match chunk {
                    Some(chunk) => {
                        self.inner.outbox.send(render(chunk)).await;
                    }
                    None => data_open = false,
                },
                info = &mut *exit => break info.unwrap_or_default(),
            }
        };
        if data_open {
            self.drain(data, render).await;
        }
        info
    }

    /// Output can still be in flight when the exit notification lands.
    async fn drain(
        &self,
        data: &mut mpsc::Receiver<OutputChunk>,
        render: &impl Fn(OutputChunk) -> ServerMessage,
    ) {
        while let Ok(Some(chunk)) = tokio::time::timeout(DRAIN_GRACE, data.recv()).await {
            self.inner.outbox.send(render(chunk)).await;
        }
    }

    fn forget_later(&self, id: String, table: Retained) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let retention = self.inner.settings.retention;
        let closed = self.inner.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(retention) => {}
                _ = closed.cancelled() => return,
            }
            if let Some(inner) = inner.upgrade() {
                let mut tables = inner.tables.lock();
                match table {
                    Retained::Command => tables.commands.remove(&id).is_some(),
                    Retained::Exited => tables.exited.remove(&id).is_some(),
                };
            }
        });
    }
}

fn render_transient(process_id: &str, chunk: OutputChunk) -> ServerMessage {
    let process_id = process_id.to_string();
    match chunk.stream {
        Stream::Stdout => ServerMessage::Stdout {
            process_id,
            data: chunk.text,
        },
        Stream::Stderr => ServerMessage::Stderr {
            process_id,
            data: chunk.text,
        },
        Stream::Pty => ServerMessage::TerminalOutput {
            process_id: Some(process_id),
            terminal_id: None,
            data: chunk.text,
        },
    }
}

fn describe_exit(info: &ExitInfo) -> String {
    match (&info.signal, info.code) {
        (Some(signal), _) => format!("process terminated by {signal}"),
        (None, Some(code)) => format!("process exited with code {code}"),
        (None, None) => "process exited".to_string(),
    }
}
