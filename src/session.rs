//! A named persistent terminal: one pty-backed shell, a working directory and
//! a bounded command history.
//!
//! The session itself is a plain state machine; the registry drives it under
//! its lock and does the spawning and waiting outside of it.
//!
//! ```text
//! absent ──create──▶ creating ──spawned──▶ ready ──shell exits──▶ exited
//!                        │                   ▲                      │
//!                        └──spawn failed─────┼──────▶ exited        │
//!                                            └───────create─────────┘
//! ```

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ExitInfo, ProcessBridge, SpawnSpec};
use crate::error::GatewayError;

/// Oldest entries are dropped past this.
pub const MAX_HISTORY: usize = 500;

pub const DEFAULT_TERMINAL_ID: &str = "default";

#[cfg(windows)]
pub const LINE_TERMINATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_TERMINATOR: &str = "\n";

/// Validate a terminal id. Ids must be 1-64 chars, alphanumeric/hyphens/underscores/dots.
pub fn validate_terminal_id(id: &str) -> Result<(), GatewayError> {
    if id.is_empty() {
        return Err(GatewayError::InvalidTerminalId("terminal id must not be empty".into()));
    }
    if id.chars().count() > 64 {
        return Err(GatewayError::InvalidTerminalId(format!(
            "terminal id too long ({} chars, max 64)",
            id.chars().count()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(GatewayError::InvalidTerminalId(format!(
            "terminal id contains invalid characters: {}",
            id.chars().take(64).collect::<String>()
        )));
    }
    Ok(())
}

/// Published by a creating session; waiters resolve on the first non-pending value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub command: String,
    pub process_id: String,
    pub at: DateTime<Utc>,
}

enum State {
    Creating { ready: watch::Sender<Readiness> },
    Ready { bridge: Arc<ProcessBridge> },
    Exited { exit: ExitInfo },
}

/// What the caller has to do to get a ready terminal.
pub enum CreateStep {
    /// Already running; nothing spawned.
    Ready(Arc<ProcessBridge>),
    /// Someone else is creating it.
    Wait(watch::Receiver<Readiness>),
    /// The caller must spawn `spec` and report back with `generation`.
    Spawn { generation: u64, spec: SpawnSpec },
}

pub struct TerminalSession {
    id: String,
    cwd: PathBuf,
    generation: u64,
    state: State,
    history: VecDeque<HistoryEntry>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("generation", &self.generation)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// A session that has never been started. It counts as exited until the
    /// first [`begin_create`](Self::begin_create).
    pub fn new(id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            cwd: cwd.into(),
            generation: 0,
            state: State::Exited {
                exit: ExitInfo::default(),
            },
            history: VecDeque::new(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    pub fn is_creating(&self) -> bool {
        matches!(self.state, State::Creating { .. })
    }

    /// The live shell, if the session is ready.
    pub fn bridge(&self) -> Option<&Arc<ProcessBridge>> {
        match &self.state {
            State::Ready { bridge } => Some(bridge),
            _ => None,
        }
    }

    pub fn last_exit(&self) -> Option<&ExitInfo> {
        match &self.state {
            State::Exited { exit } => Some(exit),
            _ => None,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    /// Idempotent create: a ready session is returned unchanged, a creating
    /// one hands out a readiness receiver, anything else starts a new
    /// generation and asks the caller to spawn the shell.
    pub fn begin_create(&mut self, shell: &str) -> CreateStep {
        match &self.state {
            State::Ready { bridge } => return CreateStep::Ready(Arc::clone(bridge)),
            State::Creating { ready } => return CreateStep::Wait(ready.subscribe()),
            State::Exited { .. } => {}
        }
        self.generation += 1;
        let (ready, _) = watch::channel(Readiness::Pending);
        self.state = State::Creating { ready };
        CreateStep::Spawn {
            generation: self.generation,
            spec: SpawnSpec::shell(shell).cwd(&self.cwd),
        }
    }

    /// Settle a creation started by [`begin_create`](Self::begin_create).
    ///
    /// Returns `false` when the session moved on in the meantime (closed and
    /// recreated); the caller then owns the stray bridge and must kill it.
    pub fn finish_create(
        &mut self,
        generation: u64,
        result: Result<Arc<ProcessBridge>, String>,
    ) -> bool {
        if generation != self.generation || !self.is_creating() {
            return false;
        }
        let (next, readiness) = match result {
            Ok(bridge) => (State::Ready { bridge }, Readiness::Ready),
            Err(message) => (
                State::Exited {
                    exit: ExitInfo::default(),
                },
                Readiness::Failed(message),
            ),
        };
        if let State::Creating { ready } = std::mem::replace(&mut self.state, next) {
            ready.send_replace(readiness);
        }
        true
    }

    /// The shell of `generation` went away. Stale generations are ignored.
    pub fn mark_exited(&mut self, generation: u64, exit: ExitInfo) -> bool {
        if generation != self.generation || !self.is_ready() {
            return false;
        }
        self.state = State::Exited { exit };
        true
    }

    pub fn record(&mut self, command: &str, process_id: &str) {
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            command: command.to_string(),
            process_id: process_id.to_string(),
            at: Utc::now(),
        });
    }

    /// Tear the session down, handing back the shell (if any) for the caller
    /// to kill. Pending waiters see the creation fail.
    pub fn close(mut self) -> Option<Arc<ProcessBridge>> {
        self.history.clear();
        match std::mem::replace(
            &mut self.state,
            State::Exited {
                exit: ExitInfo::default(),
            },
        ) {
            State::Ready { bridge } => Some(bridge),
            State::Creating { ready } => {
                ready.send_replace(Readiness::Failed("terminal closed".into()));
                None
            }
            State::Exited { .. } => None,
        }
    }
}

/// Wait for a creating terminal, bounded by `timeout` and cut short by
/// `cancel`.
pub async fn wait_ready(
    mut ready: watch::Receiver<Readiness>,
    timeout: Duration,
    cancel: &CancellationToken,
    terminal_id: &str,
) -> Result<(), GatewayError> {
    let waited = tokio::select! {
        res = tokio::time::timeout(timeout, ready.wait_for(|r| *r != Readiness::Pending)) => res,
        _ = cancel.cancelled() => return Err(GatewayError::ConnectionClosed),
    };
    match waited {
        Ok(Ok(readiness)) if *readiness == Readiness::Ready => Ok(()),
        Ok(Ok(readiness)) => {
            tracing::debug!(terminal = terminal_id, readiness = ?*readiness, "terminal creation failed");
            Err(GatewayError::NotReady(terminal_id.to_string()))
        }
        Ok(Err(_)) => Err(GatewayError::NotReady(terminal_id.to_string())),
        Err(_) => {
            tracing::debug!(terminal = terminal_id, ?timeout, "timed out waiting for terminal");
            Err(GatewayError::NotReady(terminal_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(validate_terminal_id("default").is_ok());
        assert!(validate_terminal_id("t1").is_ok());
        assert!(validate_terminal_id("my-term_2.log").is_ok());
        assert!(validate_terminal_id(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn invalid_ids() {
        assert!(validate_terminal_id("").is_err());
        assert!(validate_terminal_id(&"a".repeat(65)).is_err());
        assert!(validate_terminal_id("has space").is_err());
        assert!(validate_terminal_id("../etc").is_err());
        assert!(validate_terminal_id("semi;colon").is_err());
    }

    #[test]
    fn first_create_asks_for_spawn() {
        let mut session = TerminalSession::new("t1", "/tmp");
        assert!(!session.is_ready());
        match session.begin_create("/bin/sh") {
            CreateStep::Spawn { generation, spec } => {
                assert_eq!(generation, 1);
                assert_eq!(spec.program, "/bin/sh");
                assert_eq!(spec.cwd.as_deref(), Some(Path::new("/tmp")));
                assert!(spec.persistent);
            }
            _ => panic!("expected spawn"),
        }
        assert!(session.is_creating());
    }

    #[test]
    fn concurrent_create_waits() {
        let mut session = TerminalSession::new("t1", "/tmp");
        let _ = session.begin_create("/bin/sh");
        assert!(matches!(session.begin_create("/bin/sh"), CreateStep::Wait(_)));
    }

    #[test]
    fn failed_spawn_wakes_waiters() {
        let mut session = TerminalSession::new("t1", "/tmp");
        let CreateStep::Spawn { generation, .. } = session.begin_create("/bin/sh") else {
            panic!("expected spawn");
        };
        let CreateStep::Wait(rx) = session.begin_create("/bin/sh") else {
            panic!("expected wait");
        };
        assert!(session.finish_create(generation, Err("boom".into())));
        assert_eq!(*rx.borrow(), Readiness::Failed("boom".into()));
        assert!(!session.is_ready());
        // a later create starts over
        assert!(matches!(
            session.begin_create("/bin/sh"),
            CreateStep::Spawn { generation: 2, .. }
        ));
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut session = TerminalSession::new("t1", "/tmp");
        let _ = session.begin_create("/bin/sh");
        assert!(!session.finish_create(7, Err("late".into())));
        assert!(session.is_creating());
        assert!(!session.mark_exited(7, ExitInfo::default()));
    }

    #[test]
    fn history_is_bounded() {
        let mut session = TerminalSession::new("t1", "/tmp");
        for i in 0..(MAX_HISTORY + 10) {
            session.record(&format!("echo {i}"), &format!("p{i}"));
        }
        assert_eq!(session.history().count(), MAX_HISTORY);
        assert_eq!(session.history().next().unwrap().command, "echo 10");
    }

    #[test]
    fn close_fails_pending_creation() {
        let mut session = TerminalSession::new("t1", "/tmp");
        let _ = session.begin_create("/bin/sh");
        let CreateStep::Wait(rx) = session.begin_create("/bin/sh") else {
            panic!("expected wait");
        };
        assert!(session.close().is_none());
        assert!(matches!(*rx.borrow(), Readiness::Failed(_)));
    }

    #[tokio::test]
    async fn wait_ready_times_out_as_not_ready() {
        let (_tx, rx) = watch::channel(Readiness::Pending);
        let cancel = CancellationToken::new();
        let err = wait_ready(rx, Duration::from_millis(20), &cancel, "t1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotReady(id) if id == "t1"));
    }

    #[tokio::test]
    async fn wait_ready_resolves_on_ready() {
        let (tx, rx) = watch::channel(Readiness::Pending);
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(Readiness::Ready);
        });
        wait_ready(rx, Duration::from_secs(5), &cancel, "t1").await.unwrap();
    }

    #[tokio::test]
    async fn wait_ready_is_cancellable() {
        let (_tx, rx) = watch::channel(Readiness::Pending);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_ready(rx, Duration::from_secs(5), &cancel, "t1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed));
    }
}
