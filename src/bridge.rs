//! One spawned OS process behind a uniform handle.
//!
//! [`spawn`] returns a [`ProcessBridge`] handle plus [`BridgeEvents`]: a data
//! stream of decoded output chunks and a one-shot exit notification. Both can
//! be dropped independently; the reader tasks stop on their own when nobody
//! listens and the child is killed when the handle goes away.
//!
//! Two backends:
//!
//! - **pty**: the child runs on a pseudo-terminal. Output is one combined
//!   stream. Reading, writing and waiting happen on the blocking pool since
//!   portable-pty only offers blocking handles.
//! - **pipe**: the child runs with piped stdio under tokio. stdout and
//!   stderr stay separate. Resize is not supported.
//!
//! On unix every child leads its own process group (portable-pty calls
//! `setsid()`, the pipe backend sets `process_group(0)`), so signals go to
//! `-pid` and reach anything the command forked.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portable_pty::ChildKiller;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::encoding::{PlatformHint, StreamDecoder};
use crate::pty::{Pty, PtyCommand, PtyError};

/// Grace period between a polite signal and SIGKILL.
pub const KILL_ESCALATION: Duration = Duration::from_secs(3);

const DATA_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 64;
const READ_BUF: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("process input is closed")]
    InputClosed,

    #[error("process is not reading its input")]
    InputFull,

    #[error("{0} is not supported for pipe processes")]
    NotSupported(&'static str),

    #[error("failed to signal process: {0}")]
    Signal(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Pty,
    Pipe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    /// Combined output of a pseudo-terminal.
    Pty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Interrupt,
    Hangup,
    Terminate,
    Kill,
}

impl KillSignal {
    pub fn name(self) -> &'static str {
        match self {
            KillSignal::Interrupt => "SIGINT",
            KillSignal::Hangup => "SIGHUP",
            KillSignal::Terminate => "SIGTERM",
            KillSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            KillSignal::Interrupt => libc::SIGINT,
            KillSignal::Hangup => libc::SIGHUP,
            KillSignal::Terminate => libc::SIGTERM,
            KillSignal::Kill => libc::SIGKILL,
        }
    }
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub mode: Mode,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
    /// What the client asked for, for listings and logs.
    pub command: String,
    pub persistent: bool,
}

impl SpawnSpec {
    /// A long-lived interactive shell on a pty.
    pub fn shell(shell: &str) -> Self {
        Self {
            mode: Mode::Pty,
            program: shell.to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            rows: 24,
            cols: 80,
            command: shell.to_string(),
            persistent: true,
        }
    }

    /// A single command line run through the platform shell.
    pub fn one_shot(mode: Mode, command_line: &str) -> Self {
        let (program, args) = platform_shell_invocation(command_line);
        Self {
            mode,
            program,
            args,
            cwd: None,
            env: HashMap::new(),
            rows: 24,
            cols: 80,
            command: command_line.to_string(),
            persistent: false,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[cfg(unix)]
fn platform_shell_invocation(command_line: &str) -> (String, Vec<String>) {
    ("/bin/sh".to_string(), vec!["-c".to_string(), command_line.to_string()])
}

#[cfg(windows)]
fn platform_shell_invocation(command_line: &str) -> (String, Vec<String>) {
    (
        "cmd.exe".to_string(),
        vec![
            "/c".to_string(),
            format!("chcp 65001 >nul 2>&1 && {command_line}"),
        ],
    )
}

/// Event side of a bridge.
pub struct BridgeEvents {
    /// Closed once every output stream has hit EOF.
    pub data: mpsc::Receiver<OutputChunk>,
    /// Resolves once when the child exits.
    pub exit: oneshot::Receiver<ExitInfo>,
}

/// Handle to one running (or exited) process.
pub struct ProcessBridge {
    mode: Mode,
    pid: Option<u32>,
    command: String,
    persistent: bool,
    started_at: DateTime<Utc>,
    input_tx: mpsc::Sender<Bytes>,
    pty: Option<Arc<Mutex<Pty>>>,
    /// Set by the exit waiter. Checked before signaling so a recycled PID is
    /// never hit.
    exited: Arc<AtomicBool>,
    /// Last signal this handle delivered. portable-pty reports a signaled
    /// child as exit code 1, so the pty exit monitor reads this instead.
    last_signal: Arc<Mutex<Option<KillSignal>>>,
    /// Fallback termination when there is no process group to signal.
    cancel: CancellationToken,
    killer: Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>,
}

impl std::fmt::Debug for ProcessBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBridge")
            .field("mode", &self.mode)
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        if !self.has_exited() {
            let _ = self.kill(KillSignal::Kill);
        }
    }
}

impl ProcessBridge {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Queue bytes for the child's input. Writes are applied in call order by
    /// a single writer task. Never waits: a child that stopped reading fills
    /// the queue and further writes fail with [`BridgeError::InputFull`].
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), BridgeError> {
        self.input_tx.try_send(data.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::InputFull,
            mpsc::error::TrySendError::Closed(_) => BridgeError::InputClosed,
        })
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        match &self.pty {
            Some(pty) => Ok(pty.lock().resize(rows, cols)?),
            None => Err(BridgeError::NotSupported("resize")),
        }
    }

    /// Signal the child's process group. Succeeds without doing anything when
    /// the child is already gone.
    pub fn kill(&self, signal: KillSignal) -> Result<(), BridgeError> {
        if self.has_exited() {
            tracing::debug!(pid = ?self.pid, "process already exited, skipping signal");
            return Ok(());
        }

        // Recorded before delivery so the exit monitor can never see the
        // death without the cause.
        let previous = self.last_signal.lock().replace(signal);

        #[cfg(unix)]
        if let Some(pid) = self.pid.filter(|&p| p != 0 && p <= i32::MAX as u32) {
            // SAFETY: plain syscall; negative pid targets the child's group.
            let rc = unsafe { libc::kill(-(pid as i32), signal.as_raw()) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            *self.last_signal.lock() = previous;
            return Err(BridgeError::Signal(err));
        }

        if signal == KillSignal::Interrupt {
            *self.last_signal.lock() = previous;
            return Err(BridgeError::NotSupported("interrupt"));
        }
        self.cancel.cancel();
        if let Some(killer) = self.killer.lock().as_mut() {
            killer.kill().map_err(BridgeError::Signal)?;
        }
        Ok(())
    }

    /// Ask politely (SIGHUP for terminals, SIGTERM for pipes) and escalate to
    /// SIGKILL if the child is still alive after [`KILL_ESCALATION`].
    pub fn terminate(self: &Arc<Self>) {
        let polite = match self.mode {
            Mode::Pty => KillSignal::Hangup,
            Mode::Pipe => KillSignal::Terminate,
        };
        if let Err(e) = self.kill(polite) {
            tracing::warn!(pid = ?self.pid, "failed to signal process: {e}");
        }
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_ESCALATION).await;
            if !bridge.has_exited() {
                tracing::debug!(pid = ?bridge.pid, "process ignored polite signal, sending SIGKILL");
                if let Err(e) = bridge.kill(KillSignal::Kill) {
                    tracing::warn!(pid = ?bridge.pid, "failed to kill process: {e}");
                }
            }
        });
    }
}

/// Start a process according to `spec`.
pub async fn spawn(spec: SpawnSpec) -> Result<(Arc<ProcessBridge>, BridgeEvents), BridgeError> {
    match spec.mode {
        Mode::Pty => spawn_pty(spec).await,
        Mode::Pipe => spawn_pipe(spec),
    }
}

async fn spawn_pty(spec: SpawnSpec) -> Result<(Arc<ProcessBridge>, BridgeEvents), BridgeError> {
    let command = PtyCommand {
        program: spec.program.clone(),
        args: spec.args.clone(),
        cwd: spec.cwd.clone(),
        env: spec.env.clone(),
        rows: spec.rows,
        cols: spec.cols,
    };
    let mut pty = tokio::task::spawn_blocking(move || Pty::spawn(&command))
        .await
        .map_err(|e| BridgeError::Spawn(std::io::Error::other(e)))??;

    let reader = pty.take_reader()?;
    let writer = pty.take_writer()?;
    let child = pty.take_child();
    let pid = child.as_ref().and_then(|c| c.process_id());
    let killer = child.as_ref().map(|c| c.clone_killer());

    let (data_tx, data_rx) = mpsc::channel::<OutputChunk>(DATA_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    let exited = Arc::new(AtomicBool::new(false));
    let last_signal = Arc::new(Mutex::new(None::<KillSignal>));

    // Exit monitor
    {
        let exited = Arc::clone(&exited);
        let last_signal = Arc::clone(&last_signal);
        match child {
            Some(mut child) => {
                tokio::task::spawn_blocking(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        match child.wait() {
                            Ok(status) if status.success() => ExitInfo {
                                code: Some(0),
                                signal: None,
                            },
                            Ok(status) => match *last_signal.lock() {
                                Some(signal) => ExitInfo {
                                    code: None,
                                    signal: Some(signal.name().to_string()),
                                },
                                None => ExitInfo {
                                    code: Some(status.exit_code() as i32),
                                    signal: None,
                                },
                            },
                            Err(e) => {
                                tracing::error!(?e, "error waiting for pty child");
                                ExitInfo::default()
                            }
                        }
                    }));
                    let info = result.unwrap_or_else(|e| {
                        tracing::error!("pty exit monitor panicked: {:?}", e);
                        ExitInfo::default()
                    });
                    exited.store(true, Ordering::Release);
                    let _ = exit_tx.send(info);
                });
            }
            None => {
                exited.store(true, Ordering::Release);
                let _ = exit_tx.send(ExitInfo::default());
            }
        }
    }

    // Reader: blocking reads, decoded in order, backpressure through the
    // bounded channel.
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            use std::io::Read;
            let mut reader = reader;
            let mut decoder = StreamDecoder::new(PlatformHint::Pty);
            let mut buf = [0u8; READ_BUF];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let text = decoder.push(&buf[..n]);
                        if text.is_empty() {
                            continue;
                        }
                        let chunk = OutputChunk { stream: Stream::Pty, text };
                        if data_tx.blocking_send(chunk).is_err() {
                            return;
                        }
                    }
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                let _ = data_tx.blocking_send(OutputChunk { stream: Stream::Pty, text: tail });
            }
        }));
        if let Err(e) = result {
            tracing::error!("pty reader task panicked: {:?}", e);
        }
    });

    // Writer
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            use std::io::Write;
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }));
        if let Err(e) = result {
            tracing::error!("pty writer task panicked: {:?}", e);
        }
    });

    tracing::debug!(pid = ?pid, command = %spec.command, persistent = spec.persistent, "spawned pty process");

    let bridge = ProcessBridge {
        mode: Mode::Pty,
        pid,
        command: spec.command,
        persistent: spec.persistent,
        started_at: Utc::now(),
        input_tx,
        pty: Some(Arc::new(Mutex::new(pty))),
        exited,
        last_signal,
        cancel: CancellationToken::new(),
        killer: Mutex::new(killer),
    };
    Ok((Arc::new(bridge), BridgeEvents { data: data_rx, exit: exit_rx }))
}

fn spawn_pipe(spec: SpawnSpec) -> Result<(Arc<ProcessBridge>, BridgeEvents), BridgeError> {
    use std::process::Stdio;

    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref dir) = spec.cwd {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(BridgeError::Spawn)?;
    let pid = child.id();

    let (data_tx, data_rx) = mpsc::channel::<OutputChunk>(DATA_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    let exited = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_pipe(stdout, Stream::Stdout, data_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_pipe(stderr, Stream::Stderr, data_tx));
    }

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });
    }

    {
        let exited = Arc::clone(&exited);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => exit_info(status),
                Err(e) => {
                    tracing::error!(?e, "error waiting for pipe child");
                    ExitInfo::default()
                }
            };
            exited.store(true, Ordering::Release);
            let _ = exit_tx.send(info);
        });
    }

    tracing::debug!(pid = ?pid, command = %spec.command, "spawned pipe process");

    let bridge = ProcessBridge {
        mode: Mode::Pipe,
        pid,
        command: spec.command,
        persistent: spec.persistent,
        started_at: Utc::now(),
        input_tx,
        pty: None,
        exited,
        last_signal: Arc::new(Mutex::new(None)),
        cancel,
        killer: Mutex::new(None),
    };
    Ok((Arc::new(bridge), BridgeEvents { data: data_rx, exit: exit_rx }))
}

async fn pump_pipe<R: AsyncRead + Unpin>(mut reader: R, stream: Stream, tx: mpsc::Sender<OutputChunk>) {
    let mut decoder = StreamDecoder::new(PlatformHint::native_pipe());
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                if tx.send(OutputChunk { stream, text }).await.is_err() {
                    return;
                }
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = tx.send(OutputChunk { stream, text: tail }).await;
    }
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitInfo {
            code: status.code(),
            signal: status.signal().map(signal_name),
        }
    }
    #[cfg(not(unix))]
    {
        ExitInfo {
            code: status.code(),
            signal: None,
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect(events: &mut BridgeEvents) -> Vec<OutputChunk> {
        let mut chunks = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(5), events.data.recv()).await
        {
            chunks.push(chunk);
        }
        chunks
    }

    fn text_of(chunks: &[OutputChunk], stream: Stream) -> String {
        chunks
            .iter()
            .filter(|c| c.stream == stream)
            .map(|c| c.text.as_str())
            .collect()
    }

    #[tokio::test]
    async fn pipe_separates_streams() {
        let spec = SpawnSpec::one_shot(Mode::Pipe, "echo out; echo err 1>&2");
        let (bridge, mut events) = spawn(spec).await.unwrap();
        assert_eq!(bridge.mode(), Mode::Pipe);
        assert!(bridge.pid().is_some());

        let chunks = collect(&mut events).await;
        assert_eq!(text_of(&chunks, Stream::Stdout), "out\n");
        assert_eq!(text_of(&chunks, Stream::Stderr), "err\n");

        let exit = events.exit.await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(bridge.has_exited());
    }

    #[tokio::test]
    async fn pipe_reports_exit_code() {
        let (_bridge, mut events) = spawn(SpawnSpec::one_shot(Mode::Pipe, "exit 3")).await.unwrap();
        let _ = collect(&mut events).await;
        assert_eq!(events.exit.await.unwrap().code, Some(3));
    }

    #[tokio::test]
    async fn pipe_accepts_input() {
        let (bridge, mut events) =
            spawn(SpawnSpec::one_shot(Mode::Pipe, "read line; echo got:$line")).await.unwrap();
        bridge.write("hello\n").unwrap();
        let chunks = collect(&mut events).await;
        assert_eq!(text_of(&chunks, Stream::Stdout), "got:hello\n");
    }

    #[tokio::test]
    async fn write_to_a_stalled_child_fails_fast() {
        // `sleep` never reads stdin, so the pipe and then the queue fill up.
        let (bridge, _events) = spawn(SpawnSpec::one_shot(Mode::Pipe, "sleep 30")).await.unwrap();
        let chunk = Bytes::from(vec![b'x'; 16 * 1024]);
        let started = std::time::Instant::now();
        let mut refused = None;
        for i in 0..(INPUT_CHANNEL_CAPACITY * 4) {
            if let Err(e) = bridge.write(chunk.clone()) {
                refused = Some((i, e));
                break;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(refused, Some((_, BridgeError::InputFull))), "{refused:?}");
        bridge.kill(KillSignal::Kill).unwrap();
    }

    #[tokio::test]
    async fn pipe_cannot_resize() {
        let (bridge, _events) = spawn(SpawnSpec::one_shot(Mode::Pipe, "true")).await.unwrap();
        assert!(matches!(bridge.resize(100, 40), Err(BridgeError::NotSupported(_))));
    }

    #[tokio::test]
    async fn pipe_cwd_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let spec = SpawnSpec::one_shot(Mode::Pipe, "pwd").cwd(dir.path());
        let (_bridge, mut events) = spawn(spec).await.unwrap();
        let out = text_of(&collect(&mut events).await, Stream::Stdout);
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(out.contains(&name), "pwd printed {out:?}");
    }

    #[tokio::test]
    async fn kill_terminates_process_group() {
        let (bridge, events) = spawn(SpawnSpec::one_shot(Mode::Pipe, "sleep 30")).await.unwrap();
        bridge.kill(KillSignal::Terminate).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), events.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn kill_after_exit_is_ok() {
        let (bridge, mut events) = spawn(SpawnSpec::one_shot(Mode::Pipe, "true")).await.unwrap();
        let _ = collect(&mut events).await;
        events.exit.await.unwrap();
        bridge.kill(KillSignal::Kill).unwrap();
        bridge.kill(KillSignal::Terminate).unwrap();
    }

    #[tokio::test]
    async fn missing_cwd_fails_to_spawn() {
        let spec = SpawnSpec::one_shot(Mode::Pipe, "true").cwd("/definitely/not/here");
        assert!(matches!(spawn(spec).await, Err(BridgeError::Spawn(_))));
    }

    #[tokio::test]
    async fn pty_combines_output_and_resizes() {
        let (bridge, mut events) =
            spawn(SpawnSpec::one_shot(Mode::Pty, "echo to-out; echo to-err 1>&2")).await.unwrap();
        bridge.resize(120, 40).unwrap();
        let chunks = collect(&mut events).await;
        assert!(chunks.iter().all(|c| c.stream == Stream::Pty));
        let text = text_of(&chunks, Stream::Pty);
        assert!(text.contains("to-out"), "{text:?}");
        assert!(text.contains("to-err"), "{text:?}");
        assert_eq!(events.exit.await.unwrap().code, Some(0));
    }

    #[tokio::test]
    async fn pty_kill_reports_the_signal_sent() {
        let (bridge, events) = spawn(SpawnSpec::one_shot(Mode::Pty, "sleep 30")).await.unwrap();
        bridge.kill(KillSignal::Terminate).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), events.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitInfo { code: None, signal: Some("SIGTERM".into()) });
    }

    #[tokio::test]
    async fn pty_failure_without_signal_keeps_its_code() {
        let (_bridge, events) = spawn(SpawnSpec::one_shot(Mode::Pty, "exit 4")).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), events.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitInfo { code: Some(4), signal: None });
    }

    #[tokio::test]
    async fn terminate_reaches_persistent_shell() {
        let spec = SpawnSpec::shell("/bin/sh");
        let (bridge, events) = spawn(spec).await.unwrap();
        assert!(bridge.is_persistent());
        bridge.terminate();
        tokio::time::timeout(Duration::from_secs(10), events.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(bridge.has_exited());
    }
}
