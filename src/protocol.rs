//! WebSocket message contract.
//!
//! Every frame is a JSON object with a `type` field. Inbound frames are
//! parsed into [`ClientMessage`]; outbound ones are [`ServerMessage`]s
//! wrapped in an [`Envelope`] that stamps an RFC 3339 `timestamp`.
//!
//! Two naming dialects coexist on the wire (`create_terminal` and
//! `create-terminal`, `get_system_info` and `get-server-stats`); they are
//! kept as distinct variants where the reply differs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::registry::ProcessInfo;
use crate::system_info::{ServerStats, SystemInfo};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate { key: String },

    /// With a `terminalId` the command is typed into that terminal; without
    /// one it runs as a one-shot process.
    #[serde(rename = "execute")]
    Execute {
        command: String,
        #[serde(default)]
        terminal_id: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },

    #[serde(rename = "create_terminal")]
    CreateTerminal {
        #[serde(default)]
        terminal_id: Option<String>,
    },

    #[serde(rename = "create-terminal")]
    CreateTerminalDashed {
        #[serde(default)]
        terminal_id: Option<String>,
    },

    #[serde(rename = "close_terminal", alias = "close-terminal")]
    CloseTerminal {
        #[serde(default)]
        terminal_id: Option<String>,
    },

    #[serde(rename = "kill")]
    Kill { process_id: String },

    #[serde(rename = "list")]
    List {},

    #[serde(rename = "pause_response")]
    PauseResponse { process_id: String, response: String },

    #[serde(rename = "get_system_info")]
    GetSystemInfo {},

    #[serde(rename = "get-server-stats")]
    GetServerStats {},

    #[serde(rename = "terminal-input")]
    TerminalInput {
        input: String,
        #[serde(default)]
        terminal_id: Option<String>,
    },

    #[serde(rename = "terminal-resize")]
    TerminalResize {
        cols: u32,
        rows: u32,
        #[serde(default)]
        terminal_id: Option<String>,
    },
}

impl ClientMessage {
    /// Every `type` value this server understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "authenticate",
        "execute",
        "create_terminal",
        "create-terminal",
        "close_terminal",
        "close-terminal",
        "kill",
        "list",
        "pause_response",
        "get_system_info",
        "get-server-stats",
        "terminal-input",
        "terminal-resize",
    ];

    /// Messages allowed before authentication.
    pub fn is_ungated(&self) -> bool {
        matches!(self, ClientMessage::Authenticate { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "authenticate",
            ClientMessage::Execute { .. } => "execute",
            ClientMessage::CreateTerminal { .. } => "create_terminal",
            ClientMessage::CreateTerminalDashed { .. } => "create-terminal",
            ClientMessage::CloseTerminal { .. } => "close_terminal",
            ClientMessage::Kill { .. } => "kill",
            ClientMessage::List {} => "list",
            ClientMessage::PauseResponse { .. } => "pause_response",
            ClientMessage::GetSystemInfo {} => "get_system_info",
            ClientMessage::GetServerStats {} => "get-server-stats",
            ClientMessage::TerminalInput { .. } => "terminal-input",
            ClientMessage::TerminalResize { .. } => "terminal-resize",
        }
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} message: {reason}")]
    InvalidMessage { kind: String, reason: String },
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::InvalidJson(_) => "invalid_json",
            ParseError::UnknownType(_) => "unknown_type",
            ParseError::InvalidMessage { .. } => "invalid_request",
        }
    }
}

/// Parse one text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ParseError::UnknownType("<missing>".to_string()))?;

    if !ClientMessage::KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ParseError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ParseError::InvalidMessage {
        kind,
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "info")]
    Info {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        process_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_required: Option<bool>,
    },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        process_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_id: Option<String>,
    },

    #[serde(rename = "stdout")]
    Stdout { process_id: String, data: String },

    #[serde(rename = "stderr")]
    Stderr { process_id: String, data: String },

    /// Combined pty output. Persistent terminals carry `terminalId`,
    /// one-shot pty processes carry `processId`.
    #[serde(rename = "terminal-output")]
    TerminalOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        process_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        terminal_id: Option<String>,
        data: String,
    },

    #[serde(rename = "close")]
    Close {
        process_id: String,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        message: String,
    },

    #[serde(rename = "terminal-exit")]
    TerminalExit {
        terminal_id: String,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },

    #[serde(rename = "terminal_ready")]
    TerminalReady {
        terminal_id: String,
        created: bool,
        cwd: String,
    },

    #[serde(rename = "terminal-created")]
    TerminalCreated {
        terminal_id: String,
        created: bool,
        cwd: String,
    },

    #[serde(rename = "terminal_closed")]
    TerminalClosed { terminal_id: String },

    #[serde(rename = "process_list")]
    ProcessList { processes: Vec<ProcessInfo> },

    /// Sent in place of the output chunk that held the prompt; `data` is that
    /// whole chunk, `prompt` the line that matched.
    #[serde(rename = "pause_detected")]
    PauseDetected {
        process_id: String,
        prompt: String,
        data: String,
        rule: String,
        confidence: f32,
    },

    #[serde(rename = "pause_resumed")]
    PauseResumed { process_id: String, response: String },

    #[serde(rename = "system_info")]
    SystemInfo(SystemInfo),

    #[serde(rename = "server-stats")]
    ServerStats(ServerStats),

    #[serde(rename = "auth-success")]
    AuthSuccess { message: String },

    #[serde(rename = "auth-failed")]
    AuthFailed {
        message: String,
        attempts_remaining: u32,
    },

    #[serde(rename = "auth-required")]
    AuthRequired { message: String },
}

impl ServerMessage {
    pub fn info(message: impl Into<String>) -> Self {
        ServerMessage::Info {
            message: message.into(),
            process_id: None,
            terminal_id: None,
            connection_id: None,
            auth_required: None,
        }
    }

    pub fn process_info(message: impl Into<String>, process_id: &str, terminal_id: Option<&str>) -> Self {
        ServerMessage::Info {
            message: message.into(),
            process_id: Some(process_id.to_string()),
            terminal_id: terminal_id.map(str::to_string),
            connection_id: None,
            auth_required: None,
        }
    }

    /// Render a failed operation. The unauthenticated case gets its own
    /// message type so clients can prompt for the key.
    pub fn from_error(err: &GatewayError, process_id: Option<&str>, terminal_id: Option<&str>) -> Self {
        match err {
            GatewayError::AuthRequired => ServerMessage::AuthRequired {
                message: err.to_string(),
            },
            _ => ServerMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
                process_id: process_id.map(str::to_string),
                terminal_id: terminal_id.map(str::to_string),
            },
        }
    }

    pub fn from_parse_error(err: &ParseError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            process_id: None,
            terminal_id: None,
        }
    }
}

/// A [`ServerMessage`] as it goes over the wire.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Sending half of a connection's outbound queue.
///
/// Process pumps and the dispatcher share it; messages from one sender are
/// delivered in the order they were queued.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Envelope>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a message, stamping it now. Returns `false` once the
    /// connection's writer is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Envelope::new(message)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_execute_with_and_without_terminal() {
        let msg = parse_client_message(r#"{"type":"execute","command":"ls","terminalId":"t1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Execute {
                command: "ls".into(),
                terminal_id: Some("t1".into()),
                cwd: None
            }
        );

        let msg = parse_client_message(r#"{"type":"execute","command":"ls","terminalId":null}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Execute { terminal_id: None, .. }));
    }

    #[test]
    fn dialects_stay_distinct() {
        assert!(matches!(
            parse_client_message(r#"{"type":"create_terminal"}"#).unwrap(),
            ClientMessage::CreateTerminal { terminal_id: None }
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"create-terminal","terminalId":"x"}"#).unwrap(),
            ClientMessage::CreateTerminalDashed { .. }
        ));
        assert!(matches!(
            parse_client_message(r#"{"type":"close-terminal"}"#).unwrap(),
            ClientMessage::CloseTerminal { .. }
        ));
    }

    #[test]
    fn fieldless_types_ignore_extra_fields() {
        assert_eq!(
            parse_client_message(r#"{"type":"list","extra":1}"#).unwrap(),
            ClientMessage::List {}
        );
    }

    #[test]
    fn parse_errors_are_classified() {
        assert_eq!(parse_client_message("not json").unwrap_err().code(), "invalid_json");
        assert_eq!(
            parse_client_message(r#"{"type":"launch_missiles"}"#).unwrap_err(),
            ParseError::UnknownType("launch_missiles".into())
        );
        assert_eq!(parse_client_message(r#"{"command":"ls"}"#).unwrap_err().code(), "unknown_type");
        assert_eq!(
            parse_client_message(r#"{"type":"kill"}"#).unwrap_err().code(),
            "invalid_request"
        );
    }

    #[test]
    fn outbound_uses_camel_case_and_timestamp() {
        let env = Envelope::new(ServerMessage::Close {
            process_id: "p1".into(),
            exit_code: Some(0),
            signal: None,
            message: "process exited with code 0".into(),
        });
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "close");
        assert_eq!(value["processId"], "p1");
        assert_eq!(value["exitCode"], 0);
        assert!(value.get("signal").is_none());
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn auth_required_has_its_own_type() {
        let msg = ServerMessage::from_error(&GatewayError::AuthRequired, None, None);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "auth-required");

        let msg = ServerMessage::from_error(&GatewayError::EmptyCommand, Some("p9"), None);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "code": "empty_command",
                "message": "command must not be empty",
                "processId": "p9"
            })
        );
    }

    #[tokio::test]
    async fn outbox_preserves_order() {
        let (outbox, mut rx) = Outbox::channel(8);
        for i in 0..3 {
            assert!(outbox.send(ServerMessage::info(format!("m{i}"))).await);
        }
        for i in 0..3 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.message, ServerMessage::info(format!("m{i}")));
        }
        drop(rx);
        assert!(!outbox.send(ServerMessage::info("late")).await);
        assert!(outbox.is_closed());
    }
}
