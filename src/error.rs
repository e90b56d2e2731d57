use crate::bridge::BridgeError;

/// The five error families a client can observe.
///
/// Every [`GatewayError`] belongs to exactly one of them. The kind decides
/// nothing about delivery (all errors stay local to the connection that
/// caused them); it exists so callers and tests can reason about classes of
/// failure instead of individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Spawn,
    Runtime,
    NotFound,
}

/// Protocol-facing error for every operation a connection can request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("command must not be empty")]
    EmptyCommand,

    #[error("invalid terminal id: {0}")]
    InvalidTerminalId(String),

    #[error("working directory does not exist: {0}")]
    InvalidWorkingDirectory(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid authentication key")]
    AuthInvalid,

    #[error(transparent)]
    Spawn(BridgeError),

    #[error("terminal {0} is not ready")]
    NotReady(String),

    #[error(transparent)]
    Io(BridgeError),

    #[error("no such process: {0}")]
    ProcessNotFound(String),

    #[error("no such terminal: {0}")]
    TerminalNotFound(String),

    #[error("process {0} is not waiting for input")]
    NotPaused(String),

    #[error("connection is shutting down")]
    ConnectionClosed,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::EmptyCommand
            | GatewayError::InvalidTerminalId(_)
            | GatewayError::InvalidRequest(_) => ErrorKind::Validation,
            // A missing cwd is reported as not-found but aborts like validation.
            GatewayError::InvalidWorkingDirectory(_) => ErrorKind::NotFound,
            GatewayError::AuthRequired | GatewayError::AuthInvalid => ErrorKind::Authorization,
            GatewayError::Spawn(_) => ErrorKind::Spawn,
            GatewayError::NotReady(_)
            | GatewayError::Io(_)
            | GatewayError::ConnectionClosed => ErrorKind::Runtime,
            GatewayError::ProcessNotFound(_)
            | GatewayError::TerminalNotFound(_)
            | GatewayError::NotPaused(_) => ErrorKind::NotFound,
        }
    }

    /// Machine-readable code carried in the outbound `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::EmptyCommand => "empty_command",
            GatewayError::InvalidTerminalId(_) => "invalid_terminal_id",
            GatewayError::InvalidWorkingDirectory(_) => "cwd_not_found",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::AuthRequired => "auth_required",
            GatewayError::AuthInvalid => "auth_invalid",
            GatewayError::Spawn(_) => "spawn_failed",
            GatewayError::NotReady(_) => "not_ready",
            GatewayError::Io(_) => "io_failed",
            GatewayError::ProcessNotFound(_) => "process_not_found",
            GatewayError::TerminalNotFound(_) => "terminal_not_found",
            GatewayError::NotPaused(_) => "not_paused",
            GatewayError::ConnectionClosed => "connection_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_family() {
        assert_eq!(GatewayError::EmptyCommand.kind(), ErrorKind::Validation);
        assert_eq!(
            GatewayError::InvalidTerminalId("".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            GatewayError::InvalidRequest("cols".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn not_found_family() {
        assert_eq!(
            GatewayError::ProcessNotFound("abc".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GatewayError::TerminalNotFound("t1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GatewayError::InvalidWorkingDirectory("/nope".into()).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn spawn_errors_keep_their_source() {
        let err = GatewayError::Spawn(BridgeError::Spawn(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        )));
        assert_eq!(err.kind(), ErrorKind::Spawn);
        assert_eq!(err.code(), "spawn_failed");
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            GatewayError::EmptyCommand,
            GatewayError::AuthRequired,
            GatewayError::AuthInvalid,
            GatewayError::NotReady("t".into()),
            GatewayError::ProcessNotFound("p".into()),
            GatewayError::NotPaused("p".into()),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
