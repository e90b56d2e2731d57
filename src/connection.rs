//! Per-connection dispatch.
//!
//! A [`Connection`] turns inbound frames into registry operations and
//! replies on the connection's [`Outbox`]. It owns no I/O of its own; the
//! WebSocket handler feeds it text and stops when told to.

use uuid::Uuid;

use crate::auth::{AuthOutcome, ConnectionId};
use crate::context::ServerContext;
use crate::error::{ErrorKind, GatewayError};
use crate::protocol::{self, ClientMessage, Outbox, ServerMessage};
use crate::registry::{KillOutcome, SessionRegistry};
use crate::session::DEFAULT_TERMINAL_ID;

/// What the socket loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Connection {
    ctx: ServerContext,
    id: ConnectionId,
    outbox: Outbox,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Connection {
    /// Register a new connection with the context.
    pub fn open(ctx: ServerContext, outbox: Outbox) -> Self {
        let id = ctx.open_connection(outbox.clone());
        Self { ctx, id, outbox }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn welcome(&self) {
        self.outbox
            .send(ServerMessage::Info {
                message: "connected".to_string(),
                process_id: None,
                terminal_id: None,
                connection_id: Some(self.id.clone()),
                auth_required: Some(true),
            })
            .await;
    }

    /// Handle one text frame.
    pub async fn handle_text(&self, text: &str) -> Flow {
        match protocol::parse_client_message(text) {
            Ok(msg) => self.dispatch(msg).await,
            Err(e) => {
                tracing::debug!(conn = %self.id, "rejected frame: {e}");
                self.outbox.send(ServerMessage::from_parse_error(&e)).await;
                Flow::Continue
            }
        }
    }

    /// Kill everything this connection owns and drop its state.
    pub fn close(self) -> usize {
        self.ctx.close_connection(&self.id)
    }

    async fn dispatch(&self, msg: ClientMessage) -> Flow {
        tracing::trace!(conn = %self.id, kind = msg.type_name(), "dispatch");

        if !msg.is_ungated() {
            if let Err(e) = self.ctx.auth().guard(&self.id) {
                self.send_error(&e, None, None).await;
                return Flow::Continue;
            }
        }

        match msg {
            ClientMessage::Authenticate { key } => return self.authenticate(&key).await,

            ClientMessage::Execute {
                command,
                terminal_id,
                cwd,
            } => {
                let process_id = Uuid::new_v4().to_string();
                let result = match self.registry() {
                    Ok(registry) => match terminal_id.as_deref() {
                        Some(tid) => registry.execute(&process_id, tid, &command).await,
                        None => registry
                            .execute_transient(&process_id, &command, cwd.as_deref())
                            .await
                            .map(|_| ()),
                    },
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.send_error(&e, Some(&process_id), terminal_id.as_deref()).await;
                }
            }

            ClientMessage::CreateTerminal { terminal_id } => {
                self.create_terminal(terminal_id, false).await;
            }
            ClientMessage::CreateTerminalDashed { terminal_id } => {
                self.create_terminal(terminal_id, true).await;
            }

            ClientMessage::CloseTerminal { terminal_id } => {
                let tid = terminal_id.unwrap_or_else(|| DEFAULT_TERMINAL_ID.to_string());
                match self.registry().and_then(|r| r.close_terminal(&tid)) {
                    Ok(()) => {
                        self.outbox
                            .send(ServerMessage::TerminalClosed { terminal_id: tid })
                            .await;
                    }
                    Err(e) => self.send_error(&e, None, Some(&tid)).await,
                }
            }

            ClientMessage::Kill { process_id } => {
                let result = match self.registry() {
                    Ok(registry) => registry.kill(&process_id),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(outcome) => {
                        let message = match outcome {
                            KillOutcome::Killed => "killed",
                            KillOutcome::AlreadyExited => "already exited",
                        };
                        self.outbox
                            .send(ServerMessage::process_info(message, &process_id, None))
                            .await;
                    }
                    Err(e) => self.send_error(&e, Some(&process_id), None).await,
                }
            }

            ClientMessage::List {} => match self.registry() {
                Ok(registry) => {
                    self.outbox
                        .send(ServerMessage::ProcessList {
                            processes: registry.list_owned(),
                        })
                        .await;
                }
                Err(e) => self.send_error(&e, None, None).await,
            },

            ClientMessage::PauseResponse {
                process_id,
                response,
            } => {
                let result = match self.registry() {
                    Ok(registry) => registry.resume_paused(&process_id, &response).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.send_error(&e, Some(&process_id), None).await;
                }
            }

            ClientMessage::GetSystemInfo {} => {
                self.outbox
                    .send(ServerMessage::SystemInfo(self.ctx.system_info()))
                    .await;
            }

            ClientMessage::GetServerStats {} => {
                self.outbox
                    .send(ServerMessage::ServerStats(self.ctx.stats(&self.id)))
                    .await;
            }

            ClientMessage::TerminalInput { input, terminal_id } => {
                let tid = terminal_id.unwrap_or_else(|| DEFAULT_TERMINAL_ID.to_string());
                let result = match self.registry() {
                    Ok(registry) => registry.write_input(&tid, &input),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    self.send_error(&e, None, Some(&tid)).await;
                }
            }

            ClientMessage::TerminalResize {
                cols,
                rows,
                terminal_id,
            } => {
                let tid = terminal_id.unwrap_or_else(|| DEFAULT_TERMINAL_ID.to_string());
                match self.registry().and_then(|r| r.resize(&tid, cols, rows)) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(conn = %self.id, terminal = %tid, "resize of idle terminal ignored");
                    }
                    Err(e) => self.send_error(&e, None, Some(&tid)).await,
                }
            }
        }
        Flow::Continue
    }

    async fn authenticate(&self, key: &str) -> Flow {
        match self.ctx.authenticate(&self.id, key) {
            AuthOutcome::Accepted { .. } => {
                self.outbox
                    .send(ServerMessage::AuthSuccess {
                        message: "authenticated".to_string(),
                    })
                    .await;
                Flow::Continue
            }
            AuthOutcome::Rejected { attempts_remaining } => {
                self.outbox
                    .send(ServerMessage::AuthFailed {
                        message: GatewayError::AuthInvalid.to_string(),
                        attempts_remaining,
                    })
                    .await;
                Flow::Continue
            }
            AuthOutcome::Locked => {
                tracing::warn!(conn = %self.id, "too many failed authentication attempts, closing");
                self.outbox
                    .send(ServerMessage::AuthFailed {
                        message: "too many failed attempts".to_string(),
                        attempts_remaining: 0,
                    })
                    .await;
                Flow::Close
            }
            AuthOutcome::Unknown => {
                self.send_error(&GatewayError::ConnectionClosed, None, None).await;
                Flow::Close
            }
        }
    }

    async fn create_terminal(&self, terminal_id: Option<String>, dashed: bool) {
        let tid = terminal_id.unwrap_or_else(|| DEFAULT_TERMINAL_ID.to_string());
        let result = match self.registry() {
            Ok(registry) => registry.create_terminal(&tid).await,
            Err(e) => Err(e),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return self.send_error(&e, None, Some(&tid)).await,
        };
        let cwd = outcome.cwd.display().to_string();
        let reply = if dashed {
            ServerMessage::TerminalCreated {
                terminal_id: tid,
                created: outcome.created,
                cwd,
            }
        } else {
            ServerMessage::TerminalReady {
                terminal_id: tid,
                created: outcome.created,
                cwd,
            }
        };
        self.outbox.send(reply).await;
    }

    fn registry(&self) -> Result<SessionRegistry, GatewayError> {
        self.ctx.registry(&self.id).ok_or(GatewayError::AuthRequired)
    }

    async fn send_error(&self, err: &GatewayError, process_id: Option<&str>, terminal_id: Option<&str>) {
        match err.kind() {
            ErrorKind::Spawn | ErrorKind::Runtime => {
                tracing::warn!(conn = %self.id, code = err.code(), ?process_id, ?terminal_id, "{err}");
            }
            _ => tracing::debug!(conn = %self.id, code = err.code(), ?process_id, ?terminal_id, "{err}"),
        }
        self.outbox
            .send(ServerMessage::from_error(err, process_id, terminal_id))
            .await;
    }
}
