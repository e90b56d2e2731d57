//! Server-wide state, owned explicitly and handed to every connection.
//!
//! The context is the registry of registries: one entry per open WebSocket,
//! each holding that connection's outbound queue and (once authenticated)
//! its [`SessionRegistry`]. Lookups are always keyed by the caller's own
//! connection id, so one connection can never reach another's processes.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthGate, AuthOutcome, ConnectionId};
use crate::config::GatewayConfig;
use crate::pause::PauseDetector;
use crate::protocol::Outbox;
use crate::registry::{RegistrySettings, SessionRegistry};
use crate::system_info::{self, ServerStats, SystemInfo};

struct ConnectionEntry {
    outbox: Outbox,
    /// Created on first successful authentication.
    registry: Option<SessionRegistry>,
    connected_at: DateTime<Utc>,
}

struct ContextInner {
    config: GatewayConfig,
    auth: AuthGate,
    detector: Arc<PauseDetector>,
    connections: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("bind", &self.inner.config.bind)
            .field("connections", &self.connection_count())
            .field("started_at", &self.inner.started_at)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// `key` is the shared secret every connection must present.
    pub fn new(config: GatewayConfig, key: impl Into<String>) -> Self {
        let auth = AuthGate::new(key, config.max_auth_failures);
        Self {
            inner: Arc::new(ContextInner {
                config,
                auth,
                detector: Arc::new(PauseDetector::standard()),
                connections: RwLock::new(HashMap::new()),
                started_at: Utc::now(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn auth(&self) -> &AuthGate {
        &self.inner.auth
    }

    /// Cancelled once the server starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Track a new connection in the unauthenticated state.
    pub fn open_connection(&self, outbox: Outbox) -> ConnectionId {
        let conn = uuid::Uuid::new_v4().to_string();
        self.inner.auth.open(&conn);
        self.inner.connections.write().insert(
            conn.clone(),
            ConnectionEntry {
                outbox,
                registry: None,
                connected_at: Utc::now(),
            },
        );
        tracing::info!(conn = %conn, "connection opened");
        conn
    }

    /// Check a key and, on the first success, give the connection its
    /// registry.
    pub fn authenticate(&self, conn: &str, key: &str) -> AuthOutcome {
        let outcome = self.inner.auth.authenticate(conn, key);
        if outcome.accepted() {
            let mut connections = self.inner.connections.write();
            if let Some(entry) = connections.get_mut(conn) {
                if entry.registry.is_none() {
                    entry.registry = Some(SessionRegistry::new(
                        conn,
                        RegistrySettings::from(&self.inner.config),
                        Arc::clone(&self.inner.detector),
                        entry.outbox.clone(),
                    ));
                    tracing::info!(conn, "connection authenticated");
                }
            }
        }
        outcome
    }

    /// The caller's own registry, if it has authenticated.
    pub fn registry(&self, conn: &str) -> Option<SessionRegistry> {
        self.inner
            .connections
            .read()
            .get(conn)
            .and_then(|e| e.registry.clone())
    }

    /// Tear down everything `conn` owns and forget it. Returns how many
    /// processes were signaled. Safe to call twice.
    pub fn close_connection(&self, conn: &str) -> usize {
        let entry = self.inner.connections.write().remove(conn);
        self.inner.auth.forget(conn);
        let Some(entry) = entry else {
            return 0;
        };
        let killed = entry.registry.map_or(0, |r| r.teardown());
        let lived = Utc::now() - entry.connected_at;
        tracing::info!(conn, processes = killed, secs = lived.num_seconds(), "connection closed");
        killed
    }

    /// Cancel the shutdown token and tear down every connection.
    pub fn shutdown_all(&self) -> usize {
        self.inner.shutdown.cancel();
        let conns: Vec<ConnectionId> = self.inner.connections.read().keys().cloned().collect();
        let killed: usize = conns.iter().map(|c| self.close_connection(c)).sum();
        tracing::info!(connections = conns.len(), processes = killed, "all connections torn down");
        killed
    }

    pub fn system_info(&self) -> SystemInfo {
        system_info::snapshot(&self.inner.config.shell, self.inner.started_at)
    }

    /// Server-wide connection count plus `conn`'s own process counts.
    pub fn stats(&self, conn: &str) -> ServerStats {
        let counts = self.registry(conn).map(|r| r.counts()).unwrap_or_default();
        ServerStats {
            connections: self.connection_count(),
            terminals: counts.terminals,
            transient_processes: counts.transient,
            paused_processes: counts.paused,
            started_at: self.inner.started_at,
            uptime_secs: (Utc::now() - self.inner.started_at).num_seconds(),
        }
    }
}
