//! Shared-key gate in front of every session-mutating message.
//!
//! The gate keeps one entry per open connection. Entries are created when a
//! connection opens and removed when it closes, so nothing survives a
//! reconnect.

use parking_lot::RwLock;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

pub type ConnectionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Key matched. `first` is false when the connection was already in.
    Accepted { first: bool },
    /// Key did not match; the connection stays as it was.
    Rejected { attempts_remaining: u32 },
    /// Too many failures on an unauthenticated connection; close it.
    Locked,
    /// The connection was never opened or has already been forgotten.
    Unknown,
}

impl AuthOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, AuthOutcome::Accepted { .. })
    }
}

#[derive(Debug, Default)]
struct GateEntry {
    authenticated: bool,
    failures: u32,
}

pub struct AuthGate {
    secret: String,
    max_failures: u32,
    entries: RwLock<HashMap<ConnectionId, GateEntry>>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("max_failures", &self.max_failures)
            .field("connections", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(secret: impl Into<String>, max_failures: u32) -> Self {
        Self {
            secret: secret.into(),
            max_failures: max_failures.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a connection in the gated state.
    pub fn open(&self, conn: &str) {
        self.entries.write().insert(conn.to_string(), GateEntry::default());
    }

    /// Check `key` for `conn`. Comparison is constant-time.
    ///
    /// A wrong key never revokes an existing authentication.
    pub fn authenticate(&self, conn: &str, key: &str) -> AuthOutcome {
        let matched: bool = key.as_bytes().ct_eq(self.secret.as_bytes()).into();
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(conn) else {
            tracing::debug!(conn, "authentication for unknown connection");
            return AuthOutcome::Unknown;
        };

        if matched {
            let first = !entry.authenticated;
            entry.authenticated = true;
            entry.failures = 0;
            return AuthOutcome::Accepted { first };
        }

        entry.failures = entry.failures.saturating_add(1);
        tracing::warn!(conn, failures = entry.failures, "authentication failed");
        if !entry.authenticated && entry.failures >= self.max_failures {
            return AuthOutcome::Locked;
        }
        AuthOutcome::Rejected {
            attempts_remaining: self.max_failures.saturating_sub(entry.failures),
        }
    }

    pub fn is_authenticated(&self, conn: &str) -> bool {
        self.entries
            .read()
            .get(conn)
            .is_some_and(|e| e.authenticated)
    }

    /// Reject with `auth-required` unless `conn` has authenticated.
    pub fn guard(&self, conn: &str) -> Result<(), GatewayError> {
        if self.is_authenticated(conn) {
            Ok(())
        } else {
            Err(GatewayError::AuthRequired)
        }
    }

    /// Drop all state for a closed connection.
    pub fn forget(&self, conn: &str) {
        self.entries.write().remove(conn);
    }

    pub fn authenticated_count(&self) -> usize {
        self.entries.read().values().filter(|e| e.authenticated).count()
    }
}
