//! Process-wide registry of active sessions.
//!
//! The registry is the only state shared between sessions. It exists for
//! graceful shutdown: [`SessionRegistry::shutdown`] cancels every registered
//! session and waits, bounded, until all of them have released their
//! containers and dropped their [`SessionGuard`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Session, SessionId};
use crate::error::RegistryError;

/// Information about a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Owner of the session's container.
    pub user: String,
    pub peer: Option<SocketAddr>,
    pub started_at: SystemTime,
}

struct Registered {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Outcome of [`SessionRegistry::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that were cancelled.
    pub cancelled: usize,
    /// Sessions still registered when the grace period ran out.
    pub remaining: usize,
}

/// Thread-safe session registry using DashMap.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Registered>,
    max_sessions: usize,
    draining: AtomicBool,
    /// Signalled whenever a session leaves.
    changed: Notify,
    total: AtomicU64,
    auth_failures: AtomicU64,
    teardown_failures: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            draining: AtomicBool::new(false),
            changed: Notify::new(),
            total: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            teardown_failures: AtomicU64::new(0),
        }
    }

    /// Registers `session`; `cancel` is fired when the gateway shuts down.
    ///
    /// The session stays registered until the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        session: &Session,
        cancel: CancellationToken,
    ) -> Result<SessionGuard, RegistryError> {
        if self.is_draining() {
            return Err(RegistryError::ShuttingDown);
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full {
                max: self.max_sessions,
            });
        }

        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::Duplicate(session.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(Registered {
                    info: SessionInfo {
                        id: session.id.clone(),
                        user: session.principal.owner().to_string(),
                        peer: session.peer,
                        started_at: session.created_at,
                    },
                    cancel,
                });
            }
        }

        // Shutdown may have swept the map between the check and the insert.
        if self.is_draining() {
            self.deregister(&session.id);
            return Err(RegistryError::ShuttingDown);
        }

        self.total.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %session.id, active = self.count(), "Session registered");
        Ok(SessionGuard {
            registry: Arc::clone(self),
            id: session.id.clone(),
        })
    }

    fn deregister(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            debug!(session_id = %id, active = self.count(), "Session deregistered");
        }
        self.changed.notify_waiters();
    }

    /// Number of active sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Lists all active sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// True once shutdown started; no new sessions are accepted.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Sessions registered since startup.
    pub fn total_sessions(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Counts one failed authentication attempt; returns the new total.
    pub fn record_auth_failure(&self) -> u64 {
        self.auth_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::SeqCst)
    }

    /// Counts one container that could not be removed.
    pub fn record_teardown_failure(&self) -> u64 {
        self.teardown_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn teardown_failures(&self) -> u64 {
        self.teardown_failures.load(Ordering::SeqCst)
    }

    /// Stops accepting sessions, cancels all of them and waits up to `grace`
    /// for them to finish.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.draining.store(true, Ordering::SeqCst);

        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            info!("Cancelled {} active sessions, waiting up to {:?}", cancelled, grace);
        }

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.changed.notified();
            if self.sessions.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let remaining = self.count();
        if remaining > 0 {
            warn!("{} sessions still active after {:?}", remaining, grace);
        }
        ShutdownReport {
            cancelled,
            remaining,
        }
    }
}

/// Keeps a session registered; deregisters on drop.
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.id);
    }
}
