//! Per-connection sessions.
//!
//! A [`Session`] is created once the SSH client has authenticated and asked
//! for a shell or a command. Its [`SessionController`] drives it through
//! spec build, container acquire, the I/O bridge and release, while the
//! [`SessionRegistry`] keeps track of every live session for shutdown.

pub mod bridge;
pub mod controller;
pub mod registry;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::SystemTime;

use uuid::Uuid;

use crate::auth::Principal;

pub use bridge::{BridgeOutcome, ChannelEvent, ClientChannel, EndReason, SessionBridge};
pub use controller::{SessionContext, SessionController, SessionReport};
pub use registry::{SessionGuard, SessionInfo, SessionRegistry, ShutdownReport};

/// Unique identifier for a session.
pub type SessionId = String;

/// Generates a fresh session id.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

/// Terminal negotiated with `pty-req`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value for `TERM`.
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// What the client asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Interactive login shell.
    Shell,
    /// One command line from an `exec` request.
    Exec(String),
}

/// Everything the client negotiated on its session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    /// Present when the client asked for a PTY.
    pub pty: Option<PtyRequest>,
    /// Variables sent with `env` requests.
    pub env: BTreeMap<String, String>,
    pub program: Program,
}

impl TerminalRequest {
    /// Interactive shell without a PTY.
    pub fn shell() -> Self {
        Self {
            pty: None,
            env: BTreeMap::new(),
            program: Program::Shell,
        }
    }

    /// One-shot command without a PTY.
    pub fn exec(command: impl Into<String>) -> Self {
        Self {
            program: Program::Exec(command.into()),
            ..Self::shell()
        }
    }

    /// Adds a PTY of the given size.
    pub fn with_pty(mut self, term: impl Into<String>, cols: u16, rows: u16) -> Self {
        self.pty = Some(PtyRequest {
            term: term.into(),
            cols,
            rows,
        });
        self
    }
}

/// One authenticated SSH session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub principal: Principal,
    /// Remote address of the connection.
    pub peer: Option<SocketAddr>,
    pub request: TerminalRequest,
    pub created_at: SystemTime,
}

impl Session {
    pub fn new(
        id: SessionId,
        principal: Principal,
        peer: Option<SocketAddr>,
        request: TerminalRequest,
    ) -> Self {
        Self {
            id,
            principal,
            peer,
            request,
            created_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_terminal_request_builders() {
        let request = TerminalRequest::exec("ls -l").with_pty("xterm", 80, 24);
        assert_eq!(request.program, Program::Exec("ls -l".to_string()));
        let pty = request.pty.unwrap();
        assert_eq!((pty.term.as_str(), pty.cols, pty.rows), ("xterm", 80, 24));
        assert!(TerminalRequest::shell().pty.is_none());
    }
}
