//! Error types for the gateway.
//!
//! Each stage of a session has its own error type; [`SessionError`] wraps
//! them as the outcome of one session. None of these ever leave the session
//! that produced them.

use std::time::Duration;

use runtime::{ContainerId, RuntimeError};
use thiserror::Error;

use crate::session::SessionId;

/// Credential check failures. The connection never gets a container.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The user is not known to the policy.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// The password did not match.
    #[error("wrong password for {0}")]
    BadPassword(String),

    /// The offered key is not in any authorized_keys file.
    #[error("public key not authorized for {0}")]
    KeyNotAuthorized(String),

    /// The policy does not accept this authentication method.
    #[error("authentication method {0} not accepted")]
    MethodNotAllowed(&'static str),

    /// The hook script answered with `allowed: false`.
    #[error("rejected by auth hook: {0}")]
    HookRejected(String),

    /// The hook script could not be run or answered garbage.
    #[error("auth hook failed: {0}")]
    HookFailed(String),
}

/// The client asked for something the policy forbids.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidRequestError {
    /// The image is not in `allowed_images`.
    #[error("image {0} is not allowed")]
    ImageNotAllowed(String),

    /// The image reference is malformed.
    #[error("invalid image reference: {0:?}")]
    InvalidImage(String),

    /// Privileged mode was requested but is disabled.
    #[error("privileged containers are disabled")]
    PrivilegedNotAllowed,

    /// A mount source is outside the allowed prefixes.
    #[error("mount source {0} is not under an allowed prefix")]
    MountNotAllowed(String),

    /// The container would share the host network namespace.
    #[error("host networking is not allowed")]
    HostNetwork,

    /// A mount would expose the container engine socket.
    #[error("mounting the container engine socket is forbidden")]
    EngineSocketMount,

    /// The exec command could not be split into words.
    #[error("cannot parse command: {0}")]
    UnparsableCommand(String),

    /// An environment variable name is not valid.
    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvKey(String),

    /// The session already started a program.
    #[error("a shell or command was already requested on this session")]
    AlreadyStarted,
}

/// Container provisioning failures. Anything partially created is removed
/// before one of these is returned.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("pulling image {image} failed: {source}")]
    Pull {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("creating container failed: {0}")]
    Create(#[source] RuntimeError),

    #[error("starting container {id} failed: {source}")]
    Start {
        id: ContainerId,
        #[source]
        source: RuntimeError,
    },

    #[error("attaching to container {id} failed: {source}")]
    Attach {
        id: ContainerId,
        #[source]
        source: RuntimeError,
    },

    #[error("container provisioning timed out after {0:?}")]
    Timeout(Duration),

    #[error("container provisioning cancelled")]
    Cancelled,

    #[error("session already holds a container")]
    AlreadyAcquired,
}

/// Data-plane failures while relaying between the client and the container.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Writing to the container's stdin failed.
    #[error("writing to container stdin failed: {0}")]
    Stdin(#[source] std::io::Error),

    /// Reading the container's output failed.
    #[error("reading container output failed: {0}")]
    Output(#[source] RuntimeError),

    /// The SSH channel refused data.
    #[error("ssh channel closed: {0}")]
    Channel(String),
}

impl BridgeError {
    /// Returns true if the error is just the other side going away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BridgeError::Stdin(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            BridgeError::Channel(_) => true,
            BridgeError::Output(_) => false,
        }
    }
}

/// A container could not be removed even after a forced kill.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("container {container} could not be removed: {reason}")]
pub struct TeardownError {
    /// Container id, or its name when the id was never learned.
    pub container: String,
    /// Why removal failed.
    pub reason: String,
}

/// Session registry failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("session limit reached ({max} active)")]
    Full { max: usize },

    #[error("session {0} is already registered")]
    Duplicate(SessionId),
}

/// Outcome of a failed session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequestError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The session task died without reporting an outcome.
    #[error("session task aborted: {0}")]
    Aborted(String),
}

impl SessionError {
    /// One-line explanation suitable for the client's stderr.
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Authentication(_) => "authentication failed".to_string(),
            SessionError::InvalidRequest(err) => format!("request refused: {err}"),
            SessionError::Provision(ProvisionError::Timeout(_)) => {
                "container did not start in time".to_string()
            }
            SessionError::Provision(_) => "could not start a container for this session".to_string(),
            SessionError::Bridge(_) => "session i/o failed".to_string(),
            SessionError::Teardown(_) => "container cleanup failed".to_string(),
            SessionError::Registry(err) => err.to_string(),
            SessionError::Aborted(_) => "internal error".to_string(),
        }
    }
}
