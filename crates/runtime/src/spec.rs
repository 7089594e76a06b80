//! Container specification types.
//!
//! A [`ContainerSpec`] is the immutable description of one container: what
//! image to run, which process to start, its environment and the limits it
//! is confined by. It is built once per session and never mutated after.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime-assigned container identifier.
pub type ContainerId = String;

/// Label carried by every container the gateway manages.
pub const MANAGED_LABEL: &str = "sshbox";

/// Label holding the owning session id.
pub const SESSION_LABEL: &str = "sshbox.session";

/// Label holding the authenticated user name.
pub const USER_LABEL: &str = "sshbox.user";

/// Label holding the image reference the container was created from.
pub const IMAGE_LABEL: &str = "sshbox.image";

/// Resource limits applied to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU quota in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
    /// Maximum number of processes.
    pub pids_limit: Option<i64>,
}

/// Network attachment of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No network interfaces besides loopback.
    #[default]
    None,
    /// Attach to a user-defined network by name.
    Named(String),
}

impl NetworkPolicy {
    /// Engine network mode string.
    pub fn mode(&self) -> &str {
        match self {
            NetworkPolicy::None => "none",
            NetworkPolicy::Named(name) => name,
        }
    }
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path.
    pub source: PathBuf,
    /// Path inside the container.
    pub target: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Renders the mount in `source:target[:ro]` bind syntax.
    pub fn to_bind(&self) -> String {
        let mut bind = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Immutable description of the container backing one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, unique per session.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command (arguments to the entrypoint).
    pub command: Vec<String>,
    /// Environment; keys are unique.
    pub env: BTreeMap<String, String>,
    /// User to run as inside the container.
    pub user: Option<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Allocate a TTY for the process.
    pub tty: bool,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Network attachment.
    pub network: NetworkPolicy,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Run privileged.
    pub privileged: bool,
    /// Mount the root filesystem read-only.
    pub read_only_rootfs: bool,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Renders the environment as `KEY=VALUE` pairs, skipping empty values.
    pub fn env_list(&self) -> Vec<String> {
        self.env
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    /// Session id recorded in the labels, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.labels.get(SESSION_LABEL).map(String::as_str)
    }
}
