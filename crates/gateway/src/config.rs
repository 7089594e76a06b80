//! Configuration management for the sshbox gateway.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sshbox/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use runtime::Mount;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spec_builder::check_mount;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("listen_addr must be a socket address like 0.0.0.0:2222, got {0}")]
    InvalidListenAddr(String),

    #[error("auth.policy is not set; choose one of: allow-all, password, public-key, hook")]
    MissingAuthPolicy,

    #[error("auth.policy = \"{policy}\" requires auth.{field} to be set")]
    MissingPolicyInput {
        policy: &'static str,
        field: &'static str,
    },

    #[error("auth.max_attempts must be between 1 and 100, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("container.network = \"host\" is not allowed")]
    HostNetworkRefused,

    #[error("container.default_image must not be empty")]
    EmptyDefaultImage,

    #[error("container.default_shell must not be empty")]
    EmptyDefaultShell,

    #[error("container.cpus must be a finite number greater than 0, got {0}")]
    InvalidCpus(f64),

    #[error("container.memory_mb must be at least 1, got {0}")]
    InvalidMemory(u64),

    #[error("container.pids_limit must be at least 1, got {0}")]
    InvalidPidsLimit(i64),

    #[error("container.mounts: {0}")]
    InvalidMount(String),

    #[error("container.env key is not a valid variable name: {0}")]
    InvalidEnvKey(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the sshbox gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and process settings.
    pub server: ServerConfig,

    /// Authentication policy.
    pub auth: AuthConfig,

    /// What each session's container looks like.
    pub container: ContainerConfig,

    /// Session limits and timeouts.
    pub session: SessionConfig,
}

/// Listener and process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the SSH listener binds to.
    pub listen_addr: String,

    /// Host key path. Generated (Ed25519) when missing.
    /// Defaults to `<data_dir>/host_ed25519`.
    pub host_key: Option<PathBuf>,

    /// Directory for gateway data (host key).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Additionally write logs to this file.
    pub log_file: Option<PathBuf>,

    /// Text shown to the client before the contained program starts.
    pub banner: Option<String>,

    /// Close connections idle for this many seconds (0 = never).
    pub inactivity_timeout_secs: u64,

    /// Remove containers left behind by a previous run at startup.
    pub cleanup_on_start: bool,
}

/// Selectable authentication policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPolicy {
    /// Accept every user without credentials.
    AllowAll,
    /// Check passwords against `auth.passwords`.
    Password,
    /// Check public keys against `auth.authorized_keys` files.
    PublicKey,
    /// Ask external scripts.
    Hook,
}

impl AuthPolicy {
    /// Name as written in the configuration file.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthPolicy::AllowAll => "allow-all",
            AuthPolicy::Password => "password",
            AuthPolicy::PublicKey => "public-key",
            AuthPolicy::Hook => "hook",
        }
    }
}

impl std::str::FromStr for AuthPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "allow-all" => Ok(AuthPolicy::AllowAll),
            "password" => Ok(AuthPolicy::Password),
            "public-key" => Ok(AuthPolicy::PublicKey),
            "hook" => Ok(AuthPolicy::Hook),
            other => Err(format!("unknown auth policy: {other}")),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Policy in effect. There is no default; it must be chosen explicitly.
    pub policy: Option<AuthPolicy>,

    /// Failed attempts allowed per connection before it is closed.
    pub max_attempts: u32,

    /// OpenSSH authorized_keys files for the `public-key` policy.
    pub authorized_keys: Vec<PathBuf>,

    /// Script deciding password logins for the `hook` policy.
    pub password_hook: Option<PathBuf>,

    /// Script deciding public-key logins for the `hook` policy.
    pub public_key_hook: Option<PathBuf>,

    /// Seconds a hook script may run before the login is rejected.
    pub hook_timeout_secs: u64,

    /// User name to password map for the `password` policy.
    pub passwords: BTreeMap<String, String>,
}

/// Container settings applied to every session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image used when nothing else selects one.
    pub default_image: String,

    /// Use the SSH user name as image name (`_` becomes `/`).
    pub image_from_username: bool,

    /// Images sessions may use. Empty allows any image.
    pub allowed_images: Vec<String>,

    /// Program started when the client asks for a shell.
    pub default_shell: String,

    /// User inside the container.
    pub user: Option<String>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,

    /// Memory limit in MiB.
    pub memory_mb: Option<u64>,

    /// CPU limit in cores.
    pub cpus: Option<f64>,

    /// Maximum number of processes.
    pub pids_limit: Option<i64>,

    /// `none` or the name of a user-defined network.
    pub network: String,

    /// Allow sessions to request privileged containers.
    pub allow_privileged: bool,

    /// Mount the container root filesystem read-only.
    pub read_only_rootfs: bool,

    /// Host directories that mounts may come from.
    pub allowed_mount_prefixes: Vec<PathBuf>,

    /// Environment set in every container.
    pub env: BTreeMap<String, String>,

    /// Extra labels set on every container.
    pub labels: BTreeMap<String, String>,

    /// Host paths bound into every container.
    pub mounts: Vec<Mount>,
}

/// Session limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Seconds allowed for pull + create + start + attach.
    pub acquire_timeout_secs: u64,

    /// Seconds a container gets to stop before it is killed.
    pub stop_grace_secs: u64,

    /// Seconds allowed for removing a container.
    pub remove_timeout_secs: u64,

    /// Seconds shutdown waits for sessions to release their containers.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key: None,
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
            banner: None,
            inactivity_timeout_secs: 3600,
            cleanup_on_start: true,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            policy: None,
            max_attempts: 6,
            authorized_keys: Vec::new(),
            password_hook: None,
            public_key_hook: None,
            hook_timeout_secs: 10,
            passwords: BTreeMap::new(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            default_image: "alpine:latest".to_string(),
            image_from_username: false,
            allowed_images: Vec::new(),
            default_shell: "/bin/sh".to_string(),
            user: None,
            working_dir: None,
            memory_mb: Some(512),
            cpus: Some(1.0),
            pids_limit: Some(256),
            network: "none".to_string(),
            allow_privileged: false,
            read_only_rootfs: false,
            allowed_mount_prefixes: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            mounts: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            acquire_timeout_secs: 30,
            stop_grace_secs: 5,
            remove_timeout_secs: 10,
            shutdown_grace_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Effective host key path.
    pub fn host_key_path(&self) -> PathBuf {
        self.host_key
            .clone()
            .unwrap_or_else(|| self.data_dir.join("host_ed25519"))
    }

    /// Idle timeout, or `None` when disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout_secs > 0).then(|| Duration::from_secs(self.inactivity_timeout_secs))
    }
}

impl SessionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn remove_timeout(&self) -> Duration {
        Duration::from_secs(self.remove_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshbox")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshbox")
}

/// Returns true if `key` is usable as an environment variable name.
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SSHBOX_LISTEN_ADDR: Override listen address
    /// - SSHBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SSHBOX_DEFAULT_IMAGE: Override default container image
    /// - SSHBOX_AUTH_POLICY: Override authentication policy
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SSHBOX_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(level) = std::env::var("SSHBOX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }

        if let Ok(image) = std::env::var("SSHBOX_DEFAULT_IMAGE") {
            if !image.is_empty() {
                tracing::info!("Overriding default_image from environment: {}", image);
                self.container.default_image = image;
            }
        }

        if let Ok(policy) = std::env::var("SSHBOX_AUTH_POLICY") {
            if !policy.is_empty() {
                match policy.parse::<AuthPolicy>() {
                    Ok(policy) => {
                        tracing::info!(
                            "Overriding auth policy from environment: {}",
                            policy.as_str()
                        );
                        self.auth.policy = Some(policy);
                    }
                    Err(e) => tracing::warn!("Ignoring SSHBOX_AUTH_POLICY: {}", e),
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate max_sessions: 1-1000
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        self.validate_auth()?;

        if self.container.network.eq_ignore_ascii_case("host") {
            return Err(ConfigError::HostNetworkRefused);
        }
        if self.container.default_image.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultImage);
        }
        if self.container.default_shell.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultShell);
        }
        if let Some(cpus) = self.container.cpus {
            if !cpus.is_finite() || cpus <= 0.0 {
                return Err(ConfigError::InvalidCpus(cpus));
            }
        }
        if let Some(memory_mb) = self.container.memory_mb {
            if memory_mb < 1 {
                return Err(ConfigError::InvalidMemory(memory_mb));
            }
        }
        if let Some(pids_limit) = self.container.pids_limit {
            if pids_limit < 1 {
                return Err(ConfigError::InvalidPidsLimit(pids_limit));
            }
        }
        for mount in &self.container.mounts {
            check_mount(mount, &self.container.allowed_mount_prefixes)
                .map_err(|e| ConfigError::InvalidMount(e.to_string()))?;
        }
        if let Some(key) = self.container.env.keys().find(|k| !is_valid_env_key(k)) {
            return Err(ConfigError::InvalidEnvKey(key.clone()));
        }

        let timeouts = [
            ("session.acquire_timeout_secs", self.session.acquire_timeout_secs),
            ("session.remove_timeout_secs", self.session.remove_timeout_secs),
            ("session.shutdown_grace_secs", self.session.shutdown_grace_secs),
            ("auth.hook_timeout_secs", self.auth.hook_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }

        Ok(())
    }

    fn validate_auth(&self) -> Result<(), ConfigError> {
        let auth = &self.auth;
        if auth.max_attempts < 1 || auth.max_attempts > 100 {
            return Err(ConfigError::InvalidMaxAttempts(auth.max_attempts));
        }
        let policy = auth.policy.ok_or(ConfigError::MissingAuthPolicy)?;
        let missing = |field: &'static str| ConfigError::MissingPolicyInput {
            policy: policy.as_str(),
            field,
        };
        match policy {
            AuthPolicy::AllowAll => Ok(()),
            AuthPolicy::Password if auth.passwords.is_empty() => Err(missing("passwords")),
            AuthPolicy::PublicKey if auth.authorized_keys.is_empty() => {
                Err(missing("authorized_keys"))
            }
            AuthPolicy::Hook if auth.password_hook.is_none() && auth.public_key_hook.is_none() => {
                Err(missing("password_hook or public_key_hook"))
            }
            _ => Ok(()),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/sshbox/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
