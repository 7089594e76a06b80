//! Authentication policies.
//!
//! The SSH server hands every credential the client offers to an
//! [`Authenticator`]. A successful check yields a [`Principal`]: who logged
//! in, how, and any per-user container settings the policy attached.
//!
//! Available policies:
//! - [`AllowAll`]: accepts everyone, no credentials asked
//! - [`PasswordList`]: fixed user/password table
//! - [`PublicKeyAllowList`]: OpenSSH authorized_keys files
//! - [`HookAuthenticator`]: external scripts answering with JSON

pub mod hook;
pub mod password;
pub mod public_key;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::keys::PublicKey;
use serde::Deserialize;

use crate::config::{AuthConfig, AuthPolicy};
use crate::error::AuthenticationError;

pub use hook::HookAuthenticator;
pub use password::PasswordList;
pub use public_key::PublicKeyAllowList;

/// How a client proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password,
    PublicKey,
}

impl AuthMethod {
    /// sshd-style method name used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
        }
    }
}

/// Credentials offered in one authentication attempt.
#[derive(Debug, Clone, Copy)]
pub enum Credentials<'a> {
    None,
    Password(&'a str),
    PublicKey(&'a PublicKey),
}

impl Credentials<'_> {
    pub fn method(&self) -> AuthMethod {
        match self {
            Credentials::None => AuthMethod::None,
            Credentials::Password(_) => AuthMethod::Password,
            Credentials::PublicKey(_) => AuthMethod::PublicKey,
        }
    }
}

/// One authentication attempt.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    /// SSH user name.
    pub user: &'a str,
    /// Remote address of the connection.
    pub peer: Option<SocketAddr>,
    /// What the client offered.
    pub credentials: Credentials<'a>,
}

/// Container settings a policy attaches to a user.
///
/// Field names follow the hook JSON format (`image-name`, `remote-user`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionOverrides {
    /// Image to run instead of the configured one.
    pub image_name: Option<String>,
    /// Name recorded as the container's owner.
    pub remote_user: Option<String>,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// Command to run instead of the shell.
    pub command: Option<Vec<String>>,
    /// Entrypoint override.
    pub entrypoint: Option<String>,
    /// User inside the container.
    pub user: Option<String>,
    /// Ask for a privileged container; refused unless allowed by config.
    pub privileged: Option<bool>,
}

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// SSH user name.
    pub user: String,
    /// Method that succeeded.
    pub method: AuthMethod,
    /// Per-user container settings.
    pub overrides: SessionOverrides,
}

impl Principal {
    pub fn new(user: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            user: user.into(),
            method,
            overrides: SessionOverrides::default(),
        }
    }

    /// Name recorded as the owner of the session's container.
    pub fn owner(&self) -> &str {
        self.overrides.remote_user.as_deref().unwrap_or(&self.user)
    }
}

/// A credential-checking policy.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Methods the policy can accept, advertised to clients.
    fn methods(&self) -> Vec<AuthMethod>;

    /// Checks one attempt.
    async fn authenticate(&self, request: &AuthRequest<'_>)
        -> Result<Principal, AuthenticationError>;
}

/// Accepts every user without asking for credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    fn methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::None]
    }

    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Principal, AuthenticationError> {
        Ok(Principal::new(request.user, request.credentials.method()))
    }
}

/// Builds the authenticator selected by the configuration.
pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn Authenticator>> {
    let policy = config
        .policy
        .context("No authentication policy configured (auth.policy)")?;
    let authenticator: Arc<dyn Authenticator> = match policy {
        AuthPolicy::AllowAll => {
            tracing::warn!("Authentication policy allow-all: every user is accepted");
            Arc::new(AllowAll)
        }
        AuthPolicy::Password => Arc::new(PasswordList::new(&config.passwords)),
        AuthPolicy::PublicKey => Arc::new(PublicKeyAllowList::load(&config.authorized_keys)?),
        AuthPolicy::Hook => Arc::new(HookAuthenticator::new(
            config.password_hook.clone(),
            config.public_key_hook.clone(),
            Duration::from_secs(config.hook_timeout_secs),
        )),
    };
    Ok(authenticator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str) -> AuthRequest<'_> {
        AuthRequest {
            user,
            peer: None,
            credentials: Credentials::None,
        }
    }

    #[tokio::test]
    async fn test_allow_all_accepts_anyone() {
        let principal = AllowAll.authenticate(&request("bob")).await.unwrap();
        assert_eq!(principal.user, "bob");
        assert_eq!(principal.method, AuthMethod::None);
        assert_eq!(principal.owner(), "bob");
    }

    #[test]
    fn test_owner_prefers_remote_user() {
        let mut principal = Principal::new("alpine", AuthMethod::Password);
        principal.overrides.remote_user = Some("alice".to_string());
        assert_eq!(principal.owner(), "alice");
    }

    #[test]
    fn test_overrides_from_hook_json() {
        let json = r#"{
            "image-name": "ubuntu:24.04",
            "remote-user": "alice",
            "env": {"A": "1"},
            "command": ["/bin/bash", "-l"],
            "entrypoint": "/entry",
            "user": "1000",
            "privileged": false
        }"#;
        let overrides: SessionOverrides = serde_json::from_str(json).unwrap();
        assert_eq!(overrides.image_name.as_deref(), Some("ubuntu:24.04"));
        assert_eq!(overrides.remote_user.as_deref(), Some("alice"));
        assert_eq!(overrides.env.get("A").unwrap(), "1");
        assert_eq!(
            overrides.command,
            Some(vec!["/bin/bash".to_string(), "-l".to_string()])
        );
        assert_eq!(overrides.entrypoint.as_deref(), Some("/entry"));
        assert_eq!(overrides.privileged, Some(false));
    }

    #[test]
    fn test_from_config_requires_policy() {
        assert!(from_config(&AuthConfig::default()).is_err());

        let config = AuthConfig {
            policy: Some(AuthPolicy::AllowAll),
            ..AuthConfig::default()
        };
        let auth = from_config(&config).unwrap();
        assert_eq!(auth.methods(), vec![AuthMethod::None]);
    }

    #[test]
    fn test_from_config_password() {
        let mut config = AuthConfig {
            policy: Some(AuthPolicy::Password),
            ..AuthConfig::default()
        };
        config
            .passwords
            .insert("alice".to_string(), "secret".to_string());
        let auth = from_config(&config).unwrap();
        assert_eq!(auth.methods(), vec![AuthMethod::Password]);
    }
}
