//! External auth scripts.
//!
//! A hook is an executable called as `HOOK <user> <password>` or
//! `HOOK <user> <openssh public key>`. It must exit 0 and print a JSON object:
//!
//! ```json
//! {"allowed": true, "message": "optional", "image-name": "ubuntu:24.04",
//!  "remote-user": "alice", "env": {"A": "1"}, "command": ["/bin/bash"]}
//! ```
//!
//! Everything besides `allowed` and `message` becomes the session's
//! [`SessionOverrides`]. A non-zero exit, a timeout or unparsable output
//! rejects the login.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::{AuthMethod, AuthRequest, Authenticator, Credentials, Principal, SessionOverrides};
use crate::error::AuthenticationError;

/// Decoded hook output.
#[derive(Debug, Deserialize)]
struct HookResponse {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    overrides: SessionOverrides,
}

/// Delegates authentication to external scripts.
pub struct HookAuthenticator {
    password_hook: Option<PathBuf>,
    public_key_hook: Option<PathBuf>,
    timeout: Duration,
}

impl HookAuthenticator {
    pub fn new(
        password_hook: Option<PathBuf>,
        public_key_hook: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            password_hook,
            public_key_hook,
            timeout,
        }
    }

    async fn run(
        &self,
        hook: &Path,
        user: &str,
        secret: &str,
    ) -> Result<HookResponse, AuthenticationError> {
        let child = Command::new(hook)
            .arg(user)
            .arg(secret)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                AuthenticationError::HookFailed(format!(
                    "{} timed out after {:?}",
                    hook.display(),
                    self.timeout
                ))
            })?
            .map_err(|e| AuthenticationError::HookFailed(format!("{}: {e}", hook.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthenticationError::HookFailed(format!(
                "{} exited with {}: {}",
                hook.display(),
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            AuthenticationError::HookFailed(format!("{} printed invalid JSON: {e}", hook.display()))
        })
    }
}

#[async_trait]
impl Authenticator for HookAuthenticator {
    fn methods(&self) -> Vec<AuthMethod> {
        let mut methods = Vec::new();
        if self.password_hook.is_some() {
            methods.push(AuthMethod::Password);
        }
        if self.public_key_hook.is_some() {
            methods.push(AuthMethod::PublicKey);
        }
        methods
    }

    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Principal, AuthenticationError> {
        let (hook, secret, method) = match request.credentials {
            Credentials::Password(password) => (
                self.password_hook.as_deref(),
                password.to_string(),
                AuthMethod::Password,
            ),
            Credentials::PublicKey(key) => {
                let openssh = key
                    .to_openssh()
                    .map_err(|e| AuthenticationError::HookFailed(e.to_string()))?;
                (self.public_key_hook.as_deref(), openssh, AuthMethod::PublicKey)
            }
            Credentials::None => (None, String::new(), AuthMethod::None),
        };
        let Some(hook) = hook else {
            return Err(AuthenticationError::MethodNotAllowed(method.as_str()));
        };

        let response = self.run(hook, request.user, &secret).await?;
        if !response.allowed {
            let reason = response
                .message
                .unwrap_or_else(|| format!("{} is not allowed", request.user));
            return Err(AuthenticationError::HookRejected(reason));
        }
        if let Some(message) = &response.message {
            tracing::debug!(user = %request.user, "auth hook: {}", message);
        }

        Ok(Principal {
            user: request.user.to_string(),
            method,
            overrides: response.overrides,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn password_attempt<'a>(user: &'a str, password: &'a str) -> AuthRequest<'a> {
        AuthRequest {
            user,
            peer: None,
            credentials: Credentials::Password(password),
        }
    }

    #[tokio::test]
    async fn test_hook_allows_with_overrides() {
        let dir = TempDir::new().unwrap();
        let hook = script(
            &dir,
            "allow.sh",
            r#"[ "$2" = "letmein" ] || { echo '{"allowed": false}'; exit 0; }
echo "{\"allowed\": true, \"image-name\": \"busybox\", \"remote-user\": \"$1-remote\", \"env\": {\"X\": \"1\"}}""#,
        );
        let auth = HookAuthenticator::new(Some(hook), None, Duration::from_secs(5));

        let principal = auth
            .authenticate(&password_attempt("alice", "letmein"))
            .await
            .unwrap();
        assert_eq!(principal.user, "alice");
        assert_eq!(principal.method, AuthMethod::Password);
        assert_eq!(principal.overrides.image_name.as_deref(), Some("busybox"));
        assert_eq!(principal.owner(), "alice-remote");
        assert_eq!(principal.overrides.env.get("X").unwrap(), "1");

        let err = auth
            .authenticate(&password_attempt("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::HookRejected(_)));
    }

    #[tokio::test]
    async fn test_hook_rejection_message() {
        let dir = TempDir::new().unwrap();
        let hook = script(
            &dir,
            "deny.sh",
            r#"echo '{"allowed": false, "message": "account locked"}'"#,
        );
        let auth = HookAuthenticator::new(Some(hook), None, Duration::from_secs(5));
        let err = auth
            .authenticate(&password_attempt("bob", "x"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuthenticationError::HookRejected("account locked".to_string())
        );
    }

    #[tokio::test]
    async fn test_hook_nonzero_exit_rejects() {
        let dir = TempDir::new().unwrap();
        let hook = script(&dir, "fail.sh", "echo '{\"allowed\": true}'; exit 1");
        let auth = HookAuthenticator::new(Some(hook), None, Duration::from_secs(5));
        let err = auth
            .authenticate(&password_attempt("bob", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::HookFailed(_)));
    }

    #[tokio::test]
    async fn test_hook_garbage_rejects() {
        let dir = TempDir::new().unwrap();
        let hook = script(&dir, "garbage.sh", "echo not-json");
        let auth = HookAuthenticator::new(Some(hook), None, Duration::from_secs(5));
        let err = auth
            .authenticate(&password_attempt("bob", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthenticationError::HookFailed(_)));
    }

    #[tokio::test]
    async fn test_hook_timeout_rejects() {
        let dir = TempDir::new().unwrap();
        let hook = script(&dir, "slow.sh", "sleep 5; echo '{\"allowed\": true}'");
        let auth = HookAuthenticator::new(Some(hook), None, Duration::from_millis(200));
        let err = auth
            .authenticate(&password_attempt("bob", "x"))
            .await
            .unwrap_err();
        match err {
            AuthenticationError::HookFailed(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_method_without_hook_not_allowed() {
        let auth = HookAuthenticator::new(None, None, Duration::from_secs(1));
        assert!(auth.methods().is_empty());
        let err = auth
            .authenticate(&password_attempt("bob", "x"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthenticationError::MethodNotAllowed("password"));
    }
}
