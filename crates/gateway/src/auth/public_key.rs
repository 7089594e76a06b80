//! Public-key allow list read from OpenSSH authorized_keys files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;

use super::{AuthMethod, AuthRequest, Authenticator, Credentials, Principal};
use crate::error::AuthenticationError;

/// Accepts any user presenting one of the listed keys.
///
/// Keys are compared by key data only; comments and options are ignored.
pub struct PublicKeyAllowList {
    keys: Vec<PublicKey>,
}

/// Parses one authorized_keys line, tolerating a leading options field.
fn parse_line(line: &str) -> Option<PublicKey> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Ok(key) = PublicKey::from_openssh(line) {
        return Some(key);
    }
    let (_options, rest) = line.split_once(char::is_whitespace)?;
    PublicKey::from_openssh(rest.trim_start()).ok()
}

impl PublicKeyAllowList {
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self { keys }
    }

    /// Parses authorized_keys content; unparsable lines are skipped.
    pub fn parse(contents: &str, origin: &Path) -> Vec<PublicKey> {
        contents
            .lines()
            .enumerate()
            .filter_map(|(n, line)| {
                let key = parse_line(line);
                if key.is_none() && !line.trim().is_empty() && !line.trim().starts_with('#') {
                    tracing::warn!("Skipping unparsable key at {}:{}", origin.display(), n + 1);
                }
                key
            })
            .collect()
    }

    /// Loads all keys from the given authorized_keys files.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut keys = Vec::new();
        for path in paths {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read authorized keys: {}", path.display()))?;
            keys.extend(Self::parse(&contents, path));
        }
        tracing::info!("Loaded {} authorized public keys", keys.len());
        Ok(Self::new(keys))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.key_data() == key.key_data())
    }
}

#[async_trait]
impl Authenticator for PublicKeyAllowList {
    fn methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::PublicKey]
    }

    async fn authenticate(
        &self,
        request: &AuthRequest<'_>,
    ) -> Result<Principal, AuthenticationError> {
        let Credentials::PublicKey(key) = request.credentials else {
            return Err(AuthenticationError::MethodNotAllowed(
                request.credentials.method().as_str(),
            ));
        };
        if self.contains(key) {
            tracing::debug!(
                user = %request.user,
                fingerprint = %key.fingerprint(HashAlg::Sha256),
                "public key matched"
            );
            Ok(Principal::new(request.user, AuthMethod::PublicKey))
        } else {
            Err(AuthenticationError::KeyNotAuthorized(request.user.to_string()))
        }
    }
}
