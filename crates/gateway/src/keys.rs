//! SSH host key management.

use std::path::Path;

use anyhow::{Context, Result};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, HashAlg, LineEnding};
use russh::keys::PrivateKey;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Loads the host key at `path`, generating an Ed25519 key there if the
/// file does not exist.
pub async fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        info!(
            "Loaded host key {} from {}",
            key.public_key().fingerprint(HashAlg::Sha256),
            path.display()
        );
        return Ok(key);
    }

    info!("Generating new Ed25519 host key");
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    // Mode is applied at creation, before any key bytes are written.
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("Failed to create host key file {}", path.display()))?;
    file.write_all(encoded.as_bytes())
        .await
        .with_context(|| format!("Failed to write host key to {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("Failed to write host key to {}", path.display()))?;

    info!(
        "Saved host key {} to {}",
        key.public_key().fingerprint(HashAlg::Sha256),
        path.display()
    );
    Ok(key)
}
