//! Removal of containers left behind by a previous gateway process.

use std::time::Duration;

use runtime::{ContainerId, ContainerRuntime};
use tokio::time::timeout;
use tracing::{info, warn};

/// Result of a cleanup sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Managed containers found.
    pub found: usize,
    /// Containers removed.
    pub removed: usize,
    /// Containers that could not be removed, with the reason.
    pub failed: Vec<(ContainerId, String)>,
}

/// Kills and removes every container carrying the management label.
///
/// Only listing is fatal; individual removal failures are collected in the
/// report.
pub async fn remove_managed(
    runtime: &dyn ContainerRuntime,
    limit: Duration,
) -> runtime::Result<CleanupReport> {
    let ids = runtime.list_managed().await?;
    let mut report = CleanupReport {
        found: ids.len(),
        ..CleanupReport::default()
    };

    for id in ids {
        if let Ok(Err(err)) = timeout(limit, runtime.kill(&id)).await {
            if !err.is_not_found() {
                warn!(container_id = %id, "Kill of leftover container failed: {}", err);
            }
        }
        match timeout(limit, runtime.remove(&id)).await {
            Ok(Ok(())) => {
                info!(container_id = %id, "Removed leftover container");
                report.removed += 1;
            }
            Ok(Err(err)) => {
                warn!(container_id = %id, "Could not remove leftover container: {}", err);
                report.failed.push((id, err.to_string()));
            }
            Err(_) => {
                warn!(container_id = %id, "Removing leftover container timed out");
                report.failed.push((id, format!("remove timed out after {limit:?}")));
            }
        }
    }

    Ok(report)
}
