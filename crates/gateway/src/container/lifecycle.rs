//! Lifecycle of the single container backing one session.
//!
//! A [`ContainerLifecycleManager`] is created per session and realizes at
//! most one container. It moves through
//! `Created → Running → Attached → Stopping → Removed`, never backwards.
//!
//! Whatever happens during [`acquire`](ContainerLifecycleManager::acquire),
//! a partially created container is removed before the error is returned.
//! [`release`](ContainerLifecycleManager::release) may be called any number
//! of times; once the container is removed further calls do nothing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use runtime::{AttachedIo, ContainerId, ContainerRuntime, ContainerSpec, RuntimeError};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{ProvisionError, TeardownError};

/// Extra time granted on top of the stop grace period before killing.
const STOP_MARGIN: Duration = Duration::from_secs(2);

/// Container lifecycle states. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContainerState {
    Created,
    Running,
    Attached,
    Stopping,
    Removed,
}

/// Bounds on every runtime call the manager makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimeouts {
    /// Pull + create + start + attach.
    pub acquire: Duration,
    /// Grace period passed to the runtime's stop.
    pub stop_grace: Duration,
    /// How long to wait for stop before killing.
    pub stop: Duration,
    /// Bound on kill and on remove.
    pub remove: Duration,
}

impl LifecycleTimeouts {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            acquire: config.acquire_timeout(),
            stop_grace: config.stop_grace(),
            stop: config.stop_grace() + STOP_MARGIN,
            remove: config.remove_timeout(),
        }
    }
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Control side of an attached container: resize, signal and wait.
#[derive(Clone)]
pub struct ContainerControl {
    runtime: Arc<dyn ContainerRuntime>,
    id: ContainerId,
    tty: bool,
}

impl ContainerControl {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the process has a TTY.
    pub fn tty(&self) -> bool {
        self.tty
    }

    /// Waits for the process to exit and returns its status.
    pub async fn wait(&self) -> runtime::Result<i64> {
        self.runtime.wait(&self.id).await
    }
}

impl fmt::Debug for ContainerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerControl")
            .field("id", &self.id)
            .field("tty", &self.tty)
            .finish()
    }
}

/// A running container with its attached streams.
#[derive(Debug)]
pub struct ContainerHandle {
    pub io: AttachedIo,
    pub control: ContainerControl,
}

impl ContainerHandle {
    pub fn id(&self) -> &str {
        self.control.id()
    }

    pub fn into_parts(self) -> (AttachedIo, ContainerControl) {
        (self.io, self.control)
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Name of the container being provisioned; set once.
    name: Option<String>,
    /// Runtime id, known once `create` returned.
    id: Option<ContainerId>,
    state: Option<ContainerState>,
}

impl Slot {
    fn advance(&mut self, next: ContainerState) {
        if self.state.map_or(true, |current| current < next) {
            self.state = Some(next);
        }
    }
}

/// Owns the container of one session.
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    timeouts: LifecycleTimeouts,
    slot: Arc<Mutex<Slot>>,
}

impl ContainerLifecycleManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeouts: LifecycleTimeouts) -> Self {
        Self {
            runtime,
            timeouts,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Current state, `None` before anything was created.
    pub async fn state(&self) -> Option<ContainerState> {
        self.slot.lock().await.state
    }

    /// Runtime id of the container, once created.
    pub async fn container_id(&self) -> Option<ContainerId> {
        self.slot.lock().await.id.clone()
    }

    /// Creates, starts and attaches a container for `spec`.
    ///
    /// Fails with [`ProvisionError`] on any runtime failure, on timeout or
    /// when `cancel` fires; the container is removed before returning.
    pub async fn acquire(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<ContainerHandle, ProvisionError> {
        {
            let mut slot = self.slot.lock().await;
            if slot.name.is_some() {
                return Err(ProvisionError::AlreadyAcquired);
            }
            slot.name = Some(spec.name.clone());
        }

        let limit = self.timeouts.acquire;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
            provisioned = timeout(limit, self.provision(spec)) => {
                provisioned.unwrap_or(Err(ProvisionError::Timeout(limit)))
            }
        };

        if let Err(err) = &result {
            warn!(container = %spec.name, "Provisioning failed: {}", err);
            if let Err(teardown) = self.release().await {
                error!("Cleanup after failed provisioning failed: {}", teardown);
            }
        }
        result
    }

    async fn provision(&self, spec: &ContainerSpec) -> Result<ContainerHandle, ProvisionError> {
        self.runtime
            .ensure_image(&spec.image)
            .await
            .map_err(|source| ProvisionError::Pull {
                image: spec.image.clone(),
                source,
            })?;

        // Runs detached so a create that outlives this call is still
        // recorded, or removed if the slot was released meanwhile.
        let creating = tokio::spawn(record_create(
            Arc::clone(&self.runtime),
            Arc::clone(&self.slot),
            spec.clone(),
            self.timeouts.remove,
        ));
        let id = creating
            .await
            .map_err(|e| ProvisionError::Create(RuntimeError::Api {
                status: 0,
                message: format!("create task failed: {e}"),
            }))?
            .map_err(ProvisionError::Create)?;
        debug!(container_id = %id, name = %spec.name, "Created container");

        self.runtime
            .start(&id)
            .await
            .map_err(|source| ProvisionError::Start {
                id: id.clone(),
                source,
            })?;
        self.advance(ContainerState::Running).await;

        let io = self
            .runtime
            .attach(&id)
            .await
            .map_err(|source| ProvisionError::Attach {
                id: id.clone(),
                source,
            })?;
        self.advance(ContainerState::Attached).await;

        info!(container_id = %id, image = %spec.image, tty = spec.tty, "Container attached");
        Ok(ContainerHandle {
            io,
            control: ContainerControl {
                runtime: Arc::clone(&self.runtime),
                id,
                tty: spec.tty,
            },
        })
    }

    async fn advance(&self, next: ContainerState) {
        self.slot.lock().await.advance(next);
    }

    async fn is_attached(&self) -> bool {
        self.state().await == Some(ContainerState::Attached)
    }

    /// Propagates a terminal size change. Ignored without a TTY.
    pub async fn resize(
        &self,
        control: &ContainerControl,
        cols: u16,
        rows: u16,
    ) -> runtime::Result<()> {
        if !control.tty || cols == 0 || rows == 0 || !self.is_attached().await {
            return Ok(());
        }
        debug!(container_id = %control.id, cols, rows, "Resizing terminal");
        self.runtime.resize(&control.id, cols, rows).await
    }

    /// Delivers a signal to the container's main process.
    pub async fn signal(&self, control: &ContainerControl, signal: &str) -> runtime::Result<()> {
        if !self.is_attached().await {
            return Ok(());
        }
        debug!(container_id = %control.id, signal, "Forwarding signal");
        self.runtime.signal(&control.id, signal).await
    }

    /// Stops and force-removes the container.
    ///
    /// Every runtime call is bounded, so this never blocks indefinitely. On
    /// error the state stays `Stopping` and a later call retries.
    pub async fn release(&self) -> Result<(), TeardownError> {
        let mut slot = self.slot.lock().await;
        if slot.state == Some(ContainerState::Removed) {
            return Ok(());
        }
        let target = match (&slot.id, &slot.name) {
            (Some(id), _) => id.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => return Ok(()),
        };
        slot.advance(ContainerState::Stopping);

        if slot.id.is_some() {
            self.stop_or_kill(&target).await;
        }

        match timeout(self.timeouts.remove, self.runtime.remove(&target)).await {
            Ok(Ok(())) => {
                slot.advance(ContainerState::Removed);
                info!(container = %target, "Container removed");
                Ok(())
            }
            Ok(Err(err)) => Err(TeardownError {
                container: target,
                reason: err.to_string(),
            }),
            Err(_) => Err(TeardownError {
                container: target,
                reason: format!("remove timed out after {:?}", self.timeouts.remove),
            }),
        }
    }

    async fn stop_or_kill(&self, id: &str) {
        let stopped = timeout(
            self.timeouts.stop,
            self.runtime.stop(id, self.timeouts.stop_grace),
        )
        .await;
        match stopped {
            Ok(Ok(())) => return,
            Ok(Err(err)) if err.is_not_found() => return,
            Ok(Err(err)) => warn!(container_id = %id, "Graceful stop failed: {}", err),
            Err(_) => warn!(
                container_id = %id,
                "Container did not stop within {:?}, killing",
                self.timeouts.stop
            ),
        }

        match timeout(self.timeouts.remove, self.runtime.kill(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(RuntimeError::NotFound(_))) => {}
            Ok(Err(err)) => warn!(container_id = %id, "Kill failed: {}", err),
            Err(_) => warn!(container_id = %id, "Kill timed out"),
        }
    }
}

/// Creates the container and records its id in `slot`. When the slot was
/// released while `create` was in flight, the late container is removed.
async fn record_create(
    runtime: Arc<dyn ContainerRuntime>,
    slot: Arc<Mutex<Slot>>,
    spec: ContainerSpec,
    remove_limit: Duration,
) -> runtime::Result<ContainerId> {
    let id = runtime.create(&spec).await?;
    let mut slot = slot.lock().await;
    if slot.state != Some(ContainerState::Removed) {
        slot.id = Some(id.clone());
        slot.advance(ContainerState::Created);
        return Ok(id);
    }
    drop(slot);

    warn!(container_id = %id, "Container created after its session was released, removing");
    match timeout(remove_limit, runtime.remove(&id)).await {
        Ok(Ok(())) => info!(container_id = %id, "Container removed"),
        Ok(Err(err)) => error!(container_id = %id, "Failed to remove late container: {}", err),
        Err(_) => error!(
            container_id = %id,
            "Removing late container timed out after {:?}", remove_limit
        ),
    }
    Err(RuntimeError::NotFound(spec.name))
}
