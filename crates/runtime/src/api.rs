//! The container-runtime capability.
//!
//! Everything the gateway needs from a container engine goes through
//! [`ContainerRuntime`]. The Docker Engine implementation lives in
//! [`crate::docker`], an in-memory one for tests in [`crate::memory`].

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::spec::{ContainerId, ContainerSpec};

/// One chunk of output read from an attached container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Standard output (or the combined TTY stream).
    Stdout(Bytes),
    /// Standard error; only produced when the container has no TTY.
    Stderr(Bytes),
}

impl OutputChunk {
    /// The chunk payload.
    pub fn bytes(&self) -> &Bytes {
        match self {
            OutputChunk::Stdout(bytes) | OutputChunk::Stderr(bytes) => bytes,
        }
    }
}

/// Output side of an attached container.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;

/// Input side of an attached container.
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Streams obtained by attaching to a container.
pub struct AttachedIo {
    /// Writes go to the process's stdin. Shutting it down closes stdin.
    pub stdin: InputSink,
    /// Stdout/stderr of the process. Ends when the process exits.
    pub output: OutputStream,
}

impl fmt::Debug for AttachedIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedIo").finish_non_exhaustive()
    }
}

/// Operations a container engine must provide.
///
/// Implementations must be cheap to share; the gateway holds one as
/// `Arc<dyn ContainerRuntime>` and calls it from many sessions at once.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Makes sure `image` is present locally, pulling it if missing.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Creates a container from `spec` and returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Attaches to the stdin/stdout/stderr of a running container.
    async fn attach(&self, id: &str) -> Result<AttachedIo>;

    /// Resizes the container's TTY.
    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()>;

    /// Delivers a signal (e.g. `"INT"`) to the container's main process.
    async fn signal(&self, id: &str, signal: &str) -> Result<()>;

    /// Waits for the main process to exit and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Asks the process to stop, killing it after `grace`.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Kills the container immediately.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Force-removes a container by id or name. Missing containers are not an error.
    async fn remove(&self, id_or_name: &str) -> Result<()>;

    /// Ids of all containers, running or not, that carry the management label.
    async fn list_managed(&self) -> Result<Vec<ContainerId>>;
}
