//! # sshbox Runtime Library
//!
//! This crate is the container-runtime boundary of sshbox: everything the
//! gateway knows about containers goes through it.
//!
//! ## Overview
//!
//! - **Container Specs**: [`ContainerSpec`], the immutable description of one
//!   session's container (image, process, environment, limits, mounts)
//! - **Runtime Capability**: [`ContainerRuntime`], the create/start/attach/
//!   resize/stop/remove operations the gateway drives
//! - **Docker Engine**: [`DockerRuntime`], the production implementation on
//!   top of bollard
//! - **In-Memory Runtime**: [`MemoryRuntime`], a fake with failure injection
//!   used by tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        gateway (sessions, bridge)       │
//! ├─────────────────────────────────────────┤
//! │      Arc<dyn ContainerRuntime>          │  create/start/attach/...
//! ├──────────────────────┬──────────────────┤
//! │    DockerRuntime     │  MemoryRuntime   │
//! │  (Engine API/socket) │   (in process)   │
//! └──────────────────────┴──────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use runtime::{ContainerRuntime, ContainerSpec, MemoryRuntime};
//!
//! # tokio_test();
//! # fn tokio_test() {
//! let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! rt.block_on(async {
//!     let runtime = MemoryRuntime::new();
//!     let spec = ContainerSpec {
//!         name: "sshbox-demo".to_string(),
//!         image: "alpine:latest".to_string(),
//!         command: vec!["/bin/sh".to_string()],
//!         ..Default::default()
//!     };
//!     let id = runtime.create(&spec).await.unwrap();
//!     runtime.start(&id).await.unwrap();
//!     runtime.remove(&id).await.unwrap();
//!     assert_eq!(runtime.live(), 0);
//! });
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`spec`]: Container specification types and management labels
//! - [`api`]: The runtime capability trait and attached I/O types
//! - [`docker`]: Docker Engine implementation
//! - [`memory`]: In-memory implementation with fault injection
//! - [`error`]: Error types

pub mod api;
pub mod docker;
pub mod error;
pub mod memory;
pub mod spec;

pub use api::{AttachedIo, ContainerRuntime, InputSink, OutputChunk, OutputStream};
pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use memory::{Fault, MemoryRuntime, Operation};
pub use spec::{
    ContainerId, ContainerSpec, Mount, NetworkPolicy, ResourceLimits, IMAGE_LABEL, MANAGED_LABEL,
    SESSION_LABEL, USER_LABEL,
};
