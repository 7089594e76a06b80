//! Container ownership for sessions.
//!
//! - [`lifecycle`]: the per-session [`ContainerLifecycleManager`]
//! - [`cleanup`]: startup sweep of leftover managed containers

pub mod cleanup;
pub mod lifecycle;

pub use cleanup::{remove_managed, CleanupReport};
pub use lifecycle::{
    ContainerControl, ContainerHandle, ContainerLifecycleManager, ContainerState,
    LifecycleTimeouts,
};
