//! # sshbox Gateway Library
//!
//! This crate provides the SSH gateway of sshbox: every SSH session gets a
//! fresh container that lives exactly as long as the session.
//!
//! ## Overview
//!
//! - **SSH Server**: accepts connections and authenticates them through a
//!   pluggable [`Authenticator`](auth::Authenticator) policy
//! - **Container Specs**: [`ContainerSpecBuilder`] turns the authenticated
//!   user and the negotiated terminal into a locked-down container spec
//! - **Container Lifecycle**: [`ContainerLifecycleManager`] creates, starts,
//!   attaches, stops and removes one container per session
//! - **I/O Bridge**: [`SessionBridge`] pumps bytes between the SSH channel and
//!   the container
//! - **Sessions**: [`SessionController`] drives a session end to end; the
//!   [`SessionRegistry`] tracks them for graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Gateway                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ServerListener ──▶ ConnectionHandler (auth, channel reqs)   │
//! │                            │                                 │
//! │                            ▼                                 │
//! │  SessionController ──▶ ContainerSpecBuilder                  │
//! │        │           ──▶ ContainerLifecycleManager ──┐         │
//! │        │           ──▶ SessionBridge               │         │
//! │        ▼                                           ▼         │
//! │  SessionRegistry                     Arc<dyn ContainerRuntime>│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gateway::{Config, Gateway};
//! use runtime::DockerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let gateway = Gateway::new(config, Arc::new(DockerRuntime::connect()?))?;
//!     let addr = gateway.start().await?;
//!     println!("listening on {addr}");
//!
//!     // Wait for shutdown signal...
//!
//!     gateway.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: Authentication policies
//! - [`config`]: Configuration management
//! - [`container`]: Container lifecycle and startup cleanup
//! - [`error`]: Error types
//! - [`keys`]: SSH host key
//! - [`orchestrator`]: Gateway orchestration
//! - [`server`]: SSH server
//! - [`session`]: Sessions, bridge and registry
//! - [`spec_builder`]: Container spec construction

pub mod auth;
pub mod config;
pub mod container;
pub mod error;
pub mod keys;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod spec_builder;

pub use config::Config;
pub use container::{ContainerLifecycleManager, ContainerState, LifecycleTimeouts};
pub use error::SessionError;
pub use orchestrator::{Gateway, GatewayEvent, GatewayState};
pub use server::{ServerContext, ServerListener};
pub use session::{
    Session, SessionBridge, SessionContext, SessionController, SessionRegistry, TerminalRequest,
};
pub use spec_builder::ContainerSpecBuilder;
