//! Gateway orchestrator for wiring together all components.
//!
//! The [`Gateway`] owns the container runtime handle, the session registry
//! and the SSH listener. `start` checks the runtime, removes leftovers of a
//! previous run, loads the host key and binds; `stop` drains every session
//! before returning.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use runtime::ContainerRuntime;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthMethod, Authenticator};
use crate::config::Config;
use crate::container::{remove_managed, LifecycleTimeouts};
use crate::keys::load_or_generate_host_key;
use crate::server::{russh_config, ServerContext, ServerListener};
use crate::session::{SessionContext, SessionId, SessionRegistry};
use crate::spec_builder::ContainerSpecBuilder;

/// Gateway state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Initial state, not started.
    Stopped,
    /// Checking the runtime and binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Draining sessions.
    ShuttingDown,
}

/// Events emitted by the gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Gateway state changed.
    StateChanged(GatewayState),
    /// A session was registered and is about to get its container.
    SessionStarted { session_id: SessionId, user: String },
    /// A session released its container.
    SessionEnded {
        session_id: SessionId,
        user: String,
        exit_code: Option<i64>,
    },
    /// A credential check failed.
    AuthenticationFailed {
        user: String,
        peer: SocketAddr,
        method: AuthMethod,
        reason: String,
    },
    /// Error occurred.
    Error { message: String },
}

/// The sshbox gateway.
pub struct Gateway {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<GatewayState>>,
    runtime: Arc<dyn ContainerRuntime>,
    authenticator: Arc<dyn Authenticator>,
    sessions: Arc<SessionContext>,
    /// Connection and session tasks.
    tasks: TaskTracker,
    /// Stops the accept loop.
    shutdown_token: CancellationToken,
    /// Drops connections still open after the drain.
    closing_token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    /// Event sender.
    event_tx: broadcast::Sender<GatewayEvent>,
}

impl Gateway {
    /// Creates a gateway. The configuration must already be validated.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let authenticator = auth::from_config(&config.auth)?;
        let (event_tx, _) = broadcast::channel(256);

        let sessions = Arc::new(SessionContext {
            runtime: Arc::clone(&runtime),
            builder: ContainerSpecBuilder::new(config.container.clone()),
            registry: Arc::new(SessionRegistry::new(config.session.max_sessions)),
            timeouts: LifecycleTimeouts::from_config(&config.session),
            banner: config.server.banner.clone(),
            events: event_tx.clone(),
        });

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            runtime,
            authenticator,
            sessions,
            tasks: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            closing_token: CancellationToken::new(),
            accept_task: Mutex::new(None),
            local_addr: RwLock::new(None),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Returns a receiver for gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.sessions.registry
    }

    /// Address the listener is bound to, once running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the gateway and returns the bound address.
    ///
    /// An unreachable container runtime or an unusable listen address is
    /// fatal; the gateway goes back to `Stopped`.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != GatewayState::Stopped {
                anyhow::bail!("Gateway is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Gateway was stopped and cannot be restarted");
            }
            *state = GatewayState::Starting;
        }
        self.emit_event(GatewayEvent::StateChanged(GatewayState::Starting));
        info!("Starting sshbox gateway...");

        match self.launch().await {
            Ok(addr) => {
                *self.local_addr.write().await = Some(addr);
                self.set_state(GatewayState::Running).await;
                info!("sshbox gateway started on {}", addr);
                Ok(addr)
            }
            Err(err) => {
                error!("Gateway failed to start: {:#}", err);
                self.emit_event(GatewayEvent::Error {
                    message: format!("{err:#}"),
                });
                self.set_state(GatewayState::Stopped).await;
                Err(err)
            }
        }
    }

    async fn launch(&self) -> Result<SocketAddr> {
        self.runtime
            .ping()
            .await
            .context("Container runtime is not reachable")?;
        debug!("Container runtime reachable");

        if self.config.server.cleanup_on_start {
            match remove_managed(&*self.runtime, self.config.session.remove_timeout()).await {
                Ok(report) if report.found > 0 => info!(
                    "Startup cleanup: {} leftover containers, {} removed, {} failed",
                    report.found,
                    report.removed,
                    report.failed.len()
                ),
                Ok(_) => debug!("Startup cleanup: nothing left over"),
                Err(err) => warn!("Startup cleanup failed: {}", err),
            }
        }

        let key = load_or_generate_host_key(&self.config.server.host_key_path()).await?;
        let ssh_config = russh_config(
            key,
            &self.authenticator.methods(),
            self.config.auth.max_attempts,
            self.config.server.inactivity_timeout(),
        );
        let ctx = Arc::new(ServerContext {
            authenticator: Arc::clone(&self.authenticator),
            sessions: Arc::clone(&self.sessions),
            max_attempts: self.config.auth.max_attempts,
            tasks: self.tasks.clone(),
            closing: self.closing_token.clone(),
        });

        let listener = ServerListener::bind(&self.config.server.listen_addr, ssh_config, ctx).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(listener.run(self.shutdown_token.clone()));
        *self.accept_task.lock().await = Some(handle);
        Ok(addr)
    }

    /// Stops the gateway gracefully.
    ///
    /// Stops accepting, cancels every session and waits up to
    /// `session.shutdown_grace_secs` for their containers to be released.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == GatewayState::Stopped {
                return Ok(());
            }
            if *state == GatewayState::ShuttingDown {
                anyhow::bail!("Gateway is already shutting down");
            }
            *state = GatewayState::ShuttingDown;
        }
        self.emit_event(GatewayEvent::StateChanged(GatewayState::ShuttingDown));
        info!("Stopping sshbox gateway...");

        self.shutdown_token.cancel();
        if let Some(handle) = self.accept_task.lock().await.take() {
            if let Err(err) = handle.await {
                warn!("Accept loop ended abnormally: {}", err);
            }
        }

        let grace = self.config.session.shutdown_grace();
        let report = self.sessions.registry.shutdown(grace).await;
        if report.remaining > 0 {
            self.emit_event(GatewayEvent::Error {
                message: format!(
                    "{} sessions did not finish within {:?}",
                    report.remaining, grace
                ),
            });
        }

        self.closing_token.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("Connection tasks still running after {:?}", grace);
        }

        let teardown_failures = self.sessions.registry.teardown_failures();
        if teardown_failures > 0 {
            warn!("{} containers could not be removed during this run", teardown_failures);
        }

        *self.local_addr.write().await = None;
        self.set_state(GatewayState::Stopped).await;
        info!(
            "sshbox gateway stopped ({} sessions served)",
            self.sessions.registry.total_sessions()
        );
        Ok(())
    }

    async fn set_state(&self, new_state: GatewayState) {
        *self.state.write().await = new_state;
        self.emit_event(GatewayEvent::StateChanged(new_state));
    }

    /// Emits a gateway event.
    fn emit_event(&self, event: GatewayEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthPolicy;
    use runtime::{ContainerSpec, Fault, MemoryRuntime, Operation};
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.server.data_dir = temp_dir.path().to_path_buf();
        config.auth.policy = Some(AuthPolicy::AllowAll);
        config.session.shutdown_grace_secs = 2;
        config
    }

    #[tokio::test]
    async fn test_gateway_creation() {
        let temp_dir = TempDir::new().unwrap();
        let gateway =
            Gateway::new(create_test_config(&temp_dir), Arc::new(MemoryRuntime::new())).unwrap();
        assert_eq!(gateway.state().await, GatewayState::Stopped);
        assert!(gateway.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_gateway_requires_auth_policy() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.auth.policy = None;
        assert!(Gateway::new(config, Arc::new(MemoryRuntime::new())).is_err());
    }

    #[tokio::test]
    async fn test_gateway_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let gateway =
            Gateway::new(create_test_config(&temp_dir), Arc::new(MemoryRuntime::new())).unwrap();
        let mut events = gateway.subscribe();

        let addr = gateway.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(gateway.state().await, GatewayState::Running);
        assert!(temp_dir.path().join("host_ed25519").exists());

        assert!(gateway.start().await.is_err());

        gateway.stop().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Stopped);
        assert!(gateway.registry().is_draining());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let GatewayEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                GatewayState::Starting,
                GatewayState::Running,
                GatewayState::ShuttingDown,
                GatewayState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let gateway =
            Gateway::new(create_test_config(&temp_dir), Arc::new(MemoryRuntime::new())).unwrap();
        gateway.stop().await.unwrap();
        assert_eq!(gateway.state().await, GatewayState::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.inject(Operation::Ping, Fault::Fail);
        let gateway = Gateway::new(create_test_config(&temp_dir), runtime).unwrap();

        let err = gateway.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("not reachable"));
        assert_eq!(gateway.state().await, GatewayState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = create_test_config(&temp_dir);
        config.server.listen_addr = blocker.local_addr().unwrap().to_string();
        let gateway = Gateway::new(config, Arc::new(MemoryRuntime::new())).unwrap();

        assert!(gateway.start().await.is_err());
        assert_eq!(gateway.state().await, GatewayState::Stopped);
    }

    #[tokio::test]
    async fn test_startup_cleanup_removes_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        let runtime = Arc::new(MemoryRuntime::new());
        let spec = ContainerSpec {
            name: "sshbox-leftover".to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["/bin/sh".to_string()],
            ..Default::default()
        };
        let id = runtime.create(&spec).await.unwrap();
        runtime.start(&id).await.unwrap();

        let gateway = Gateway::new(create_test_config(&temp_dir), runtime.clone()).unwrap();
        gateway.start().await.unwrap();
        assert_eq!(runtime.live(), 0);
        gateway.stop().await.unwrap();
    }
}
