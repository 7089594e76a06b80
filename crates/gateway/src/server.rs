//! SSH server: accepts connections, authenticates them and hands each
//! session channel to a [`SessionController`].
//!
//! Every accepted TCP connection runs in its own task tracked by the
//! gateway's [`TaskTracker`]. A connection carries at most one session
//! channel; its `shell` or `exec` request starts the session.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Session as SshSession};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet, Sig, SshId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::{AuthMethod, AuthRequest, Authenticator, Credentials, Principal};
use crate::config::is_valid_env_key;
use crate::error::BridgeError;
use crate::orchestrator::GatewayEvent;
use crate::session::{
    new_session_id, ChannelEvent, ClientChannel, Program, PtyRequest, Session, SessionContext,
    SessionController, SessionId, TerminalRequest,
};

/// Capacity of the per-session queue of client events.
const EVENT_BUFFER: usize = 256;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection.
pub struct ServerContext {
    pub authenticator: Arc<dyn Authenticator>,
    pub sessions: Arc<SessionContext>,
    /// Failed attempts allowed per connection.
    pub max_attempts: u32,
    /// Tracks connection and session tasks.
    pub tasks: TaskTracker,
    /// Fired last during shutdown; drops connections still open.
    pub closing: CancellationToken,
}

/// Output side of a session channel, backed by a russh session handle.
#[derive(Clone)]
pub struct RusshChannel {
    handle: russh::server::Handle,
    id: ChannelId,
}

impl RusshChannel {
    pub fn new(handle: russh::server::Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl ClientChannel for RusshChannel {
    async fn data(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| BridgeError::Channel("client connection is gone".to_string()))
    }

    async fn stderr(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.handle
            .extended_data(self.id, 1, CryptoVec::from_slice(data))
            .await
            .map_err(|_| BridgeError::Channel("client connection is gone".to_string()))
    }

    async fn exit_status(&self, code: u32) -> Result<(), BridgeError> {
        self.handle
            .exit_status_request(self.id, code)
            .await
            .map_err(|_| BridgeError::Channel("could not send exit-status".to_string()))
    }

    async fn eof(&self) -> Result<(), BridgeError> {
        self.handle
            .eof(self.id)
            .await
            .map_err(|_| BridgeError::Channel("could not send eof".to_string()))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.handle
            .close(self.id)
            .await
            .map_err(|_| BridgeError::Channel("could not close channel".to_string()))
    }
}

/// The session channel of a connection, before and after its program starts.
struct PendingChannel {
    id: ChannelId,
    pty: Option<PtyRequest>,
    env: BTreeMap<String, String>,
    /// Set once the session is running.
    events: Option<mpsc::Sender<ChannelEvent>>,
}

/// Per-connection SSH handler.
pub struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    session_id: SessionId,
    peer: SocketAddr,
    failures: u32,
    principal: Option<Principal>,
    channel: Option<PendingChannel>,
    /// Cancelled when the connection goes away.
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ServerContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            session_id: new_session_id(),
            peer,
            failures: 0,
            principal: None,
            channel: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Authenticated principal, if any.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Failed authentication attempts on this connection.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn accepts(&self, method: AuthMethod) -> bool {
        self.ctx.authenticator.methods().contains(&method)
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(method_set(&self.ctx.authenticator.methods())),
            partial_success: false,
        }
    }

    /// Runs one credential check and accounts for failures.
    async fn check(&mut self, user: &str, credentials: Credentials<'_>) -> Result<Auth> {
        let method = credentials.method();
        let request = AuthRequest {
            user,
            peer: Some(self.peer),
            credentials,
        };

        match self.ctx.authenticator.authenticate(&request).await {
            Ok(principal) => {
                info!(
                    session_id = %self.session_id,
                    "Accepted {} for {} from {}",
                    method.as_str(),
                    user,
                    self.peer
                );
                self.principal = Some(principal);
                Ok(Auth::Accept)
            }
            Err(err) => {
                self.failures += 1;
                self.ctx.sessions.registry.record_auth_failure();
                warn!(
                    attempt = self.failures,
                    "Failed {} for {} from {}: {}",
                    method.as_str(),
                    user,
                    self.peer,
                    err
                );
                self.ctx.sessions.emit(GatewayEvent::AuthenticationFailed {
                    user: user.to_string(),
                    peer: self.peer,
                    method,
                    reason: err.to_string(),
                });
                if self.failures >= self.ctx.max_attempts {
                    anyhow::bail!(
                        "Too many authentication failures for {} from {}",
                        user,
                        self.peer
                    );
                }
                Ok(self.reject())
            }
        }
    }

    /// The connection's session channel, if `id` is it.
    fn pending(&mut self, id: ChannelId) -> Option<&mut PendingChannel> {
        self.channel.as_mut().filter(|pending| pending.id == id)
    }

    /// Queues an event for the running session on `id`.
    async fn forward(&mut self, id: ChannelId, event: ChannelEvent) {
        let Some(tx) = self.pending(id).and_then(|pending| pending.events.clone()) else {
            return;
        };
        if tx.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "Session already finished, event dropped");
        }
    }

    /// Starts the session for a `shell` or `exec` request.
    fn start_session(&mut self, id: ChannelId, program: Program, session: &mut SshSession) {
        let Some(principal) = self.principal.clone() else {
            let _ = session.channel_failure(id);
            return;
        };
        let Some(pending) = self.channel.as_mut().filter(|pending| pending.id == id) else {
            let _ = session.channel_failure(id);
            return;
        };
        if pending.events.is_some() {
            warn!(session_id = %self.session_id, "Second program request on one channel refused");
            let _ = session.channel_failure(id);
            return;
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        pending.events = Some(tx);
        let request = TerminalRequest {
            pty: pending.pty.clone(),
            env: std::mem::take(&mut pending.env),
            program,
        };

        let record = Session::new(self.session_id.clone(), principal, Some(self.peer), request);
        let controller = SessionController::new(
            record,
            RusshChannel::new(session.handle(), id),
            rx,
            self.cancel.clone(),
            Arc::clone(&self.ctx.sessions),
        );
        let _ = session.channel_success(id);

        let session_id = self.session_id.clone();
        self.ctx.tasks.spawn(async move {
            if let Err(err) = controller.run().await {
                debug!(session_id = %session_id, "Session ended with error: {}", err);
            }
        });
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
        debug!(session_id = %self.session_id, peer = %self.peer, "Connection closed");
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if !self.accepts(AuthMethod::None) {
            // Clients probe with `none` first; that is not a failed attempt.
            return Ok(self.reject());
        }
        self.check(user, Credentials::None).await
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.check(user, Credentials::Password(password)).await
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.accepts(AuthMethod::PublicKey) {
            debug!("Public key offered by {} from {}", user, self.peer);
            Ok(Auth::Accept)
        } else {
            Ok(self.reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.check(user, Credentials::PublicKey(public_key)).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        if self.principal.is_none() || self.channel.is_some() {
            debug!(session_id = %self.session_id, "Extra session channel refused");
            return Ok(false);
        }
        debug!(session_id = %self.session_id, "Session channel opened: {:?}", channel.id());
        self.channel = Some(PendingChannel {
            id: channel.id(),
            pty: None,
            env: BTreeMap::new(),
            events: None,
        });
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        debug!(
            session_id = %self.session_id,
            "PTY request: term={}, cols={}, rows={}",
            term,
            col_width,
            row_height
        );
        match self.pending(channel) {
            Some(pending) if pending.events.is_none() => {
                pending.pty = Some(PtyRequest {
                    term: term.to_string(),
                    cols: clamp_dimension(col_width),
                    rows: clamp_dimension(row_height),
                });
                let _ = session.channel_success(channel);
            }
            _ => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let valid = is_valid_env_key(variable_name);
        match self.pending(channel) {
            Some(pending) if pending.events.is_none() && valid => {
                pending
                    .env
                    .insert(variable_name.to_string(), variable_value.to_string());
                let _ = session.channel_success(channel);
            }
            _ => {
                debug!(session_id = %self.session_id, "Env request {} refused", variable_name);
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        info!(session_id = %self.session_id, "Shell request on channel {:?}", channel);
        self.start_session(channel, Program::Shell, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        info!(session_id = %self.session_id, "Exec request on channel {:?}: {}", channel, command);
        self.start_session(channel, Program::Exec(command), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        debug!(session_id = %self.session_id, "Subsystem {} refused", name);
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let (cols, rows) = (clamp_dimension(col_width), clamp_dimension(row_height));
        if let Some(pending) = self.pending(channel) {
            if pending.events.is_none() {
                if let Some(pty) = pending.pty.as_mut() {
                    pty.cols = cols;
                    pty.rows = rows;
                }
                return Ok(());
            }
        }
        self.forward(channel, ChannelEvent::Resize { cols, rows }).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Signal(signal_name(&signal)))
            .await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Data(Bytes::copy_from_slice(data)))
            .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        debug!(session_id = %self.session_id, "Channel EOF: {:?}", channel);
        self.forward(channel, ChannelEvent::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        debug!(session_id = %self.session_id, "Channel closed: {:?}", channel);
        self.forward(channel, ChannelEvent::Close).await;
        if let Some(pending) = self.pending(channel) {
            pending.events = None;
        }
        Ok(())
    }
}

/// Accepts SSH connections until told to stop.
pub struct ServerListener {
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    ctx: Arc<ServerContext>,
}

impl ServerListener {
    /// Binds the listen address. Failing to bind is fatal for the gateway.
    pub async fn bind(
        addr: &str,
        config: russh::server::Config,
        ctx: Arc<ServerContext>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind SSH listener on {}", addr))?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            ctx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Runs the accept loop until `shutdown` fires.
    ///
    /// Connections already accepted keep running; they end when their
    /// sessions do or when the server context's `closing` token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("SSH server listening on {}", addr);
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("Failed to accept connection: {}", err);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer, "Could not set TCP_NODELAY: {}", err);
            }
            debug!(peer = %peer, "Connection accepted");

            let handler = ConnectionHandler::new(Arc::clone(&self.ctx), peer);
            let config = Arc::clone(&self.config);
            let closing = self.ctx.closing.clone();
            self.ctx.tasks.spawn(async move {
                let running = match russh::server::run_stream(config, stream, handler).await {
                    Ok(running) => running,
                    Err(err) => {
                        warn!(peer = %peer, "SSH handshake failed: {}", err);
                        return;
                    }
                };
                tokio::select! {
                    result = running => {
                        if let Err(err) = result {
                            debug!(peer = %peer, "SSH connection ended: {}", err);
                        }
                    }
                    _ = closing.cancelled() => {
                        debug!(peer = %peer, "SSH connection dropped at shutdown");
                    }
                }
            });
        }

        info!("SSH listener stopped");
    }
}

/// russh server configuration for the given host key and auth methods.
pub fn russh_config(
    key: PrivateKey,
    methods: &[AuthMethod],
    max_attempts: u32,
    inactivity_timeout: Option<Duration>,
) -> russh::server::Config {
    russh::server::Config {
        server_id: SshId::Standard(format!("SSH-2.0-sshbox_{}", env!("CARGO_PKG_VERSION"))),
        methods: method_set(methods),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        max_auth_attempts: max_attempts as usize,
        inactivity_timeout,
        keys: vec![key],
        ..Default::default()
    }
}

fn method_set(methods: &[AuthMethod]) -> MethodSet {
    let kinds: Vec<MethodKind> = methods
        .iter()
        .map(|method| match method {
            AuthMethod::None => MethodKind::None,
            AuthMethod::Password => MethodKind::Password,
            AuthMethod::PublicKey => MethodKind::PublicKey,
        })
        .collect();
    MethodSet::from(kinds.as_slice())
}

/// Signal name without the `SIG` prefix, as the container runtime expects.
fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.trim_start_matches("SIG").to_string(),
        other => format!("{other:?}"),
    }
}

fn clamp_dimension(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}
