//! Drives one session from registration to container removal.
//!
//! ```text
//! register ─▶ build spec ─▶ acquire ─▶ banner ─▶ bridge ─▶ exit-status
//!                                                              │
//!                        deregister ◀── release ◀──────────────┘
//! ```
//!
//! The per-session work runs in its own task. If that task panics the
//! controller still releases the container and tells the client, so a
//! session never leaves a container behind.

use std::sync::Arc;

use runtime::{ContainerId, ContainerRuntime};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::{BridgeOutcome, ChannelEvent, ClientChannel, EndReason, SessionBridge};
use super::registry::SessionRegistry;
use super::{Session, SessionId};
use crate::container::{ContainerLifecycleManager, LifecycleTimeouts};
use crate::error::SessionError;
use crate::orchestrator::GatewayEvent;
use crate::spec_builder::ContainerSpecBuilder;

/// Shared collaborators of every session.
pub struct SessionContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub builder: ContainerSpecBuilder,
    pub registry: Arc<SessionRegistry>,
    pub timeouts: LifecycleTimeouts,
    /// Text written to the client before the program starts.
    pub banner: Option<String>,
    pub events: broadcast::Sender<GatewayEvent>,
}

impl SessionContext {
    pub(crate) fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: SessionId,
    /// Container that served the session, if one was created.
    pub container_id: Option<ContainerId>,
    pub reason: EndReason,
    pub exit_code: Option<i64>,
}

/// Owns one session for its whole life.
pub struct SessionController<C> {
    session: Session,
    channel: C,
    events: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
    ctx: Arc<SessionContext>,
}

impl<C: ClientChannel + Clone + 'static> SessionController<C> {
    /// `cancel` ends the session; it is fired on disconnect and on shutdown.
    pub fn new(
        session: Session,
        channel: C,
        events: mpsc::Receiver<ChannelEvent>,
        cancel: CancellationToken,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Self {
            session,
            channel,
            events,
            cancel,
            ctx,
        }
    }

    /// Runs the session to completion.
    ///
    /// The container is removed, or its removal failure recorded, before
    /// this returns.
    pub async fn run(self) -> Result<SessionReport, SessionError> {
        let Self {
            session,
            channel,
            events,
            cancel,
            ctx,
        } = self;
        let id = session.id.clone();
        let user = session.principal.owner().to_string();

        let guard = match ctx.registry.register(&session, cancel.clone()) {
            Ok(guard) => guard,
            Err(err) => {
                let err = SessionError::from(err);
                warn!(session_id = %id, user = %user, "Session refused: {}", err);
                report_failure(&channel, &err).await;
                return Err(err);
            }
        };
        info!(session_id = %id, user = %user, "Session started");
        ctx.emit(GatewayEvent::SessionStarted {
            session_id: id.clone(),
            user: user.clone(),
        });

        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            Arc::clone(&ctx.runtime),
            ctx.timeouts,
        ));
        let task = tokio::spawn(drive(
            session,
            channel.clone(),
            events,
            Arc::clone(&ctx),
            Arc::clone(&lifecycle),
            cancel,
        ));
        let mut outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(session_id = %id, "Session task died: {}", join_err);
                let err = SessionError::Aborted(join_err.to_string());
                report_failure(&channel, &err).await;
                Err(err)
            }
        };

        if let Err(teardown) = lifecycle.release().await {
            error!(session_id = %id, "Container left behind: {}", teardown);
            ctx.registry.record_teardown_failure();
            if outcome.is_ok() {
                outcome = Err(teardown.into());
            }
        }

        drop(guard);
        ctx.emit(GatewayEvent::SessionEnded {
            session_id: id.clone(),
            user,
            exit_code: outcome.as_ref().ok().and_then(|report| report.exit_code),
        });
        debug!(session_id = %id, "Session closed");
        outcome
    }
}

/// Everything between registration and release.
async fn drive<C: ClientChannel>(
    session: Session,
    channel: C,
    mut events: mpsc::Receiver<ChannelEvent>,
    ctx: Arc<SessionContext>,
    lifecycle: Arc<ContainerLifecycleManager>,
    cancel: CancellationToken,
) -> Result<SessionReport, SessionError> {
    let result = serve(&session, &channel, &mut events, &ctx, &lifecycle, &cancel).await;
    let container_id = lifecycle.container_id().await;
    let report = |outcome: BridgeOutcome| SessionReport {
        session_id: session.id.clone(),
        container_id: container_id.clone(),
        reason: outcome.reason,
        exit_code: outcome.exit_code,
    };

    match result {
        Ok(outcome) => {
            match outcome.reason {
                EndReason::ProcessExited => {
                    if let Some(code) = outcome.exit_code {
                        let _ = channel.exit_status(exit_status(code)).await;
                    }
                    let _ = channel.eof().await;
                }
                EndReason::Cancelled if ctx.registry.is_draining() => {
                    let _ = channel.stderr(b"\r\nsshbox: server is shutting down\r\n").await;
                }
                EndReason::Cancelled | EndReason::ClientClosed => {}
            }
            let _ = channel.close().await;
            info!(
                session_id = %session.id,
                reason = ?outcome.reason,
                exit_code = ?outcome.exit_code,
                "Session finished"
            );
            Ok(report(outcome))
        }
        Err(SessionError::Bridge(err)) if err.is_disconnect() => {
            info!(session_id = %session.id, "Client went away: {}", err);
            let _ = channel.close().await;
            Ok(report(BridgeOutcome {
                reason: EndReason::ClientClosed,
                exit_code: None,
            }))
        }
        Err(err) => {
            warn!(session_id = %session.id, "Session failed: {}", err);
            report_failure(&channel, &err).await;
            Err(err)
        }
    }
}

/// Build, acquire, greet and bridge.
async fn serve<C: ClientChannel>(
    session: &Session,
    channel: &C,
    events: &mut mpsc::Receiver<ChannelEvent>,
    ctx: &SessionContext,
    lifecycle: &ContainerLifecycleManager,
    cancel: &CancellationToken,
) -> Result<BridgeOutcome, SessionError> {
    let spec = ctx.builder.build(session)?;
    debug!(session_id = %session.id, image = %spec.image, command = ?spec.command, "Built container spec");

    let handle = lifecycle.acquire(&spec, cancel).await?;
    info!(session_id = %session.id, container_id = %handle.id(), "Session attached");

    if let Some(banner) = &ctx.banner {
        channel.data(terminal_text(banner).as_bytes()).await?;
    }
    if let Some(pty) = &session.request.pty {
        if let Err(err) = lifecycle.resize(&handle.control, pty.cols, pty.rows).await {
            warn!(session_id = %session.id, "Initial resize failed: {}", err);
        }
    }

    let outcome = SessionBridge::new(channel, lifecycle)
        .run(handle, events, cancel)
        .await?;
    Ok(outcome)
}

/// Writes the error on stderr, reports status 1 and closes the channel.
async fn report_failure<C: ClientChannel + ?Sized>(channel: &C, err: &SessionError) {
    let message = format!("sshbox: {}\r\n", err.client_message());
    let _ = channel.stderr(message.as_bytes()).await;
    let _ = channel.exit_status(1).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
}

/// Rewrites bare `\n` as `\r\n` for raw terminals.
fn terminal_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// SSH exit statuses are unsigned; anything out of range becomes 255.
fn exit_status(code: i64) -> u32 {
    u8::try_from(code).map_or(255, u32::from)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use runtime::{Fault, MemoryRuntime, Operation};

    use super::*;
    use crate::auth::{AuthMethod, Principal};
    use crate::config::ContainerConfig;
    use crate::session::bridge::tests::RecordingChannel;
    use crate::session::{new_session_id, TerminalRequest};

    struct Harness {
        runtime: Arc<MemoryRuntime>,
        ctx: Arc<SessionContext>,
        events: broadcast::Receiver<GatewayEvent>,
    }

    fn harness(config: ContainerConfig, banner: Option<&str>) -> Harness {
        let runtime = Arc::new(MemoryRuntime::new());
        let (events_tx, events) = broadcast::channel(64);
        let ctx = Arc::new(SessionContext {
            runtime: runtime.clone(),
            builder: ContainerSpecBuilder::new(config),
            registry: Arc::new(SessionRegistry::new(8)),
            timeouts: LifecycleTimeouts {
                acquire: Duration::from_millis(300),
                stop_grace: Duration::ZERO,
                stop: Duration::from_millis(100),
                remove: Duration::from_millis(300),
            },
            banner: banner.map(str::to_string),
            events: events_tx,
        });
        Harness {
            runtime,
            ctx,
            events,
        }
    }

    fn controller(
        h: &Harness,
        request: TerminalRequest,
    ) -> (
        SessionController<RecordingChannel>,
        RecordingChannel,
        mpsc::Sender<ChannelEvent>,
    ) {
        let session = Session::new(
            new_session_id(),
            Principal::new("alice", AuthMethod::Password),
            None,
            request,
        );
        let channel = RecordingChannel::default();
        let (tx, rx) = mpsc::channel(16);
        let controller = SessionController::new(
            session,
            channel.clone(),
            rx,
            CancellationToken::new(),
            Arc::clone(&h.ctx),
        );
        (controller, channel, tx)
    }

    fn data(text: &str) -> ChannelEvent {
        ChannelEvent::Data(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[tokio::test]
    async fn test_shell_session_end_to_end() {
        let mut h = harness(ContainerConfig::default(), None);
        let (controller, channel, tx) =
            controller(&h, TerminalRequest::shell().with_pty("xterm", 80, 24));
        tx.send(data("echo hi\n")).await.unwrap();
        tx.send(data("exit 0\n")).await.unwrap();

        let report = controller.run().await.unwrap();
        assert_eq!(report.reason, EndReason::ProcessExited);
        assert_eq!(report.exit_code, Some(0));
        assert!(report.container_id.is_some());
        assert_eq!(channel.stdout_text(), "hi\n");
        assert_eq!(channel.exit_status(), Some(0));
        assert!(channel.is_closed());

        assert_eq!(h.runtime.created(), 1);
        assert_eq!(h.runtime.removed(), 1);
        assert!(h.ctx.registry.is_empty());
        assert!(matches!(
            h.events.recv().await.unwrap(),
            GatewayEvent::SessionStarted { .. }
        ));
        assert!(matches!(
            h.events.recv().await.unwrap(),
            GatewayEvent::SessionEnded { exit_code: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_exec_exit_code_relayed() {
        let h = harness(ContainerConfig::default(), None);
        let (controller, channel, _tx) = controller(&h, TerminalRequest::exec("exit 42"));

        let report = controller.run().await.unwrap();
        assert_eq!(report.exit_code, Some(42));
        assert_eq!(channel.exit_status(), Some(42));
        assert_eq!(h.runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_banner_written_first() {
        let h = harness(ContainerConfig::default(), Some("Welcome\nbe nice\n"));
        let (controller, channel, _tx) = controller(&h, TerminalRequest::exec("echo ok"));

        controller.run().await.unwrap();
        assert_eq!(channel.stdout_text(), "Welcome\r\nbe nice\r\nok\n");
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let h = harness(
            ContainerConfig {
                allowed_images: vec!["ubuntu".to_string()],
                ..ContainerConfig::default()
            },
            None,
        );
        let (controller, channel, _tx) = controller(&h, TerminalRequest::shell());

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
        assert!(channel.stderr_text().contains("request refused"));
        assert_eq!(channel.exit_status(), Some(1));
        assert!(channel.is_closed());
        assert_eq!(h.runtime.created(), 0);
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_provision_failure_reported() {
        let h = harness(ContainerConfig::default(), None);
        h.runtime.inject(Operation::Start, Fault::Fail);
        let (controller, channel, _tx) = controller(&h, TerminalRequest::shell());

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, SessionError::Provision(_)));
        assert!(channel
            .stderr_text()
            .contains("could not start a container"));
        assert_eq!(h.runtime.created(), 1);
        assert_eq!(h.runtime.removed(), 1);
    }

    #[tokio::test]
    async fn test_client_disconnect_is_not_an_error() {
        let h = harness(ContainerConfig::default(), None);
        let (controller, channel, tx) = controller(&h, TerminalRequest::shell());
        tx.send(data("echo hi\n")).await.unwrap();
        tx.send(ChannelEvent::Close).await.unwrap();

        let report = controller.run().await.unwrap();
        assert_eq!(report.reason, EndReason::ClientClosed);
        assert_eq!(channel.exit_status(), None);
        assert_eq!(h.runtime.removed(), 1);
        assert_eq!(h.runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_teardown_failure_surfaces() {
        let h = harness(ContainerConfig::default(), None);
        h.runtime.inject(Operation::Remove, Fault::Fail);
        let (controller, _channel, _tx) = controller(&h, TerminalRequest::exec("echo x"));

        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, SessionError::Teardown(_)));
        assert_eq!(h.ctx.registry.teardown_failures(), 1);
        assert!(h.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_full_refuses() {
        let h = harness(ContainerConfig::default(), None);
        let ctx = Arc::new(SessionContext {
            runtime: h.ctx.runtime.clone(),
            builder: h.ctx.builder.clone(),
            registry: Arc::new(SessionRegistry::new(0)),
            timeouts: h.ctx.timeouts,
            banner: None,
            events: h.ctx.events.clone(),
        });
        let session = Session::new(
            new_session_id(),
            Principal::new("alice", AuthMethod::None),
            None,
            TerminalRequest::shell(),
        );
        let channel = RecordingChannel::default();
        let (_tx, rx) = mpsc::channel(1);
        let err = SessionController::new(session, channel.clone(), rx, CancellationToken::new(), ctx)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Registry(_)));
        assert!(channel.stderr_text().contains("session limit reached"));
        assert_eq!(h.runtime.created(), 0);
    }

    #[test]
    fn test_exit_status_range() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), 255);
        assert_eq!(exit_status(300), 255);
    }

    #[test]
    fn test_terminal_text() {
        assert_eq!(terminal_text("a\nb\r\nc"), "a\r\nb\r\nc");
    }
}
