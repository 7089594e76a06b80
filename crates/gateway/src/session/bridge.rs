//! Relay between an SSH session channel and an attached container.
//!
//! The bridge runs two pumps concurrently:
//!
//! ```text
//!   SSH channel ──ChannelEvent──▶ inbound ──▶ container stdin
//!                                    │
//!                                    ├──▶ resize / signal (ContainerLifecycleManager)
//!                                    │
//!   SSH channel ◀── data/stderr ── outbound ◀── container output
//! ```
//!
//! Whichever pump finishes first ends the bridge and the other one is
//! dropped with it. Cancellation ends both.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use runtime::{AttachedIo, OutputChunk};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::container::{ContainerHandle, ContainerLifecycleManager};
use crate::error::BridgeError;

/// How long to wait for the exit status once the output stream ended.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Input coming from the client side of the session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes for the process stdin.
    Data(Bytes),
    /// The client will send no more data.
    Eof,
    /// `window-change` request.
    Resize { cols: u16, rows: u16 },
    /// `signal` request, by name without the `SIG` prefix.
    Signal(String),
    /// The client closed the channel.
    Close,
}

/// Output side of an SSH session channel.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Sends bytes on the channel's stdout.
    async fn data(&self, data: &[u8]) -> Result<(), BridgeError>;

    /// Sends bytes as extended data (stderr).
    async fn stderr(&self, data: &[u8]) -> Result<(), BridgeError>;

    /// Reports the program's exit status.
    async fn exit_status(&self, code: u32) -> Result<(), BridgeError>;

    async fn eof(&self) -> Result<(), BridgeError>;

    async fn close(&self) -> Result<(), BridgeError>;
}

/// Why the bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The container closed its output.
    ProcessExited,
    /// The client closed the channel or the connection went away.
    ClientClosed,
    /// The session was cancelled.
    Cancelled,
}

/// Result of a finished bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOutcome {
    pub reason: EndReason,
    /// Exit status of the contained process, when it could be read.
    pub exit_code: Option<i64>,
}

/// Relays one session. Borrowed for the duration of [`run`](Self::run).
pub struct SessionBridge<'a, C: ?Sized> {
    channel: &'a C,
    lifecycle: &'a ContainerLifecycleManager,
    wait_timeout: Duration,
}

fn is_closed_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}

impl<'a, C: ClientChannel + ?Sized> SessionBridge<'a, C> {
    pub fn new(channel: &'a C, lifecycle: &'a ContainerLifecycleManager) -> Self {
        Self {
            channel,
            lifecycle,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Pumps until either side ends or `cancel` fires.
    pub async fn run(
        &self,
        handle: ContainerHandle,
        events: &mut mpsc::Receiver<ChannelEvent>,
        cancel: &CancellationToken,
    ) -> Result<BridgeOutcome, BridgeError> {
        let (AttachedIo { mut stdin, mut output }, control) = handle.into_parts();

        let inbound = async {
            let mut stdin_open = true;
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Data(bytes) if stdin_open => {
                        let written = match stdin.write_all(&bytes).await {
                            Ok(()) => stdin.flush().await,
                            Err(err) => Err(err),
                        };
                        match written {
                            Ok(()) => {}
                            Err(err) if is_closed_pipe(&err) => {
                                debug!(container_id = %control.id(), "Container stdin closed");
                                stdin_open = false;
                            }
                            Err(err) => return Err(BridgeError::Stdin(err)),
                        }
                    }
                    ChannelEvent::Data(_) => {}
                    ChannelEvent::Eof => {
                        if stdin_open {
                            stdin_open = false;
                            if let Err(err) = stdin.shutdown().await {
                                debug!("Closing container stdin failed: {}", err);
                            }
                        }
                    }
                    ChannelEvent::Resize { cols, rows } => {
                        if let Err(err) = self.lifecycle.resize(&control, cols, rows).await {
                            warn!(container_id = %control.id(), "Resize failed: {}", err);
                        }
                    }
                    ChannelEvent::Signal(name) => {
                        if let Err(err) = self.lifecycle.signal(&control, &name).await {
                            warn!(container_id = %control.id(), "Signal {} failed: {}", name, err);
                        }
                    }
                    ChannelEvent::Close => break,
                }
            }
            Ok::<_, BridgeError>(EndReason::ClientClosed)
        };

        let outbound = async {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(BridgeError::Output)? {
                    OutputChunk::Stdout(bytes) => self.channel.data(&bytes).await?,
                    OutputChunk::Stderr(bytes) => self.channel.stderr(&bytes).await?,
                }
            }
            Ok::<_, BridgeError>(EndReason::ProcessExited)
        };

        let reason = tokio::select! {
            reason = inbound => reason?,
            reason = outbound => reason?,
            _ = cancel.cancelled() => EndReason::Cancelled,
        };
        debug!(container_id = %control.id(), ?reason, "Bridge finished");

        let exit_code = if reason == EndReason::ProcessExited {
            match timeout(self.wait_timeout, control.wait()).await {
                Ok(Ok(code)) => Some(code),
                Ok(Err(err)) => {
                    warn!(container_id = %control.id(), "Reading exit status failed: {}", err);
                    None
                }
                Err(_) => {
                    warn!(container_id = %control.id(), "Exit status not available in time");
                    None
                }
            }
        } else {
            None
        };

        Ok(BridgeOutcome { reason, exit_code })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::container::LifecycleTimeouts;
    use runtime::{ContainerSpec, MemoryRuntime};

    /// Channel that records everything written to it.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingChannel {
        pub stdout: Arc<Mutex<Vec<u8>>>,
        pub stderr: Arc<Mutex<Vec<u8>>>,
        pub exit: Arc<Mutex<Option<u32>>>,
        pub closed: Arc<AtomicBool>,
        pub broken: Arc<AtomicBool>,
    }

    impl RecordingChannel {
        pub fn stdout_text(&self) -> String {
            String::from_utf8_lossy(&self.stdout.lock().unwrap()).into_owned()
        }

        pub fn stderr_text(&self) -> String {
            String::from_utf8_lossy(&self.stderr.lock().unwrap()).into_owned()
        }

        pub fn exit_status(&self) -> Option<u32> {
            *self.exit.lock().unwrap()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), BridgeError> {
            if self.broken.load(Ordering::SeqCst) || self.is_closed() {
                return Err(BridgeError::Channel("channel closed".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClientChannel for RecordingChannel {
        async fn data(&self, data: &[u8]) -> Result<(), BridgeError> {
            self.check()?;
            self.stdout.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn stderr(&self, data: &[u8]) -> Result<(), BridgeError> {
            self.check()?;
            self.stderr.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn exit_status(&self, code: u32) -> Result<(), BridgeError> {
            self.check()?;
            *self.exit.lock().unwrap() = Some(code);
            Ok(())
        }

        async fn eof(&self) -> Result<(), BridgeError> {
            self.check()
        }

        async fn close(&self) -> Result<(), BridgeError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        lifecycle: ContainerLifecycleManager,
        channel: RecordingChannel,
        tx: mpsc::Sender<ChannelEvent>,
        rx: mpsc::Receiver<ChannelEvent>,
        handle: Option<ContainerHandle>,
    }

    async fn fixture(tty: bool) -> Fixture {
        let runtime = Arc::new(MemoryRuntime::new());
        let lifecycle = ContainerLifecycleManager::new(runtime.clone(), LifecycleTimeouts::default());
        let spec = ContainerSpec {
            name: "bridge-test".to_string(),
            image: "alpine:latest".to_string(),
            command: vec!["/bin/sh".to_string()],
            tty,
            ..Default::default()
        };
        let handle = lifecycle
            .acquire(&spec, &CancellationToken::new())
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        Fixture {
            runtime,
            lifecycle,
            channel: RecordingChannel::default(),
            tx,
            rx,
            handle: Some(handle),
        }
    }

    fn data(text: &str) -> ChannelEvent {
        ChannelEvent::Data(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[tokio::test]
    async fn test_output_and_exit_status() {
        let mut f = fixture(true).await;
        f.tx.send(data("echo hi\n")).await.unwrap();
        f.tx.send(data("exit 3\n")).await.unwrap();

        let bridge = SessionBridge::new(&f.channel, &f.lifecycle);
        let outcome = bridge
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.reason, EndReason::ProcessExited);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(f.channel.stdout_text(), "hi\n");
    }

    #[tokio::test]
    async fn test_eof_ends_process() {
        let mut f = fixture(false).await;
        f.tx.send(data("echo bye\n")).await.unwrap();
        f.tx.send(ChannelEvent::Eof).await.unwrap();

        let outcome = SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, EndReason::ProcessExited);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(f.channel.stdout_text(), "bye\n");
    }

    #[tokio::test]
    async fn test_client_close_ends_bridge() {
        let mut f = fixture(true).await;
        f.tx.send(ChannelEvent::Close).await.unwrap();

        let outcome = SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, EndReason::ClientClosed);
        assert_eq!(outcome.exit_code, None);
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_bridge() {
        let mut f = fixture(true).await;
        drop(f.tx);

        let outcome = SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, EndReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_cancel_stops_both_pumps() {
        let mut f = fixture(true).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            SessionBridge::new(&f.channel, &f.lifecycle).run(
                f.handle.take().unwrap(),
                &mut f.rx,
                &cancel,
            ),
        )
        .await
        .expect("bridge must stop after cancellation")
        .unwrap();
        assert_eq!(outcome.reason, EndReason::Cancelled);
        drop(f.tx);
    }

    #[tokio::test]
    async fn test_resize_and_signal_forwarded() {
        let mut f = fixture(true).await;
        let id = f.handle.as_ref().unwrap().id().to_string();
        f.tx.send(ChannelEvent::Resize { cols: 100, rows: 30 }).await.unwrap();
        f.tx.send(ChannelEvent::Signal("INT".to_string())).await.unwrap();
        f.tx.send(ChannelEvent::Close).await.unwrap();

        SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.runtime.resizes(&id), vec![(100, 30)]);
        assert_eq!(f.runtime.signals(&id), vec!["INT".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_signal_reports_status() {
        let mut f = fixture(true).await;
        f.tx.send(ChannelEvent::Signal("KILL".to_string())).await.unwrap();

        let outcome = SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, EndReason::ProcessExited);
        assert_eq!(outcome.exit_code, Some(137));
    }

    #[tokio::test]
    async fn test_broken_channel_is_disconnect() {
        let mut f = fixture(true).await;
        f.channel.broken.store(true, Ordering::SeqCst);
        f.tx.send(data("echo lost\n")).await.unwrap();

        let err = SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_data_after_exit_is_dropped() {
        let mut f = fixture(true).await;
        f.tx.send(data("exit 0\n")).await.unwrap();
        f.tx.send(data("echo too late\n")).await.unwrap();

        let outcome = SessionBridge::new(&f.channel, &f.lifecycle)
            .run(f.handle.take().unwrap(), &mut f.rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, EndReason::ProcessExited);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(f.channel.stdout_text(), "");
    }
}
