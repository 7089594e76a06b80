//! In-memory container runtime.
//!
//! [`MemoryRuntime`] keeps containers in a map and runs each started one as
//! a tiny line interpreter over an in-process pipe:
//!
//! - `echo ARGS` prints `ARGS`
//! - `exit [N]` ends the process with status `N` (default 0)
//! - anything else is echoed back unchanged
//!
//! Closing stdin ends the process with status 0. Containers started with a
//! non-shell command run that command as a single line and exit.
//!
//! Every operation can be made to fail or hang via [`MemoryRuntime::inject`],
//! and the runtime counts what was created and removed so tests can check
//! that nothing leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::api::{AttachedIo, ContainerRuntime, OutputChunk};
use crate::error::{Result, RuntimeError};
use crate::spec::{ContainerId, ContainerSpec};

/// Pipe capacity between the attached client and the interpreter.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Exit status reported for a container stopped gracefully.
pub const EXIT_STOPPED: i64 = 143;

/// Exit status reported for a killed container.
pub const EXIT_KILLED: i64 = 137;

const SHELLS: &[&str] = &["sh", "ash", "bash", "dash", "zsh"];

/// Runtime operations that accept injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    Pull,
    Create,
    Start,
    Attach,
    Wait,
    Stop,
    Kill,
    Remove,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Ping => "ping",
            Operation::Pull => "pull",
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Attach => "attach",
            Operation::Wait => "wait",
            Operation::Stop => "stop",
            Operation::Kill => "kill",
            Operation::Remove => "remove",
        }
    }
}

/// What an injected fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return [`RuntimeError::Injected`].
    Fail,
    /// Never complete.
    Hang,
    /// Complete normally, but only after the delay.
    Delay(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Created,
    Running,
    Exited,
}

struct FakeContainer {
    spec: ContainerSpec,
    status: Status,
    /// Client end of the pipe, handed out once by `attach`.
    client_io: Option<DuplexStream>,
    exit: Arc<watch::Sender<Option<i64>>>,
    task: Option<JoinHandle<()>>,
    resizes: Vec<(u16, u16)>,
    signals: Vec<String>,
}

impl FakeContainer {
    fn terminate(&mut self, code: i64) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.status != Status::Exited {
            self.status = Status::Exited;
            self.client_io = None;
            self.exit.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(code);
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    containers: HashMap<ContainerId, FakeContainer>,
}

impl State {
    fn get_mut(&mut self, id: &str) -> Result<&mut FakeContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))
    }

    fn resolve(&self, id_or_name: &str) -> Option<ContainerId> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .iter()
            .find(|(_, c)| c.spec.name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

/// Container runtime that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    faults: Mutex<HashMap<Operation, Fault>>,
    created: AtomicUsize,
    removed: AtomicUsize,
}

impl MemoryRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` fail or hang until [`clear`](Self::clear) is called.
    pub fn inject(&self, op: Operation, fault: Fault) {
        lock(&self.faults).insert(op, fault);
    }

    /// Removes any fault injected for `op`.
    pub fn clear(&self, op: Operation) {
        lock(&self.faults).remove(&op);
    }

    /// Number of containers ever created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of containers ever removed.
    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    /// Number of containers currently present.
    pub fn live(&self) -> usize {
        lock(&self.state).containers.len()
    }

    /// Ids of containers currently present.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        lock(&self.state).containers.keys().cloned().collect()
    }

    /// Spec a present container was created from.
    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        lock(&self.state).containers.get(id).map(|c| c.spec.clone())
    }

    /// TTY sizes sent to a container, oldest first.
    pub fn resizes(&self, id: &str) -> Vec<(u16, u16)> {
        lock(&self.state)
            .containers
            .get(id)
            .map(|c| c.resizes.clone())
            .unwrap_or_default()
    }

    /// Signals sent to a container, oldest first.
    pub fn signals(&self, id: &str) -> Vec<String> {
        lock(&self.state)
            .containers
            .get(id)
            .map(|c| c.signals.clone())
            .unwrap_or_default()
    }

    /// Returns true if the container is present and its process is running.
    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.state)
            .containers
            .get(id)
            .is_some_and(|c| c.status == Status::Running && c.exit.borrow().is_none())
    }

    async fn check(&self, op: Operation) -> Result<()> {
        let fault = lock(&self.faults).get(&op).copied();
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(RuntimeError::Injected(op.name())),
            Some(Fault::Hang) => {
                debug!(operation = op.name(), "hanging on injected fault");
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the command line to run once, or `None` for an interactive shell.
fn one_shot(command: &[String]) -> Option<String> {
    let program = command.first()?;
    let base = program.rsplit('/').next().unwrap_or(program);
    if SHELLS.contains(&base) && command.len() == 1 {
        return None;
    }
    if SHELLS.contains(&base) && command.get(1).map(String::as_str) == Some("-c") {
        return Some(command[2..].join(" "));
    }
    Some(command.join(" "))
}

/// Runs one input line; returns the exit status if the line ends the process.
async fn run_line<W>(line: &str, out: &mut W) -> std::io::Result<Option<i64>>
where
    W: AsyncWrite + Unpin,
{
    let line = line.trim_end_matches('\r').trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    match word {
        "exit" => Ok(Some(rest.trim().parse().unwrap_or(0))),
        "echo" => {
            out.write_all(format!("{rest}\n").as_bytes()).await?;
            Ok(None)
        }
        _ => {
            out.write_all(format!("{line}\n").as_bytes()).await?;
            Ok(None)
        }
    }
}

async fn interpret(io: DuplexStream, command: Vec<String>, exit: Arc<watch::Sender<Option<i64>>>) {
    let (reader, mut writer) = tokio::io::split(io);
    let code = match one_shot(&command) {
        Some(line) => match run_line(&line, &mut writer).await {
            Ok(code) => code.unwrap_or(0),
            Err(_) => 0,
        },
        None => {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match run_line(&line, &mut writer).await {
                        Ok(Some(code)) => break code,
                        Ok(None) => {}
                        Err(_) => break 0,
                    },
                    Ok(None) | Err(_) => break 0,
                }
            }
        }
    };
    let _ = writer.shutdown().await;
    exit.send_replace(Some(code));
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn ping(&self) -> Result<()> {
        self.check(Operation::Ping).await
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.check(Operation::Pull).await?;
        if image.is_empty() {
            return Err(RuntimeError::NotFound("image with empty reference".to_string()));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        self.check(Operation::Create).await?;
        if spec.image.is_empty() {
            return Err(RuntimeError::InvalidSpec("image is empty".to_string()));
        }
        let mut state = lock(&self.state);
        if !spec.name.is_empty() && state.resolve(&spec.name).is_some() {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("container name {} is already in use", spec.name),
            });
        }
        state.next_id += 1;
        let id = format!("mem{:012x}", state.next_id);
        let (exit, _) = watch::channel(None);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: Status::Created,
                client_io: None,
                exit: Arc::new(exit),
                task: None,
                resizes: Vec::new(),
                signals: Vec::new(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(container_id = %id, name = %spec.name, "created container");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.check(Operation::Start).await?;
        let mut state = lock(&self.state);
        let container = state.get_mut(id)?;
        if container.status != Status::Created {
            return Err(RuntimeError::Api {
                status: 304,
                message: format!("container {id} already started"),
            });
        }
        let (client, process) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(interpret(
            process,
            container.spec.command.clone(),
            Arc::clone(&container.exit),
        ));
        container.client_io = Some(client);
        container.task = Some(task);
        container.status = Status::Running;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<AttachedIo> {
        self.check(Operation::Attach).await?;
        let client = {
            let mut state = lock(&self.state);
            let container = state.get_mut(id)?;
            container.client_io.take().ok_or_else(|| RuntimeError::Api {
                status: 409,
                message: format!("container {id} is not running or already attached"),
            })?
        };
        let (read, write) = tokio::io::split(client);
        let output = ReaderStream::new(read).map(|chunk| {
            chunk
                .map(OutputChunk::Stdout)
                .map_err(RuntimeError::from)
        });
        Ok(AttachedIo {
            stdin: Box::pin(write),
            output: Box::pin(output),
        })
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.get_mut(id)?.resizes.push((cols, rows));
        Ok(())
    }

    async fn signal(&self, id: &str, signal: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let container = state.get_mut(id)?;
        let name = signal.trim_start_matches("SIG").to_string();
        if name == "KILL" {
            container.terminate(EXIT_KILLED);
        }
        container.signals.push(name);
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        self.check(Operation::Wait).await?;
        let mut exit = {
            let mut state = lock(&self.state);
            state.get_mut(id)?.exit.subscribe()
        };
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::NotFound(format!("container {id} removed while waiting")))?;
        Ok(code.unwrap_or(0))
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<()> {
        self.check(Operation::Stop).await?;
        let mut state = lock(&self.state);
        state.get_mut(id)?.terminate(EXIT_STOPPED);
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.check(Operation::Kill).await?;
        let mut state = lock(&self.state);
        state.get_mut(id)?.terminate(EXIT_KILLED);
        Ok(())
    }

    async fn remove(&self, id_or_name: &str) -> Result<()> {
        self.check(Operation::Remove).await?;
        let mut state = lock(&self.state);
        let Some(id) = state.resolve(id_or_name) else {
            debug!(container = id_or_name, "container already gone");
            return Ok(());
        };
        if let Some(mut container) = state.containers.remove(&id) {
            container.terminate(EXIT_KILLED);
            self.removed.fetch_add(1, Ordering::SeqCst);
            debug!(container_id = %id, "removed container");
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerId>> {
        Ok(self.container_ids())
    }
}
