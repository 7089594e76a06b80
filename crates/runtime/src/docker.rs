//! Docker Engine runtime built on bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::api::{AttachedIo, ContainerRuntime, OutputChunk};
use crate::error::{Result, RuntimeError};
use crate::spec::{ContainerId, ContainerSpec, MANAGED_LABEL};

/// Capabilities kept after dropping everything; enough for a login shell
/// to switch users and own its files.
const CAP_ADD: &[&str] = &["CHOWN", "SETUID", "SETGID", "DAC_OVERRIDE", "FOWNER", "KILL"];

/// Container runtime backed by the local Docker Engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let binds: Vec<String> = spec.mounts.iter().map(|m| m.to_bind()).collect();

        let host_config = HostConfig {
            memory: spec.limits.memory_bytes,
            nano_cpus: spec.limits.nano_cpus,
            pids_limit: spec.limits.pids_limit,
            network_mode: Some(spec.network.mode().to_string()),
            privileged: Some(spec.privileged),
            readonly_rootfs: Some(spec.read_only_rootfs),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(CAP_ADD.iter().map(|c| c.to_string()).collect()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            binds: (!binds.is_empty()).then_some(binds),
            init: Some(true),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            entrypoint: spec.entrypoint.clone(),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(spec.env_list()),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            tty: Some(spec.tty),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// Pull options for `image`. An untagged reference pulls `latest` instead of
/// every tag of the repository; digest references are passed through.
fn pull_options(image: &str) -> CreateImageOptions<String> {
    if image.contains('@') {
        return CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
    }

    // A colon before the last `/` belongs to a registry port, not a tag.
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let (from_image, tag) = match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    };
    CreateImageOptions {
        from_image: from_image.to_string(),
        tag: tag.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                let err = RuntimeError::from(err);
                if !err.is_not_found() {
                    return Err(err);
                }
            }
        }

        info!(image, "Pulling image");
        self.docker
            .create_image(Some(pull_options(image)), None, None)
            .try_for_each(|progress| async move {
                if let Some(status) = progress.status {
                    debug!(status = %status, "pull progress");
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        if spec.image.is_empty() {
            return Err(RuntimeError::InvalidSpec("image is empty".to_string()));
        }
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await?;
        for warning in &response.warnings {
            debug!(container_id = %response.id, warning = %warning, "create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<AttachedIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(true),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } =
            self.docker.attach_container(id, Some(options)).await?;

        let output = output.filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message)))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(err) => Some(Err(RuntimeError::Stream(err.to_string()))),
            }
        });

        Ok(AttachedIo {
            stdin: input,
            output: Box::pin(output),
        })
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let options = ResizeContainerTtyOptions {
            width: cols,
            height: rows,
        };
        self.docker.resize_container_tty(id, options).await?;
        Ok(())
    }

    async fn signal(&self, id: &str, signal: &str) -> Result<()> {
        let signal = format!("SIG{}", signal.trim_start_matches("SIG"));
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal }))
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(err.into()),
            None => Err(RuntimeError::Stream(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn kill(&self, id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(
                id,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 409: container is not running.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, id_or_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id_or_name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = RuntimeError::from(err);
                if err.is_not_found() {
                    debug!(container = id_or_name, "container already gone");
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn list_managed(&self) -> Result<Vec<ContainerId>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
