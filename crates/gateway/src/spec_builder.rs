//! Translates an authenticated session into a [`ContainerSpec`].
//!
//! The builder holds only the `[container]` configuration and is otherwise
//! stateless: the same session always yields the same spec. Every container
//! gets resource limits, no host network and no privileged mode unless the
//! configuration explicitly allows it.

use std::path::{Component, Path, PathBuf};

use runtime::{
    ContainerSpec, Mount, NetworkPolicy, ResourceLimits, IMAGE_LABEL, MANAGED_LABEL,
    SESSION_LABEL, USER_LABEL,
};

use crate::config::{is_valid_env_key, ContainerConfig};
use crate::error::InvalidRequestError;
use crate::session::{Program, Session};

/// Engine sockets that must never be reachable from inside a container.
const ENGINE_SOCKETS: &[&str] = &["/var/run/docker.sock", "/run/docker.sock"];

/// Prefix of every container name.
pub const CONTAINER_NAME_PREFIX: &str = "sshbox-";

/// Builds container specs from sessions.
#[derive(Debug, Clone)]
pub struct ContainerSpecBuilder {
    config: ContainerConfig,
}

impl ContainerSpecBuilder {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Builds the spec for `session`, refusing anything the policy forbids.
    pub fn build(&self, session: &Session) -> Result<ContainerSpec, InvalidRequestError> {
        let principal = &session.principal;
        let overrides = &principal.overrides;
        let request = &session.request;

        let image = self.image_for(session);
        if !is_valid_image(&image) {
            return Err(InvalidRequestError::InvalidImage(image));
        }
        if !is_image_allowed(&image, &self.config.allowed_images) {
            return Err(InvalidRequestError::ImageNotAllowed(image));
        }

        let privileged = overrides.privileged.unwrap_or(false);
        if privileged && !self.config.allow_privileged {
            return Err(InvalidRequestError::PrivilegedNotAllowed);
        }

        for mount in &self.config.mounts {
            check_mount(mount, &self.config.allowed_mount_prefixes)?;
        }

        let network = match self.config.network.as_str() {
            "" | "none" => NetworkPolicy::None,
            "host" => return Err(InvalidRequestError::HostNetwork),
            name => NetworkPolicy::Named(name.to_string()),
        };

        let entrypoint = overrides
            .entrypoint
            .as_deref()
            .map(split_command)
            .transpose()?;
        let command = match &request.program {
            Program::Exec(line) => split_command(line)?,
            Program::Shell => match (&overrides.command, &entrypoint) {
                (Some(command), _) => command.clone(),
                (None, Some(_)) => Vec::new(),
                (None, None) => vec![self.config.default_shell.clone()],
            },
        };

        let mut env = self.config.env.clone();
        env.extend(overrides.env.clone());
        env.extend(request.env.clone());
        if let Some(pty) = &request.pty {
            env.insert("TERM".to_string(), pty.term.clone());
            env.insert("USE_TTY".to_string(), "1".to_string());
        }
        if let Some(key) = env.keys().find(|key| !is_valid_env_key(key)) {
            return Err(InvalidRequestError::InvalidEnvKey(key.clone()));
        }

        let mut labels = self.config.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SESSION_LABEL.to_string(), session.id.clone());
        labels.insert(USER_LABEL.to_string(), principal.owner().to_string());
        labels.insert(IMAGE_LABEL.to_string(), image.clone());

        Ok(ContainerSpec {
            name: format!("{CONTAINER_NAME_PREFIX}{}", session.id),
            image,
            entrypoint,
            command,
            env,
            user: overrides.user.clone().or_else(|| self.config.user.clone()),
            working_dir: self.config.working_dir.clone(),
            tty: request.pty.is_some(),
            limits: self.limits(),
            network,
            mounts: self.config.mounts.clone(),
            privileged,
            read_only_rootfs: self.config.read_only_rootfs,
            labels,
        })
    }

    /// Picks the image: policy override, then user name, then the default.
    fn image_for(&self, session: &Session) -> String {
        let principal = &session.principal;
        if let Some(image) = &principal.overrides.image_name {
            return image.clone();
        }
        if self.config.image_from_username {
            return principal.user.replace('_', "/");
        }
        self.config.default_image.clone()
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_bytes: self
                .config
                .memory_mb
                .map(|mb| i64::try_from(mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)),
            nano_cpus: self.config.cpus.map(|cpus| (cpus * 1e9).round() as i64),
            pids_limit: self.config.pids_limit,
        }
    }
}

fn split_command(line: &str) -> Result<Vec<String>, InvalidRequestError> {
    match shlex::split(line) {
        Some(words) if !words.is_empty() => Ok(words),
        _ => Err(InvalidRequestError::UnparsableCommand(line.to_string())),
    }
}

fn is_valid_image(image: &str) -> bool {
    !image.is_empty()
        && image.len() <= 255
        && !image.starts_with(['-', '/', ':', '.'])
        && image
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'))
}

/// Strips the tag and digest from an image reference.
fn repository(image: &str) -> &str {
    let image = image.split_once('@').map_or(image, |(name, _)| name);
    match (image.rfind(':'), image.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => &image[..colon],
        (Some(colon), None) => &image[..colon],
        _ => image,
    }
}

/// An empty list allows everything. Entries without a tag allow any tag.
fn is_image_allowed(image: &str, allowed: &[String]) -> bool {
    allowed.is_empty()
        || allowed.iter().any(|entry| {
            entry == image || (repository(entry) == entry && repository(image) == entry)
        })
}

pub(crate) fn check_mount(mount: &Mount, prefixes: &[PathBuf]) -> Result<(), InvalidRequestError> {
    let source = &mount.source;
    let rejected = || InvalidRequestError::MountNotAllowed(source.display().to_string());

    if !source.is_absolute() || source.components().any(|c| c == Component::ParentDir) {
        return Err(rejected());
    }
    let exposes_socket = source.file_name().is_some_and(|name| name == "docker.sock")
        || ENGINE_SOCKETS
            .iter()
            .any(|socket| Path::new(socket).starts_with(source));
    if exposes_socket {
        return Err(InvalidRequestError::EngineSocketMount);
    }
    if !prefixes.is_empty() && !prefixes.iter().any(|prefix| source.starts_with(prefix)) {
        return Err(rejected());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMethod, Principal};
    use crate::session::TerminalRequest;

    fn session(user: &str, request: TerminalRequest) -> Session {
        Session::new(
            "0000-1111".to_string(),
            Principal::new(user, AuthMethod::Password),
            None,
            request,
        )
    }

    fn builder() -> ContainerSpecBuilder {
        ContainerSpecBuilder::new(ContainerConfig::default())
    }

    #[test]
    fn test_default_shell_session() {
        let spec = builder()
            .build(&session("alice", TerminalRequest::shell().with_pty("xterm-256color", 80, 24)))
            .unwrap();

        assert_eq!(spec.name, "sshbox-0000-1111");
        assert_eq!(spec.image, "alpine:latest");
        assert_eq!(spec.command, vec!["/bin/sh".to_string()]);
        assert!(spec.entrypoint.is_none());
        assert!(spec.tty);
        assert_eq!(spec.env.get("TERM").unwrap(), "xterm-256color");
        assert_eq!(spec.env.get("USE_TTY").unwrap(), "1");
        assert_eq!(spec.network, NetworkPolicy::None);
        assert!(!spec.privileged);
        assert_eq!(spec.limits.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(spec.limits.nano_cpus, Some(1_000_000_000));
        assert_eq!(spec.limits.pids_limit, Some(256));
        assert_eq!(spec.session_id(), Some("0000-1111"));
        assert_eq!(spec.labels.get(USER_LABEL).unwrap(), "alice");
        assert_eq!(spec.labels.get(IMAGE_LABEL).unwrap(), "alpine:latest");
    }

    #[test]
    fn test_exec_without_pty() {
        let spec = builder()
            .build(&session("alice", TerminalRequest::exec("ls -la '/tmp/a b'")))
            .unwrap();
        assert_eq!(spec.command, vec!["ls", "-la", "/tmp/a b"]);
        assert!(!spec.tty);
        assert!(!spec.env.contains_key("TERM"));
        assert!(!spec.env.contains_key("USE_TTY"));
    }

    #[test]
    fn test_unparsable_exec_refused() {
        let err = builder()
            .build(&session("alice", TerminalRequest::exec("echo 'unterminated")))
            .unwrap_err();
        assert!(matches!(err, InvalidRequestError::UnparsableCommand(_)));

        let err = builder()
            .build(&session("alice", TerminalRequest::exec("   ")))
            .unwrap_err();
        assert!(matches!(err, InvalidRequestError::UnparsableCommand(_)));
    }

    #[test]
    fn test_image_precedence() {
        let mut config = ContainerConfig {
            image_from_username: true,
            ..ContainerConfig::default()
        };
        let b = ContainerSpecBuilder::new(config.clone());
        let spec = b.build(&session("library_ubuntu", TerminalRequest::shell())).unwrap();
        assert_eq!(spec.image, "library/ubuntu");

        let mut s = session("library_ubuntu", TerminalRequest::shell());
        s.principal.overrides.image_name = Some("busybox:1.36".to_string());
        assert_eq!(b.build(&s).unwrap().image, "busybox:1.36");

        config.image_from_username = false;
        let spec = ContainerSpecBuilder::new(config)
            .build(&session("library_ubuntu", TerminalRequest::shell()))
            .unwrap();
        assert_eq!(spec.image, "alpine:latest");
    }

    #[test]
    fn test_allowed_images() {
        let allowed = vec!["ubuntu".to_string(), "alpine:3.20".to_string()];
        assert!(is_image_allowed("ubuntu:24.04", &allowed));
        assert!(is_image_allowed("ubuntu", &allowed));
        assert!(is_image_allowed("alpine:3.20", &allowed));
        assert!(!is_image_allowed("alpine:latest", &allowed));
        assert!(!is_image_allowed("debian", &allowed));
        assert!(is_image_allowed("anything", &[]));

        let config = ContainerConfig {
            allowed_images: allowed,
            ..ContainerConfig::default()
        };
        let err = ContainerSpecBuilder::new(config)
            .build(&session("alice", TerminalRequest::shell()))
            .unwrap_err();
        assert_eq!(
            err,
            InvalidRequestError::ImageNotAllowed("alpine:latest".to_string())
        );
    }

    #[test]
    fn test_repository_strips_tag_and_digest() {
        assert_eq!(repository("ubuntu:24.04"), "ubuntu");
        assert_eq!(repository("registry:5000/team/app"), "registry:5000/team/app");
        assert_eq!(repository("registry:5000/team/app:v1"), "registry:5000/team/app");
        assert_eq!(repository("app@sha256:abcd"), "app");
    }

    #[test]
    fn test_invalid_image_refused() {
        let mut s = session("alice", TerminalRequest::shell());
        s.principal.overrides.image_name = Some("--privileged".to_string());
        assert!(matches!(
            builder().build(&s).unwrap_err(),
            InvalidRequestError::InvalidImage(_)
        ));

        s.principal.overrides.image_name = Some("ubuntu; rm -rf /".to_string());
        assert!(matches!(
            builder().build(&s).unwrap_err(),
            InvalidRequestError::InvalidImage(_)
        ));
    }

    #[test]
    fn test_privileged_needs_policy() {
        let mut s = session("alice", TerminalRequest::shell());
        s.principal.overrides.privileged = Some(true);
        assert_eq!(
            builder().build(&s).unwrap_err(),
            InvalidRequestError::PrivilegedNotAllowed
        );

        let config = ContainerConfig {
            allow_privileged: true,
            ..ContainerConfig::default()
        };
        assert!(ContainerSpecBuilder::new(config).build(&s).unwrap().privileged);
    }

    #[test]
    fn test_mount_rules() {
        let prefixes = vec![PathBuf::from("/srv/shared")];
        let mount = |source: &str| Mount {
            source: PathBuf::from(source),
            target: "/data".to_string(),
            read_only: true,
        };

        assert!(check_mount(&mount("/srv/shared/docs"), &prefixes).is_ok());
        assert!(matches!(
            check_mount(&mount("/etc"), &prefixes),
            Err(InvalidRequestError::MountNotAllowed(_))
        ));
        assert!(matches!(
            check_mount(&mount("/srv/shared/../../etc"), &prefixes),
            Err(InvalidRequestError::MountNotAllowed(_))
        ));
        assert!(matches!(
            check_mount(&mount("relative"), &[]),
            Err(InvalidRequestError::MountNotAllowed(_))
        ));
        assert_eq!(
            check_mount(&mount("/var/run/docker.sock"), &[]),
            Err(InvalidRequestError::EngineSocketMount)
        );
        assert_eq!(
            check_mount(&mount("/var/run"), &[]),
            Err(InvalidRequestError::EngineSocketMount)
        );
        assert_eq!(
            check_mount(&mount("/"), &[]),
            Err(InvalidRequestError::EngineSocketMount)
        );
        assert!(check_mount(&mount("/srv/anything"), &[]).is_ok());
    }

    #[test]
    fn test_env_merge_order() {
        let mut config = ContainerConfig::default();
        config.env.insert("A".to_string(), "config".to_string());
        config.env.insert("B".to_string(), "config".to_string());
        config.env.insert("C".to_string(), "config".to_string());

        let mut request = TerminalRequest::shell();
        request.env.insert("C".to_string(), "client".to_string());
        let mut s = session("alice", request);
        s.principal
            .overrides
            .env
            .insert("B".to_string(), "policy".to_string());
        s.principal
            .overrides
            .env
            .insert("C".to_string(), "policy".to_string());

        let spec = ContainerSpecBuilder::new(config).build(&s).unwrap();
        assert_eq!(spec.env.get("A").unwrap(), "config");
        assert_eq!(spec.env.get("B").unwrap(), "policy");
        assert_eq!(spec.env.get("C").unwrap(), "client");
    }

    #[test]
    fn test_invalid_env_key_refused() {
        let mut request = TerminalRequest::shell();
        request.env.insert("BAD-KEY".to_string(), "x".to_string());
        let err = builder().build(&session("alice", request)).unwrap_err();
        assert_eq!(err, InvalidRequestError::InvalidEnvKey("BAD-KEY".to_string()));
    }

    #[test]
    fn test_entrypoint_and_command_overrides() {
        let mut s = session("alice", TerminalRequest::shell());
        s.principal.overrides.entrypoint = Some("/usr/local/bin/init --quiet".to_string());
        let spec = builder().build(&s).unwrap();
        assert_eq!(
            spec.entrypoint,
            Some(vec!["/usr/local/bin/init".to_string(), "--quiet".to_string()])
        );
        assert!(spec.command.is_empty());

        s.principal.overrides.command = Some(vec!["/bin/bash".to_string(), "-l".to_string()]);
        assert_eq!(builder().build(&s).unwrap().command, vec!["/bin/bash", "-l"]);

        s.request = TerminalRequest::exec("uname -a");
        assert_eq!(builder().build(&s).unwrap().command, vec!["uname", "-a"]);
    }

    #[test]
    fn test_network_policy() {
        let named = ContainerConfig {
            network: "sandbox".to_string(),
            ..ContainerConfig::default()
        };
        let spec = ContainerSpecBuilder::new(named)
            .build(&session("alice", TerminalRequest::shell()))
            .unwrap();
        assert_eq!(spec.network, NetworkPolicy::Named("sandbox".to_string()));

        let host = ContainerConfig {
            network: "host".to_string(),
            ..ContainerConfig::default()
        };
        assert_eq!(
            ContainerSpecBuilder::new(host)
                .build(&session("alice", TerminalRequest::shell()))
                .unwrap_err(),
            InvalidRequestError::HostNetwork
        );
    }

    #[test]
    fn test_owner_label_uses_remote_user() {
        let mut s = session("guest", TerminalRequest::shell());
        s.principal.overrides.remote_user = Some("alice".to_string());
        s.principal.overrides.user = Some("1000:1000".to_string());
        let spec = builder().build(&s).unwrap();
        assert_eq!(spec.labels.get(USER_LABEL).unwrap(), "alice");
        assert_eq!(spec.user.as_deref(), Some("1000:1000"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let s = session("alice", TerminalRequest::exec("id"));
        assert_eq!(builder().build(&s).unwrap(), builder().build(&s).unwrap());
    }
}
