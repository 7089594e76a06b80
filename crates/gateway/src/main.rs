//! sshbox
//!
//! SSH gateway that runs every session in its own ephemeral container.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gateway::config::{AuthPolicy, Config};
use gateway::container::remove_managed;
use gateway::orchestrator::{Gateway, GatewayEvent};
use runtime::{ContainerRuntime, DockerRuntime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// sshbox - every SSH session gets its own throwaway container.
#[derive(Parser, Debug)]
#[command(name = "sshbox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the SSH gateway until SIGINT or SIGTERM
    Serve(ServeArgs),

    /// Remove containers left behind by a previous run
    Cleanup,

    /// Print the effective configuration as TOML
    Config,
}

/// Flags of `serve`; each one overrides the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Address to listen on (e.g. 0.0.0.0:2222)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Host key file, generated when missing
    #[arg(long, value_name = "FILE")]
    pub host_key: Option<PathBuf>,

    /// Default container image
    #[arg(long)]
    pub image: Option<String>,

    /// Authentication policy
    #[arg(long, value_enum)]
    pub auth: Option<AuthPolicy>,

    /// Comma-separated list of images sessions may use
    #[arg(long, value_delimiter = ',')]
    pub allowed_images: Option<Vec<String>>,

    /// Program started for shell requests
    #[arg(long)]
    pub shell: Option<String>,

    /// Text shown before the program starts
    #[arg(long)]
    pub banner: Option<String>,
}

impl ServeArgs {
    /// Applies the flags on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.listen_addr = bind.clone();
        }
        if let Some(host_key) = &self.host_key {
            config.server.host_key = Some(host_key.clone());
        }
        if let Some(image) = &self.image {
            config.container.default_image = image.clone();
        }
        if let Some(policy) = self.auth {
            config.auth.policy = Some(policy);
        }
        if let Some(images) = &self.allowed_images {
            config.container.allowed_images = images.clone();
        }
        if let Some(shell) = &self.shell {
            config.container.default_shell = shell.clone();
        }
        if let Some(banner) = &self.banner {
            config.server.banner = Some(banner.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    let _log_guard = init_tracing(&level, config.server.log_file.as_deref())?;

    if let Some(path) = &cli.config {
        tracing::info!("Using config file: {:?}", path);
    }

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config);
            config.validate()?;
            serve(config).await?;
        }
        Commands::Cleanup => cleanup(&config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Initializes tracing; the returned guard flushes the log file on drop.
fn init_tracing(level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    let Some(path) = log_file else {
        registry.init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

/// Runs the gateway until a shutdown signal arrives.
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("sshbox {} starting...", env!("CARGO_PKG_VERSION"));

    let runtime = DockerRuntime::connect().context("Failed to connect to the Docker engine")?;
    let gateway = Gateway::new(config, Arc::new(runtime))?;

    // Subscribe to gateway events for logging
    let mut events = gateway.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                GatewayEvent::StateChanged(state) => {
                    tracing::info!("Gateway state: {:?}", state);
                }
                GatewayEvent::SessionStarted { session_id, user } => {
                    tracing::debug!(session_id = %session_id, "Session started for {}", user);
                }
                GatewayEvent::SessionEnded {
                    session_id,
                    user,
                    exit_code,
                } => {
                    tracing::debug!(
                        session_id = %session_id,
                        "Session of {} ended (exit code {:?})",
                        user,
                        exit_code
                    );
                }
                GatewayEvent::AuthenticationFailed { .. } => {}
                GatewayEvent::Error { message } => {
                    tracing::error!("Gateway error: {}", message);
                }
            }
        }
    });

    gateway.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    gateway.stop().await?;
    Ok(())
}

/// Removes leftover managed containers and reports what happened.
async fn cleanup(config: &Config) -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect().context("Failed to connect to the Docker engine")?;
    runtime
        .ping()
        .await
        .context("Container runtime is not reachable")?;

    let report = remove_managed(&runtime, config.session.remove_timeout()).await?;
    println!(
        "Found {} leftover containers, removed {}",
        report.found, report.removed
    );
    for (id, reason) in &report.failed {
        eprintln!("  {}: {}", id, reason);
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} containers could not be removed", report.failed.len());
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::try_parse_from(["sshbox", "serve"]).unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert!(args.bind.is_none());
                assert!(args.auth.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "sshbox",
            "serve",
            "--bind",
            "127.0.0.1:2200",
            "--auth",
            "allow-all",
            "--image",
            "ubuntu:24.04",
            "--allowed-images",
            "ubuntu,alpine:3.20",
            "--shell",
            "/bin/bash",
            "--banner",
            "hello",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("Expected Serve command");
        };

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.server.listen_addr, "127.0.0.1:2200");
        assert_eq!(config.auth.policy, Some(AuthPolicy::AllowAll));
        assert_eq!(config.container.default_image, "ubuntu:24.04");
        assert_eq!(
            config.container.allowed_images,
            vec!["ubuntu".to_string(), "alpine:3.20".to_string()]
        );
        assert_eq!(config.container.default_shell, "/bin/bash");
        assert_eq!(config.server.banner.as_deref(), Some("hello"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["sshbox", "cleanup", "-v", "-c", "/tmp/sshbox.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sshbox.toml")));
        assert!(matches!(cli.command, Commands::Cleanup));
    }

    #[test]
    fn test_config_command() {
        let cli = Cli::try_parse_from(["sshbox", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
    }

    #[test]
    fn test_unknown_auth_policy_rejected() {
        assert!(Cli::try_parse_from(["sshbox", "serve", "--auth", "guest"]).is_err());
    }

    #[test]
    fn test_version_mentions_program() {
        let version = Cli::command().render_version();
        assert!(version.starts_with("sshbox "));
    }
}
