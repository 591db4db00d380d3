use resources::{Container, Input, MountType};
use std::process::{Command as StdCommand, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Container runtime types supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Podman container runtime
    Podman,
    /// Docker container runtime
    Docker,
    /// No container runtime available
    None,
}

impl ContainerRuntime {
    /// Get the command name for this runtime
    pub fn command(&self) -> &'static str {
        match self {
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::None => "",
        }
    }

    /// Check if this runtime is available
    pub fn is_available(&self) -> bool {
        matches!(self, ContainerRuntime::Podman | ContainerRuntime::Docker)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "podman" => Some(ContainerRuntime::Podman),
            "docker" => Some(ContainerRuntime::Docker),
            _ => None,
        }
    }
}

/// Container and network operation errors
#[derive(Error, Debug)]
pub enum ContainerError {
    /// No container runtime is available
    #[error("No container runtime available. Please install Docker or Podman.")]
    NoRuntimeAvailable,

    /// Container failed to start
    #[error("Failed to start container '{name}': {reason}")]
    ContainerStartFailed { name: String, reason: String },

    /// Container exited although it is required to keep running
    #[error("Container '{name}' is not running after start")]
    NotRunning { name: String },

    /// Descriptor still holds an unresolved reference
    #[error("Container '{name}' has an unresolved {field}: {input}")]
    UnresolvedInput {
        name: String,
        field: String,
        input: String,
    },

    /// Network operation failed
    #[error("Network operation failed for '{name}': {reason}")]
    NetworkFailed { name: String, reason: String },

    /// Container cleanup failed
    #[error("Failed to cleanup container '{name}': {reason}")]
    CleanupFailed { name: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Detect available container runtime in order of preference
pub fn detect_runtime() -> ContainerRuntime {
    // Podman first, it runs rootless out of the box
    for runtime in [ContainerRuntime::Podman, ContainerRuntime::Docker] {
        if StdCommand::new(runtime.command())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
        {
            return runtime;
        }
    }

    ContainerRuntime::None
}

/// Arguments for `run`, plus secret environment values passed out of band
#[derive(Debug)]
pub struct RunInvocation {
    pub args: Vec<String>,
    /// Values for `-e NAME` flags, set on the child process only
    pub secret_env: Vec<(String, String)>,
    /// Networks beyond the first, joined with `network connect`
    pub extra_networks: Vec<(String, Vec<String>)>,
}

impl RunInvocation {
    /// The argument list with secret command arguments masked
    pub fn display_args(&self, container: &Container) -> String {
        let secret_args: Vec<&str> = container
            .command
            .iter()
            .filter(|arg| arg.is_secret())
            .filter_map(Input::expose)
            .collect();

        self.args
            .iter()
            .map(|arg| {
                if secret_args.contains(&arg.as_str()) {
                    "[secret]"
                } else {
                    arg.as_str()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn resolved<'a>(container: &Container, field: &str, input: &'a Input) -> Result<&'a str, ContainerError> {
    input.expose().ok_or_else(|| ContainerError::UnresolvedInput {
        name: container.name.clone(),
        field: field.to_string(),
        input: input.to_string(),
    })
}

/// Build the `run -d` invocation for a resolved container descriptor
pub fn run_invocation(container: &Container) -> Result<RunInvocation, ContainerError> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container.name.clone(),
    ];
    let mut secret_env = Vec::new();
    let mut extra_networks = Vec::new();

    for (position, attachment) in container.networks.iter().enumerate() {
        let network = resolved(container, "network", &attachment.network)?.to_string();
        if position == 0 {
            args.push("--network".to_string());
            args.push(network);
            for alias in &attachment.aliases {
                args.push("--network-alias".to_string());
                args.push(alias.clone());
            }
        } else {
            extra_networks.push((network, attachment.aliases.clone()));
        }
    }

    for var in &container.env {
        let value = resolved(container, "environment variable", &var.value)?;
        args.push("-e".to_string());
        if var.value.is_secret() {
            args.push(var.name.clone());
            secret_env.push((var.name.clone(), value.to_string()));
        } else {
            args.push(format!("{}={}", var.name, value));
        }
    }

    for port in &container.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}/{}", port.external, port.internal, port.protocol));
    }

    for mount in &container.mounts {
        args.push("--mount".to_string());
        let mut mount_arg = format!("type={}", mount.kind);
        if mount.kind != MountType::Tmpfs {
            mount_arg.push_str(&format!(",source={}", mount.source.display()));
        }
        mount_arg.push_str(&format!(",target={}", mount.target));
        args.push(mount_arg);
    }

    if container.remove_on_exit {
        args.push("--rm".to_string());
    }

    args.push(resolved(container, "image", &container.image)?.to_string());

    for arg in &container.command {
        args.push(resolved(container, "command argument", arg)?.to_string());
    }

    Ok(RunInvocation {
        args,
        secret_env,
        extra_networks,
    })
}

/// Create and start a container, returning its id
pub async fn run_container(
    runtime: ContainerRuntime,
    container: &Container,
) -> Result<String, ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }

    let invocation = run_invocation(container)?;

    // A leftover container with the same name would make `run` fail
    remove_container(runtime, &container.name).await?;

    info!(container = %container.name, "Starting container");
    debug!(args = %invocation.display_args(container), "Container run arguments");

    let mut cmd = Command::new(runtime.command());
    cmd.args(&invocation.args);
    for (name, value) in &invocation.secret_env {
        cmd.env(name, value);
    }

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(ContainerError::ContainerStartFailed {
            name: container.name.clone(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();

    for (network, aliases) in &invocation.extra_networks {
        connect_network(runtime, network, &container.name, aliases).await?;
    }

    if container.must_run && !is_running(runtime, &container.name).await? {
        return Err(ContainerError::NotRunning {
            name: container.name.clone(),
        });
    }

    Ok(id)
}

/// Whether the named container is currently running
pub async fn is_running(runtime: ContainerRuntime, name: &str) -> Result<bool, ContainerError> {
    let output = Command::new(runtime.command())
        .args(["inspect", "--format", "{{.State.Running}}", name])
        .output()
        .await?;

    Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
}

/// Force-remove a container; a missing container is not an error
pub async fn remove_container(runtime: ContainerRuntime, name: &str) -> Result<(), ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }

    let output = Command::new(runtime.command())
        .args(["rm", "-f", name])
        .output()
        .await
        .map_err(|e| ContainerError::CleanupFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !is_not_found(&stderr) {
            return Err(ContainerError::CleanupFailed {
                name: name.to_string(),
                reason: stderr.trim().to_string(),
            });
        }
    }

    Ok(())
}

/// Create a network, adopting an existing one with the same name
pub async fn ensure_network(
    runtime: ContainerRuntime,
    name: &str,
    driver: &str,
) -> Result<String, ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }

    let existing = Command::new(runtime.command())
        .args(["network", "inspect", "--format", "{{.Id}}", name])
        .output()
        .await?;
    if existing.status.success() {
        debug!(network = %name, "Adopting existing network");
        return Ok(String::from_utf8_lossy(&existing.stdout).trim().to_string());
    }

    info!(network = %name, driver = %driver, "Creating network");
    let output = Command::new(runtime.command())
        .args(["network", "create", "--driver", driver, name])
        .output()
        .await?;

    if !output.status.success() {
        return Err(ContainerError::NetworkFailed {
            name: name.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Remove a network; a missing network is not an error
pub async fn remove_network(runtime: ContainerRuntime, name: &str) -> Result<(), ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }

    info!(network = %name, "Removing network");
    let output = Command::new(runtime.command())
        .args(["network", "rm", name])
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !is_not_found(&stderr) {
            return Err(ContainerError::NetworkFailed {
                name: name.to_string(),
                reason: stderr.trim().to_string(),
            });
        }
    }

    Ok(())
}

async fn connect_network(
    runtime: ContainerRuntime,
    network: &str,
    container: &str,
    aliases: &[String],
) -> Result<(), ContainerError> {
    let mut cmd = Command::new(runtime.command());
    cmd.args(["network", "connect"]);
    for alias in aliases {
        cmd.args(["--alias", alias]);
    }
    cmd.args([network, container]);

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(ContainerError::NetworkFailed {
            name: network.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such") || stderr.contains("not found") || stderr.contains("no container")
}
