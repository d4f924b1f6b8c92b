//! Container engine adapter.
//!
//! Drives Docker or Podman through its CLI. The session machinery only sees
//! the [`ContainerEngine`] trait, so another backend (an API client, or a
//! fake in tests) can be substituted.

mod container;
mod error;

pub use container::{
    ContainerSpec, ContainerState, validate_container_name, validate_image_name,
    validate_volume_name,
};
pub use error::{ContainerError, ContainerResult};

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container engine operations used by the session manager.
///
/// Every call is a blocking external-process invocation in the CLI backend;
/// implementations must not stall the async executor.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a named volume. Creating an existing volume is a no-op.
    async fn create_volume(&self, name: &str) -> ContainerResult<()>;
    async fn remove_volume(&self, name: &str) -> ContainerResult<()>;
    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    /// Build `image` from a Dockerfile; the Dockerfile's directory is the context.
    async fn build_image(&self, image: &str, dockerfile: &Path) -> ContainerResult<()>;
    /// Create (but do not start) a container. Returns its id.
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String>;
    async fn start(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop(&self, container_id: &str, grace_seconds: u32) -> ContainerResult<()>;
    /// Force-remove a container.
    async fn remove(&self, container_id: &str) -> ContainerResult<()>;
    async fn container_state(&self, container_id: &str) -> ContainerResult<ContainerState>;
    /// Check that the engine answers. Returns its version report.
    async fn health_check(&self) -> ContainerResult<String>;
    /// Command line that opens an interactive shell in a running container.
    fn tty_command(&self, container_id: &str, shell: &str) -> Vec<String>;
}

/// Container runtime client for managing containers via the CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::detect()
    }
}

impl ContainerRuntime {
    /// Create a runtime by probing PATH: Docker first, then Podman.
    pub fn detect() -> Self {
        let runtime_type = [RuntimeType::Docker, RuntimeType::Podman]
            .into_iter()
            .find(|rt| Self::is_binary_available(rt.default_binary()))
            .unwrap_or_default();
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Build from the optional `engine.runtime` / `engine.binary` settings.
    pub fn from_settings(runtime: Option<RuntimeType>, binary: Option<&str>) -> Self {
        let base = match runtime {
            Some(rt) => Self::with_type(rt),
            None => Self::detect(),
        };
        match binary {
            Some(path) if !path.trim().is_empty() => Self::with_binary(base.runtime_type, path),
            _ => base,
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run one engine command and capture its output.
    async fn exec(&self, command: &str, args: &[&str]) -> ContainerResult<Output> {
        log::debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Run a command that must succeed. `target` names the object acted on,
    /// so "no such ..." failures map to the not-found variants.
    async fn exec_checked(
        &self,
        command: &str,
        args: &[&str],
        target: Option<NotFoundTarget<'_>>,
    ) -> ContainerResult<String> {
        let output = self.exec(command, args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_no_such_object(&stderr) {
            match target {
                Some(NotFoundTarget::Container(id)) => {
                    return Err(ContainerError::ContainerNotFound(id.to_string()));
                }
                Some(NotFoundTarget::Volume(name)) => {
                    return Err(ContainerError::VolumeNotFound(name.to_string()));
                }
                None => {}
            }
        }

        Err(ContainerError::CommandFailed {
            command: command.to_string(),
            message: stderr,
        })
    }
}

enum NotFoundTarget<'a> {
    Container(&'a str),
    Volume(&'a str),
}

fn is_no_such_object(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("no such volume")
        || lower.contains("no such object")
        || lower.contains("no container with name or id")
}

/// Arguments for `create`, kept separate so they can be checked without an engine.
fn create_args(spec: &ContainerSpec, runtime_type: RuntimeType) -> Vec<String> {
    let mount = if runtime_type.needs_selinux_labels() {
        format!("{}:{}:Z", spec.volume, spec.mount_path)
    } else {
        format!("{}:{}", spec.volume, spec.mount_path)
    };

    vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--hostname".to_string(),
        spec.name.clone(),
        "-i".to_string(),
        "-t".to_string(),
        "--memory".to_string(),
        format!("{}m", spec.memory_mb),
        "--memory-swap".to_string(),
        format!("{}m", spec.memory_mb),
        "--cpus".to_string(),
        spec.cpu_cores.to_string(),
        "-v".to_string(),
        mount,
        "-w".to_string(),
        spec.mount_path.clone(),
        spec.image.clone(),
    ]
}

#[async_trait]
impl ContainerEngine for ContainerRuntime {
    async fn create_volume(&self, name: &str) -> ContainerResult<()> {
        validate_volume_name(name)?;
        self.exec_checked("volume create", &["volume", "create", name], None)
            .await
            .map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        validate_volume_name(name)?;
        self.exec_checked(
            "volume rm",
            &["volume", "rm", "-f", name],
            Some(NotFoundTarget::Volume(name)),
        )
        .await
        .map(|_| ())
    }

    /// Uses `image inspect`, which works for both Docker and Podman.
    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let output = self.exec("image inspect", &["image", "inspect", image]).await?;
        Ok(output.status.success())
    }

    async fn build_image(&self, image: &str, dockerfile: &Path) -> ContainerResult<()> {
        validate_image_name(image)?;
        if !dockerfile.is_file() {
            return Err(ContainerError::MissingDockerfile {
                image: image.to_string(),
                path: dockerfile.display().to_string(),
            });
        }

        let context = dockerfile
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dockerfile = dockerfile.to_string_lossy();
        let context = context.to_string_lossy();

        log::info!("Building image {} from {}", image, dockerfile);
        self.exec_checked(
            "build",
            &["build", "-t", image, "-f", &dockerfile, &context],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<String> {
        spec.validate()?;
        let owned_args = create_args(spec, self.runtime_type);
        let args: Vec<&str> = owned_args.iter().map(String::as_str).collect();
        let id = self.exec_checked("create", &args, None).await?;
        // Some engines print pull progress before the id.
        let id = id.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "engine returned no container id".to_string(),
            });
        }
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.exec_checked(
            "start",
            &["start", container_id],
            Some(NotFoundTarget::Container(container_id)),
        )
        .await
        .map(|_| ())
    }

    async fn stop(&self, container_id: &str, grace_seconds: u32) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        let grace = grace_seconds.to_string();
        self.exec_checked(
            "stop",
            &["stop", "-t", &grace, container_id],
            Some(NotFoundTarget::Container(container_id)),
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_name(container_id)?;
        self.exec_checked(
            "rm",
            &["rm", "-f", container_id],
            Some(NotFoundTarget::Container(container_id)),
        )
        .await
        .map(|_| ())
    }

    async fn container_state(&self, container_id: &str) -> ContainerResult<ContainerState> {
        validate_container_name(container_id)?;
        let output = self
            .exec(
                "inspect",
                &["inspect", "--format", "{{.State.Status}}", container_id],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_such_object(&stderr) {
                return Ok(ContainerState::Missing);
            }
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(ContainerState::from_status(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn health_check(&self) -> ContainerResult<String> {
        self.exec_checked("version", &["version", "--format", "json"], None)
            .await
    }

    fn tty_command(&self, container_id: &str, shell: &str) -> Vec<String> {
        vec![
            self.binary.clone(),
            "exec".to_string(),
            "-it".to_string(),
            container_id.to_string(),
            shell.to_string(),
        ]
    }
}
