//! Container specification, engine-observed state, and input validation.

use serde::{Deserialize, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Everything needed to create one sandbox container.
///
/// Resource caps are fixed at creation time and never renegotiated.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Image tag, e.g. `berth-nodejs`.
    pub image: String,
    /// Container name, e.g. `berth-brave-quiet-otter`.
    pub name: String,
    /// Named volume mounted at `mount_path`.
    pub volume: String,
    pub mount_path: String,
    /// Memory cap in megabytes.
    pub memory_mb: u64,
    /// CPU cap in cores (may be fractional).
    pub cpu_cores: f64,
}

impl ContainerSpec {
    /// Validate all fields before any engine command is issued.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.name)?;
        validate_volume_name(&self.volume)?;
        validate_container_path(&self.mount_path)?;

        if self.memory_mb == 0 {
            return Err(ContainerError::InvalidInput(
                "memory limit must be greater than zero".to_string(),
            ));
        }
        if !(self.cpu_cores.is_finite() && self.cpu_cores > 0.0) {
            return Err(ContainerError::InvalidInput(format!(
                "cpu limit must be a positive number, got {}",
                self.cpu_cores
            )));
        }

        Ok(())
    }
}

/// Container state as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    /// The engine has no such container.
    Missing,
}

impl ContainerState {
    /// Parse the `{{.State.Status}}` string reported by docker/podman.
    pub fn from_status(status: &str) -> Self {
        match status.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "exited" | "stopped" => ContainerState::Exited,
            "" => ContainerState::Missing,
            _ => ContainerState::Dead,
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Restarting)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Missing => "missing",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") || image.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' is not allowed",
            image
        )));
    }

    Ok(())
}

/// Validate a container ID or name.
///
/// IDs are hex strings, names are alphanumeric with `-` and `_`. Neither
/// may start with `-`, so they can never be read as a CLI flag.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    validate_object_name(name, "container")
}

/// Validate a volume name. Same rules as container names.
pub fn validate_volume_name(name: &str) -> ContainerResult<()> {
    validate_object_name(name, "volume")
}

fn validate_object_name(name: &str, kind: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(format!(
            "{kind} name cannot be empty"
        )));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(format!(
            "{kind} name exceeds maximum length of 128 characters"
        )));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "{kind} name must start with an alphanumeric character or underscore"
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "{kind} name '{name}' contains invalid characters"
        )));
    }

    Ok(())
}

/// Validate an absolute path inside the container.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }

    if path.split('/').any(|part| part == "..") {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' cannot contain '..'",
            path
        )));
    }

    if path.contains(':') || path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' contains invalid characters",
            path
        )));
    }

    Ok(())
}
