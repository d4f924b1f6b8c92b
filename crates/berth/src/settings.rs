//! Configuration file schema, loading, and the immutable runtime view.
//!
//! Sources are layered: built-in defaults, then the TOML config file, then
//! `BERTH_*` environment variables (`__` separates nested keys, e.g.
//! `BERTH_SANDBOX__MAX_MEMORY_MB=64`).

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::container::RuntimeType;

pub const APP_NAME: &str = "berth";

/// Everything the config file can hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxSettings,
    pub scheduler: SchedulerSettings,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub lessons: LessonConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 42550,
        }
    }
}

/// Per-container limits and lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// How long a parked container survives before cleanup.
    pub container_lifetime_ms: u64,
    pub max_memory_mb: u64,
    pub max_cpu_cores: f64,
    /// Grace period handed to the engine's stop command.
    pub stop_grace_seconds: u32,
    /// How long a takeover waits for the superseded connection to let go.
    pub takeover_timeout_ms: u64,
    /// How long a cancelled connection may take to finish in-flight engine
    /// calls and tear down before the takeover gives up.
    pub release_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            container_lifetime_ms: 60 * 60 * 1000,
            max_memory_mb: 32,
            max_cpu_cores: 1.0,
            stop_grace_seconds: 10,
            takeover_timeout_ms: 5_000,
            release_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_ms: u64,
    /// Maximum number of due tasks handled per poll.
    pub batch_size: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection string. Defaults to `berth.db` in the data directory.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container runtime type (auto-detected if not set).
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary.
    pub binary: Option<String>,
    /// Lesson images are tagged `<image_prefix>-<lesson type>`.
    pub image_prefix: String,
    /// Directory holding one `<lesson type>/Dockerfile` per lesson type.
    pub images_dir: String,
    /// Shell started inside the container for the terminal.
    pub shell: String,
    /// Mount point of the session volume inside the container.
    pub workdir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image_prefix: APP_NAME.to_string(),
            images_dir: "./images".to_string(),
            shell: "/bin/bash".to_string(),
            workdir: "/home/learner".to_string(),
        }
    }
}

/// Lesson path to lesson type mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LessonConfig {
    pub default_type: String,
    pub types: HashMap<String, String>,
}

impl Default for LessonConfig {
    fn default() -> Self {
        Self {
            default_type: "ubuntu".to_string(),
            types: HashMap::new(),
        }
    }
}

impl LessonConfig {
    /// Resolve the lesson type for a lesson path. An explicit type wins.
    pub fn resolve(&self, path: &str, explicit: Option<&str>) -> String {
        explicit
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.types.get(path).cloned())
            .unwrap_or_else(|| self.default_type.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Immutable view of the settings the session machinery needs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub container_lifetime: Duration,
    pub max_memory_mb: u64,
    pub max_cpu_cores: f64,
    pub stop_grace_seconds: u32,
    pub takeover_timeout: Duration,
    pub release_timeout: Duration,
    pub scheduler_poll_interval: Duration,
    pub scheduler_batch_size: u32,
    pub image_prefix: String,
    pub images_dir: PathBuf,
    pub shell: String,
    pub workdir: String,
    pub lessons: LessonConfig,
}

impl SandboxConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            container_lifetime: Duration::from_millis(cfg.sandbox.container_lifetime_ms),
            max_memory_mb: cfg.sandbox.max_memory_mb,
            max_cpu_cores: cfg.sandbox.max_cpu_cores,
            stop_grace_seconds: cfg.sandbox.stop_grace_seconds,
            takeover_timeout: Duration::from_millis(cfg.sandbox.takeover_timeout_ms),
            release_timeout: Duration::from_millis(cfg.sandbox.release_timeout_ms),
            scheduler_poll_interval: Duration::from_millis(cfg.scheduler.poll_interval_ms.max(1)),
            scheduler_batch_size: cfg.scheduler.batch_size.max(1),
            image_prefix: cfg.engine.image_prefix.clone(),
            images_dir: PathBuf::from(cfg.engine.images_dir.clone()),
            shell: cfg.engine.shell.clone(),
            workdir: cfg.engine.workdir.clone(),
            lessons: cfg.lessons.clone(),
        }
    }

    /// Image tag for a lesson type.
    pub fn image_tag(&self, lesson_type: &str) -> String {
        format!("{}-{}", self.image_prefix, lesson_type)
    }

    /// Dockerfile used to build the image for a lesson type.
    pub fn dockerfile_path(&self, lesson_type: &str) -> PathBuf {
        self.images_dir.join(lesson_type).join("Dockerfile")
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// Load configuration from `path` (optional) layered with the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(&env_prefix())
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

/// Write the default configuration to `path`.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let body = format!(
        "# Configuration for {}\n# File: {}\n\n{}",
        APP_NAME,
        path.display(),
        toml
    );
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Database URL from config, defaulting to the data directory.
pub fn database_url(cfg: &AppConfig) -> Result<String> {
    match cfg.database.url {
        Some(ref url) => Ok(shellexpand::full(url)
            .context("expanding database url")?
            .to_string()),
        None => Ok(format!(
            "sqlite://{}",
            default_data_dir()?.join("berth.db").display()
        )),
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_file() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME).join("config.toml"));
    }

    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .map(|dir| dir.join(APP_NAME).join("config.toml"))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.container_lifetime, Duration::from_millis(3_600_000));
        assert_eq!(cfg.max_memory_mb, 32);
        assert_eq!(cfg.max_cpu_cores, 1.0);
        assert_eq!(cfg.scheduler_poll_interval, Duration::from_secs(60));
        assert_eq!(AppConfig::default().server.port, 42550);
    }

    #[test]
    fn test_lesson_resolution_order() {
        let mut lessons = LessonConfig::default();
        lessons
            .types
            .insert("intro".to_string(), "nodejs".to_string());

        assert_eq!(lessons.resolve("intro", Some("python")), "python");
        assert_eq!(lessons.resolve("intro", None), "nodejs");
        assert_eq!(lessons.resolve("intro", Some("  ")), "nodejs");
        assert_eq!(lessons.resolve("unknown", None), "ubuntu");
    }

    #[test]
    fn test_image_tag_and_dockerfile() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image_tag("nodejs"), "berth-nodejs");
        assert_eq!(
            cfg.dockerfile_path("nodejs"),
            PathBuf::from("./images/nodejs/Dockerfile")
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[sandbox]
max_memory_mb = 64
container_lifetime_ms = 1000

[lessons]
default_type = "python"

[lessons.types]
intro = "nodejs"
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.sandbox.max_memory_mb, 64);
        assert_eq!(cfg.sandbox.container_lifetime_ms, 1000);
        assert_eq!(cfg.sandbox.max_cpu_cores, 1.0);
        assert_eq!(cfg.lessons.resolve("intro", None), "nodejs");
        assert_eq!(cfg.lessons.resolve("other", None), "python");
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.server.port, 42550);
        assert_eq!(cfg.engine.shell, "/bin/bash");
    }

    #[test]
    fn test_write_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth").join("config.toml");
        write_default_config(&path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# Configuration for berth"));
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.scheduler.poll_interval_ms, 60_000);
    }
}
