pub mod api;
pub mod bridge;
pub mod build;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod project;
pub mod sandbox;
pub mod signature;
pub mod status;
pub mod vcs;
pub mod webhook;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::dispatch::BuildDispatcher;
use crate::error::{PipelineError, Result};
use crate::project::ProjectResolver;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub project: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// Namespace handed to the project resolver
    pub namespace: String,
    pub max_body_bytes: usize,
    pub log_dir: Option<PathBuf>,
    /// Rotated log files kept in `log_dir`
    pub log_max_files: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8888".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_body_bytes: 25 * 1024 * 1024,
            log_dir: None,
            log_max_files: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BuildConfig {
    /// Root of the per-repository working copies
    pub cache_root: PathBuf,
    pub runner_script: PathBuf,
    pub interpreter: String,
    pub max_concurrent_builds: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("_cache"),
            runner_script: PathBuf::from("js/runner.js"),
            interpreter: "node".to_string(),
            max_concurrent_builds: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub target_url: String,
    /// Label identifying this service on published commit statuses
    pub context: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            token: None,
            target_url: "http://localhost:8888".to_string(),
            context: "pushbuild".to_string(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct ProjectConfig {
    /// Repository full name, `owner/repo`
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub secret: String,
    pub ssh_key: Option<String>,
    pub ssh_key_file: Option<PathBuf>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl std::fmt::Debug for ProjectConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectConfig")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("secret", &"<redacted>")
            .field("ssh_key", &self.ssh_key.as_ref().map(|_| "<redacted>"))
            .field("ssh_key_file", &self.ssh_key_file)
            .finish()
    }
}

impl ProjectConfig {
    /// Returns true if a valid (non-empty) secret is set.
    pub fn has_valid_secret(&self) -> bool {
        !self.secret.is_empty()
    }
}

impl PipelineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reads `ssh_key_file` entries into `ssh_key` so builds never touch the
    /// configured key paths.
    fn load_key_files(&mut self) -> Result<()> {
        for project in &mut self.project {
            if project.ssh_key.is_some() {
                continue;
            }
            if let Some(path) = &project.ssh_key_file {
                let key = fs::read_to_string(path).map_err(|e| {
                    PipelineError::ConfigError(format!(
                        "Failed to read SSH key for '{}' from '{}': {}",
                        project.name,
                        path.display(),
                        e
                    ))
                })?;
                project.ssh_key = Some(key);
            }
        }
        Ok(())
    }
}

/// Load and parse the configuration file
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let config_str = fs::read_to_string(path).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let mut config = PipelineConfig::from_toml_str(&config_str).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    config.load_key_files()?;

    Ok(config)
}

pub struct AppState {
    pub config: PipelineConfig,
    pub resolver: Arc<dyn ProjectResolver>,
    pub dispatcher: Arc<BuildDispatcher>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;
