//! Configuration for the pipewright engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PIPEWRIGHT_HOME, PIPEWRIGHT_MAX_CONCURRENT_STEPS,
//!    PIPEWRIGHT_DEFAULT_RETRY_LIMIT, PIPEWRIGHT_STEP_HEARTBEAT_TIMEOUT_SECONDS)
//! 2. Config file (.pipewright/config.yaml)
//! 3. Defaults (~/.pipewright)
//!
//! Config file discovery:
//! - Searches current directory and parents for .pipewright/config.yaml
//! - `paths.home` is relative to the .pipewright/ directory
//! - File source paths are relative to the project root (parent of .pipewright/)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::safety::SafetyLimits;
use crate::sources::SourceDescriptor;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub safety: Option<SafetyLimits>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .pipewright/)
    pub home: Option<String>,
}

/// `engine` section; every key optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub max_concurrent_steps: Option<usize>,
    pub default_retry_limit: Option<u32>,
    pub step_heartbeat_timeout_seconds: Option<u64>,
    pub cancel_grace_period_seconds: Option<u64>,
    pub subscription_buffer: Option<usize>,
}

/// Resolved engine settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Upper bound on steps running at once within one execution
    pub max_concurrent_steps: usize,

    /// Retry cap for policies without `max_retries`, and for stalled attempts
    pub default_retry_limit: u32,

    /// An attempt with no heartbeat for this long is presumed hung
    pub step_heartbeat_timeout_seconds: u64,

    /// How long cancellation and drain wait for in-flight attempts
    pub cancel_grace_period_seconds: u64,

    /// Per-execution update buffer; slow subscribers lose the oldest
    pub subscription_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4,
            default_retry_limit: 3,
            step_heartbeat_timeout_seconds: 60,
            cancel_grace_period_seconds: 10,
            subscription_buffer: 256,
        }
    }
}

impl EngineSettings {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.step_heartbeat_timeout_seconds)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_period_seconds)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_steps == 0 {
            anyhow::bail!("engine.maxConcurrentSteps must be at least 1");
        }
        if self.step_heartbeat_timeout_seconds == 0 {
            anyhow::bail!("engine.stepHeartbeatTimeoutSeconds must be at least 1");
        }
        if self.subscription_buffer == 0 {
            anyhow::bail!("engine.subscriptionBuffer must be at least 1");
        }
        Ok(())
    }

    fn overlay(mut self, file: &EngineConfig) -> Self {
        if let Some(v) = file.max_concurrent_steps {
            self.max_concurrent_steps = v;
        }
        if let Some(v) = file.default_retry_limit {
            self.default_retry_limit = v;
        }
        if let Some(v) = file.step_heartbeat_timeout_seconds {
            self.step_heartbeat_timeout_seconds = v;
        }
        if let Some(v) = file.cancel_grace_period_seconds {
            self.cancel_grace_period_seconds = v;
        }
        if let Some(v) = file.subscription_buffer {
            self.subscription_buffer = v;
        }
        self
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory (execution store and definition database)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub engine: EngineSettings,
    pub safety: SafetyLimits,
    /// Data sources by id
    pub sources: BTreeMap<String, SourceDescriptor>,
}

impl ResolvedConfig {
    /// SQLite database of definition versions
    pub fn definitions_db(&self) -> PathBuf {
        self.home.join("definitions.db")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".pipewright").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: Option<String>) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", name, v))
        })
        .transpose()
}

/// Combine a config file (if any) with environment overrides and defaults
fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let default_home = || -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".pipewright"))
    };

    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };
    let dot_dir = config_path.as_deref().and_then(Path::parent);
    let project_root = dot_dir.and_then(Path::parent);

    let home = if let Some(env_home) = env("PIPEWRIGHT_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home), Some(dot_dir)) = (file.paths.home.as_deref(), dot_dir) {
        resolve_path(dot_dir, Path::new(home))
    } else {
        default_home()?
    };

    let mut engine = EngineSettings::default().overlay(&file.engine);
    if let Some(v) = parse_env("PIPEWRIGHT_MAX_CONCURRENT_STEPS", env("PIPEWRIGHT_MAX_CONCURRENT_STEPS"))? {
        engine.max_concurrent_steps = v;
    }
    if let Some(v) = parse_env("PIPEWRIGHT_DEFAULT_RETRY_LIMIT", env("PIPEWRIGHT_DEFAULT_RETRY_LIMIT"))? {
        engine.default_retry_limit = v;
    }
    if let Some(v) = parse_env(
        "PIPEWRIGHT_STEP_HEARTBEAT_TIMEOUT_SECONDS",
        env("PIPEWRIGHT_STEP_HEARTBEAT_TIMEOUT_SECONDS"),
    )? {
        engine.step_heartbeat_timeout_seconds = v;
    }
    engine.validate()?;

    let sources = file
        .sources
        .into_iter()
        .map(|(id, descriptor)| {
            let descriptor = match (descriptor, project_root) {
                (SourceDescriptor::File { path, format }, Some(root)) => SourceDescriptor::File {
                    path: resolve_path(root, &path),
                    format,
                },
                (other, _) => other,
            };
            (id, descriptor)
        })
        .collect();

    Ok(ResolvedConfig {
        home,
        config_file: config_path,
        engine,
        safety: file.safety.unwrap_or_default(),
        sources,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    resolve(config_file, |name| std::env::var(name).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(temp: &TempDir, yaml: &str) -> PathBuf {
        let dot_dir = temp.path().join(".pipewright");
        std::fs::create_dir_all(&dot_dir).unwrap();
        let config_path = dot_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, no_env).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".pipewright");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.engine.max_concurrent_steps, 4);
        assert_eq!(config.engine.default_retry_limit, 3);
        assert_eq!(config.engine.step_heartbeat_timeout_seconds, 60);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./state
engine:
  maxConcurrentSteps: 8
  stepHeartbeatTimeoutSeconds: 30
safety:
  max_nodes: 50
sources:
  orders:
    type: file
    path: data/orders.jsonl
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        let config = resolve(Some((config_path.clone(), file)), no_env).unwrap();

        assert_eq!(config.home, temp.path().join(".pipewright").join("state"));
        assert_eq!(config.engine.max_concurrent_steps, 8);
        assert_eq!(config.engine.step_heartbeat_timeout_seconds, 30);
        assert_eq!(config.engine.default_retry_limit, 3);
        assert_eq!(config.safety.max_nodes, 50);
        assert_eq!(
            config.sources.get("orders"),
            Some(&SourceDescriptor::File {
                path: temp.path().join("data/orders.jsonl"),
                format: None,
            })
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "engine:\n  maxConcurrentSteps: 8\n");
        let file = load_config_file(&config_path).unwrap();

        let env: HashMap<&str, &str> = [
            ("PIPEWRIGHT_HOME", "/srv/pipewright"),
            ("PIPEWRIGHT_MAX_CONCURRENT_STEPS", "2"),
            ("PIPEWRIGHT_DEFAULT_RETRY_LIMIT", "0"),
        ]
        .into_iter()
        .collect();

        let config = resolve(Some((config_path, file)), |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.home, PathBuf::from("/srv/pipewright"));
        assert_eq!(config.engine.max_concurrent_steps, 2);
        assert_eq!(config.engine.default_retry_limit, 0);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let zero = |k: &str| (k == "PIPEWRIGHT_MAX_CONCURRENT_STEPS").then(|| "0".to_string());
        assert!(resolve(None, zero).is_err());

        let garbage = |k: &str| (k == "PIPEWRIGHT_DEFAULT_RETRY_LIMIT").then(|| "three".to_string());
        assert!(resolve(None, garbage).is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, Path::new("./subdir")),
            PathBuf::from("/home/user/project/./subdir")
        );
        assert_eq!(
            resolve_path(&base, Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }
}
