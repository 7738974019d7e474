//! Configuration for vantage.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (VANTAGE_HOME, VANTAGE_BIND, VANTAGE_SCANNER_URL, VANTAGE_SCANNER_KEY)
//! 2. Config file (.vantage/config.yaml)
//! 3. Defaults (~/.vantage)
//!
//! Config file discovery:
//! - Searches current directory and parents for .vantage/config.yaml
//! - `paths.home` in the config file is relative to the .vantage/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::registry::DEFAULT_TASK_TIMEOUT;
use crate::core::retry::RetryPolicy;
use crate::core::validation::TargetPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Default server bind address
pub const DEFAULT_BIND: &str = "127.0.0.1:9000";

/// Database file name inside the home directory
pub const DB_FILE: &str = "vantage.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub scanner: Option<ScannerConfig>,
    #[serde(default)]
    pub progress: Option<ProgressConfig>,
    #[serde(default)]
    pub targets: Option<TargetPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .vantage/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Base URL of the scanner functions
    pub url: Option<String>,
    /// Shared key sent as x-scanner-key
    pub key: Option<String>,
    pub task_timeout_seconds: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    pub ramp_seconds: Option<u64>,
    pub ramp_cap: Option<f64>,
}

/// Client-side progress simulation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSettings {
    /// Time for the simulated value to reach the cap
    pub ramp: Duration,
    /// Ceiling of the simulated value, in percent
    pub cap: f64,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            ramp: Duration::from_secs(60),
            cap: 90.0,
        }
    }
}

/// Scanner backend settings
#[derive(Debug, Clone, Serialize)]
pub struct ScannerSettings {
    pub url: Option<String>,
    #[serde(skip_serializing)]
    pub key: Option<String>,
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to vantage home (database lives here)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Server bind address
    pub bind: String,
    pub scanner: ScannerSettings,
    pub progress: ProgressSettings,
    pub targets: TargetPolicy,
}

impl ResolvedConfig {
    /// Path of the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.home.join(DB_FILE)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".vantage").join("config.yaml");
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

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Layer a parsed config file over the defaults
fn apply_file(config: &mut ResolvedConfig, file: ConfigFile, config_path: &Path) {
    if let Some(ref home_path) = file.paths.home {
        let vantage_dir = config_path.parent().unwrap_or(Path::new("."));
        config.home = resolve_path(vantage_dir, home_path);
    }

    if let Some(bind) = file.server.and_then(|s| s.bind) {
        config.bind = bind;
    }

    if let Some(scanner) = file.scanner {
        if scanner.url.is_some() {
            config.scanner.url = scanner.url;
        }
        if scanner.key.is_some() {
            config.scanner.key = scanner.key;
        }
        if let Some(secs) = scanner.task_timeout_seconds {
            config.scanner.task_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(retry) = scanner.retry {
            config.scanner.retry = retry;
        }
    }

    if let Some(progress) = file.progress {
        if let Some(secs) = progress.ramp_seconds {
            config.progress.ramp = Duration::from_secs(secs.max(1));
        }
        if let Some(cap) = progress.ramp_cap {
            config.progress.cap = cap.clamp(0.0, 99.0);
        }
    }

    if let Some(targets) = file.targets {
        config.targets = targets;
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".vantage");

    let mut config = ResolvedConfig {
        home: default_home,
        config_file: None,
        bind: DEFAULT_BIND.to_string(),
        scanner: ScannerSettings::default(),
        progress: ProgressSettings::default(),
        targets: TargetPolicy::default(),
    };

    // Check for config file
    if let Some(config_path) = find_config_file() {
        let file = load_config_file(&config_path)?;
        apply_file(&mut config, file, &config_path);
        config.config_file = Some(config_path);
    }

    // Environment wins
    if let Some(home) = env_var("VANTAGE_HOME") {
        config.home = PathBuf::from(home);
    }
    if let Some(bind) = env_var("VANTAGE_BIND") {
        config.bind = bind;
    }
    if let Some(url) = env_var("VANTAGE_SCANNER_URL") {
        config.scanner.url = Some(url);
    }
    if let Some(key) = env_var("VANTAGE_SCANNER_KEY") {
        config.scanner.key = Some(key);
    }

    Ok(config)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the vantage home directory
pub fn vantage_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the database path ($VANTAGE_HOME/vantage.db)
pub fn db_path() -> Result<PathBuf> {
    Ok(config()?.db_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn defaults() -> ResolvedConfig {
        ResolvedConfig {
            home: PathBuf::from("/default/.vantage"),
            config_file: None,
            bind: DEFAULT_BIND.to_string(),
            scanner: ScannerSettings::default(),
            progress: ProgressSettings::default(),
            targets: TargetPolicy::default(),
        }
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let vantage_dir = temp.path().join(".vantage");
        std::fs::create_dir_all(&vantage_dir).unwrap();

        let config_path = vantage_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: ./state
server:
  bind: 0.0.0.0:8080
scanner:
  url: https://scanners.example.com/functions/v1
  task_timeout_seconds: 30
  retry:
    max_attempts: 4
progress:
  ramp_seconds: 20
  ramp_cap: 85
targets:
  host_denylist:
    - "*.gov"
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version, "1.0");

        let mut config = defaults();
        apply_file(&mut config, parsed, &config_path);

        assert_eq!(config.home, vantage_dir.join("state"));
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(
            config.scanner.url.as_deref(),
            Some("https://scanners.example.com/functions/v1")
        );
        assert_eq!(config.scanner.task_timeout, Duration::from_secs(30));
        assert_eq!(config.scanner.retry.max_attempts, 4);
        assert_eq!(config.scanner.retry.initial_delay_ms, 1000);
        assert_eq!(config.progress.ramp, Duration::from_secs(20));
        assert_eq!(config.progress.cap, 85.0);
        assert_eq!(config.targets.host_denylist, vec!["*.gov".to_string()]);
        assert_eq!(config.targets.max_url_len, 2048);
    }

    #[test]
    fn test_missing_sections_keep_defaults() {
        let parsed: ConfigFile = serde_yaml::from_str("version: \"1.0\"\n").unwrap();
        let mut config = defaults();
        apply_file(&mut config, parsed, Path::new("/project/.vantage/config.yaml"));

        assert_eq!(config.home, PathBuf::from("/default/.vantage"));
        assert_eq!(config.scanner.task_timeout, DEFAULT_TASK_TIMEOUT);
        assert_eq!(config.progress, ProgressSettings::default());
        assert_eq!(config.db_path(), PathBuf::from("/default/.vantage/vantage.db"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
