use crate::cluster::{parse_host, ClusterConfig, RuntimeEnv};
use crate::dispatch::PlacementStrategy;
use crate::errors::{LaunchError, Result};
use crate::process_group::{Transport, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for either placement delay.
const MAX_DELAY_MS: u64 = 60_000;

/// Main launcher configuration, stored as TOML.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub cluster: ClusterSection,
    pub dispatch: DispatchConfig,
    pub process_group: ProcessGroupConfig,
    pub logging: LoggingConfig,
}

/// Cluster connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Registered coordinator address (`ip:port`)
    pub address: String,

    /// Working directory shipped to workers (defaults to the current directory)
    pub working_dir: Option<PathBuf>,
}

/// Rank dispatch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How rank 0 is placed on the coordinator node
    pub placement: PlacementStrategy,

    /// Delay between submitting rank 0 and the remaining ranks
    pub bias_window_ms: u64,

    /// Delay inside each task before the rank function runs
    pub task_start_delay_ms: u64,

    /// Accelerator units reserved per rank
    pub accelerators_per_rank: usize,
}

/// Process group rendezvous settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessGroupConfig {
    pub transport: Transport,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            working_dir: None,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            placement: PlacementStrategy::Pin,
            bias_window_ms: 500,
            task_start_delay_ms: 1000,
            accelerators_per_rank: 1,
        }
    }
}

impl Default for ProcessGroupConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Nccl,
            port: DEFAULT_PORT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_dir: None,
        }
    }
}

impl DispatchConfig {
    /// Dispatch settings with both placement delays disabled.
    pub fn immediate(placement: PlacementStrategy) -> Self {
        Self {
            placement,
            bias_window_ms: 0,
            task_start_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn bias_window(&self) -> Duration {
        Duration::from_millis(self.bias_window_ms)
    }

    pub fn task_start_delay(&self) -> Duration {
        Duration::from_millis(self.task_start_delay_ms)
    }

    /// Validate dispatch settings
    pub fn validate(&self) -> Result<()> {
        if self.accelerators_per_rank == 0 {
            return Err(LaunchError::Config(
                "accelerators_per_rank must be at least 1".into(),
            ));
        }

        if self.bias_window_ms > MAX_DELAY_MS {
            return Err(LaunchError::Config(format!(
                "bias_window_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }

        if self.task_start_delay_ms > MAX_DELAY_MS {
            return Err(LaunchError::Config(format!(
                "task_start_delay_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }

        Ok(())
    }
}

impl LaunchConfig {
    /// Get default configuration file path: `~/.meshlaunch/launch.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| LaunchError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".meshlaunch").join("launch.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: LaunchConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        parse_host(&self.cluster.address)
            .map_err(|e| LaunchError::Config(format!("Invalid cluster address: {}", e)))?;

        if let Some(dir) = &self.cluster.working_dir {
            if dir.as_os_str().is_empty() {
                return Err(LaunchError::Config("working_dir must not be empty".into()));
            }
        }

        self.dispatch.validate()?;

        if self.process_group.port == 0 {
            return Err(LaunchError::Config(
                "process_group.port must be non-zero".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(LaunchError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Cluster connection settings, resolving the working directory.
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        let working_dir = match &self.cluster.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        Ok(ClusterConfig {
            address: self.cluster.address.clone(),
            runtime_env: RuntimeEnv { working_dir },
        })
    }

    /// Write the configuration as TOML, replacing `path` in one rename.
    ///
    /// Refuses to write a configuration that would fail [`LaunchConfig::load`].
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let body = format!("{}{}", FILE_HEADER, toml::to_string_pretty(self)?);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let staging = staging_path(path);
        std::fs::write(&staging, body)?;
        if let Err(e) = std::fs::rename(&staging, path) {
            let _ = std::fs::remove_file(&staging);
            tracing::error!(path = %path.display(), error = %e, "Failed to replace configuration file");
            return Err(e.into());
        }

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

const FILE_HEADER: &str = "# mesh-launch configuration\n# Delays are in milliseconds.\n\n";

/// Hidden sibling of `path`, unique per process.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "launch.toml".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}
