//! Crate configuration.
//!
//! One TOML file at `~/.config/caam/config.toml` (or `$CAAM_CONFIG_DIR/
//! config.toml`), every section defaulted so a missing file means stock
//! behavior. Data lives separately under the XDG data dir.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::pane::PaneBackend;
use crate::pool::{MonitorConfig, PoolOptions};
use crate::rotation::Algorithm;

pub const CONFIG_FILE: &str = "config.toml";

/// Root of caam's persistent data: `$XDG_DATA_HOME/caam`, falling back to
/// `~/.local/share/caam`.
pub fn data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.data_dir().join("caam"))
        .unwrap_or_else(|| PathBuf::from(".caam"))
}

/// Config directory: `$CAAM_CONFIG_DIR` wins, then `~/.config/caam`.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("CAAM_CONFIG_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join("caam"))
        .unwrap_or_else(|| PathBuf::from(".caam"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    /// Vault root; empty means `<data_dir>/vault`.
    pub root: Option<PathBuf>,
}

impl VaultSection {
    pub fn root_path(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| data_dir().join("vault"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Snapshot path; empty means `<data_dir>/auth_pool_state.json`.
    pub state_path: Option<PathBuf>,
    pub max_retries: u32,
    pub cooldown_secs: u64,
    pub refresh_threshold_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            state_path: None,
            max_retries: 3,
            cooldown_secs: 5 * 60,
            refresh_threshold_secs: 5 * 60,
        }
    }
}

impl PoolSection {
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| data_dir().join("auth_pool_state.json"))
    }

    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            max_retries: self.max_retries,
            cooldown: Duration::from_secs(self.cooldown_secs),
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub check_interval_secs: u64,
    pub max_concurrent: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            max_concurrent: 3,
        }
    }
}

impl MonitorSection {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            max_concurrent: self.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSection {
    pub algorithm: String,
    pub recent_use_window_secs: u64,
}

impl Default for RotationSection {
    fn default() -> Self {
        Self {
            algorithm: "smart".to_string(),
            recent_use_window_secs: 30 * 60,
        }
    }
}

impl RotationSection {
    pub fn algorithm(&self) -> Result<Algorithm> {
        self.algorithm.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub backend: PaneBackend,
    pub poll_interval_ms: u64,
    pub output_lines: u32,
    pub state_timeout_secs: u64,
    pub auth_timeout_secs: u64,
    pub http_port: u16,
    pub resume_prompt: Option<String>,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            backend: PaneBackend::Auto,
            poll_interval_ms: 500,
            output_lines: 100,
            state_timeout_secs: 30,
            auth_timeout_secs: 60,
            http_port: 8377,
            resume_prompt: None,
        }
    }
}

impl CoordinatorSection {
    pub fn coordinator_config(&self) -> crate::coordinator::CoordinatorConfig {
        let mut cfg = crate::coordinator::CoordinatorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            output_lines: self.output_lines,
            state_timeout: Duration::from_secs(self.state_timeout_secs),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            http_port: self.http_port,
            ..crate::coordinator::CoordinatorConfig::default()
        };
        if let Some(prompt) = &self.resume_prompt {
            cfg.resume_prompt = prompt.clone();
        }
        cfg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Health file path; empty means `<data_dir>/health.json`.
    pub path: Option<PathBuf>,
    pub penalty_half_life_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            path: None,
            penalty_half_life_secs: 3600,
        }
    }
}

impl HealthSection {
    pub fn path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| data_dir().join("health.json"))
    }

    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.penalty_half_life_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vault: VaultSection,
    pub pool: PoolSection,
    pub monitor: MonitorSection,
    pub rotation: RotationSection,
    pub coordinator: CoordinatorSection,
    pub health: HealthSection,
}

impl Config {
    pub fn config_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    /// Load the config file, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::io(format!("reading {}", path.display()), e)),
        };
        toml::from_str(&raw).map_err(|e| Error::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;
        }
        let raw = toml::to_string_pretty(self).map_err(|e| Error::Config {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(path, raw).map_err(|e| Error::io(format!("writing {}", path.display()), e))
    }
}
