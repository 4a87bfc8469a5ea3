//! Runtime configuration and the installation path layout.
//!
//! Environment variables (all `SORTIE_`-prefixed) override the config
//! file, which overrides defaults:
//!
//! - `SORTIE_ROOT`: installation/data root
//! - `SORTIE_PORT`: dashboard port (the dashboard itself is an external
//!   collaborator; the value is parsed and stored for it)
//! - `SORTIE_DEBUG`: debug mode
//! - `SORTIE_PROVIDER`: preferred LLM provider identifier
//! - `SORTIE_TOKEN_WATCHER`: enable/disable the realtime token watcher

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn flag_enabled(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_port")]
    pub dashboard_port: u16,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_true")]
    pub token_watcher_enabled: bool,
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    #[serde(default = "default_max_subagents")]
    pub max_subagents_per_agent: usize,
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,
}

fn default_port() -> u16 {
    5050
}
fn default_provider() -> String {
    "claude".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_agents() -> usize {
    5
}
fn default_max_subagents() -> usize {
    10
}
fn default_stage_timeout() -> u64 {
    3600
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            dashboard_port: default_port(),
            debug: false,
            provider: default_provider(),
            token_watcher_enabled: true,
            max_agents: default_max_agents(),
            max_subagents_per_agent: default_max_subagents(),
            stage_timeout_seconds: default_stage_timeout(),
        }
    }
}

impl RuntimeConfig {
    /// Load `config.toml` from the root (if present), then apply
    /// environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join("config.toml");
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            RuntimeConfig::default()
        };

        if let Ok(port) = std::env::var("SORTIE_PORT") {
            config.dashboard_port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid SORTIE_PORT: {}", port)))?;
        }
        if let Ok(debug) = std::env::var("SORTIE_DEBUG") {
            config.debug = flag_enabled(&debug);
        }
        if let Ok(provider) = std::env::var("SORTIE_PROVIDER") {
            config.provider = provider;
        }
        if let Ok(watcher) = std::env::var("SORTIE_TOKEN_WATCHER") {
            config.token_watcher_enabled = flag_enabled(&watcher);
        }

        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(root.join("config.toml"), content)?;
        Ok(())
    }
}

/// Resolve the installation root: explicit path, `SORTIE_ROOT`, the XDG
/// data directory, or `~/.sortie` as a last resort.
pub fn resolve_root(explicit: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(expand_tilde(path));
    }
    if let Ok(env_root) = std::env::var("SORTIE_ROOT") {
        return Ok(expand_tilde(&env_root));
    }
    if let Some(data_dir) = dirs::data_dir() {
        return Ok(data_dir.join("sortie"));
    }
    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home).join(".sortie"));
    }
    Err(Error::Config(
        "could not determine installation root: no HOME or XDG data directory".to_string(),
    ))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Every on-disk location under the installation root.
#[derive(Debug, Clone)]
pub struct InstallPaths {
    root: PathBuf,
}

impl InstallPaths {
    pub fn new(root: &Path) -> Self {
        InstallPaths { root: root.to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn mission_path(&self) -> PathBuf {
        self.state_dir().join("mission.json")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir().join("mission_queue.json")
    }

    pub fn processing_lock_path(&self) -> PathBuf {
        self.state_dir().join("queue_processing.lock")
    }

    pub fn auto_advance_signal_path(&self) -> PathBuf {
        self.state_dir().join("auto_advance_signal.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn missions_dir(&self) -> PathBuf {
        self.root.join("missions")
    }

    pub fn mission_logs_dir(&self) -> PathBuf {
        self.missions_dir().join("mission_logs")
    }

    pub fn mission_workspace(&self, mission_id: &str) -> PathBuf {
        self.missions_dir().join(mission_id).join("workspace")
    }

    pub fn investigations_dir(&self) -> PathBuf {
        self.root.join("investigations")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn analytics_db(&self) -> PathBuf {
        self.data_dir().join("analytics").join("mission_analytics.db")
    }

    pub fn knowledge_db(&self) -> PathBuf {
        self.data_dir().join("knowledge_base").join("knowledge.db")
    }

    pub fn suggestions_db(&self) -> PathBuf {
        self.data_dir().join("suggestions.db")
    }

    pub fn ground_rules_path(&self) -> PathBuf {
        self.root.join("GROUND_RULES.md")
    }

    pub fn transcripts_base(&self) -> PathBuf {
        self.root.join("transcripts")
    }

    pub fn executor_results_dir(&self) -> PathBuf {
        self.root.join("experiments").join("hierarchical_results")
    }

    /// Create every directory the runtime expects.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.state_dir(),
            self.checkpoints_dir(),
            self.snapshots_dir(),
            self.backups_dir(),
            self.missions_dir(),
            self.mission_logs_dir(),
            self.investigations_dir(),
            self.data_dir(),
            self.transcripts_base(),
            self.executor_results_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
