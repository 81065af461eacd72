//! Configuration management for brood
//!
//! This module provides the director-level settings (spawn defaults, hub
//! tunables, container invocation), the resolved on-disk paths derived from
//! them, and the per-helper budget artifact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BroodError, Result};
use crate::identity::Numbering;
use crate::layout::ChannelLayout;
use crate::types::{HelperId, SpawnBudget, DEFAULT_BREADTH, DEFAULT_DEPTH};

/// Socket path override (set inside helper containers)
pub const ENV_SOCKET: &str = "BROOD_SOCKET";
/// Budget artifact path override
pub const ENV_SPAWN_FILE: &str = "BROOD_SPAWN_FILE";
/// Identity of the current helper
pub const ENV_HELPER_ID: &str = "BROOD_HELPER_ID";
/// Project root override
pub const ENV_ROOT: &str = "BROOD_ROOT";
/// Container runtime command override
pub const ENV_DOCKER_CMD: &str = "BROOD_DOCKER_CMD";

/// Directory under the project root holding config, socket and log
pub const RUNTIME_DIR: &str = ".brood";

/// Director-level brood configuration
///
/// Loaded from `.brood/config.toml` in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroodConfig {
    /// Budget of the director and numbering base of its tree
    #[serde(default)]
    pub spawn: SpawnConfig,

    /// Hub process tunables
    #[serde(default)]
    pub hub: HubConfig,

    /// Container runtime invocation
    #[serde(default)]
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Spawn levels permitted below the director
    #[serde(default = "default_depth")]
    pub depth: u32,

    /// Direct children the director may have
    #[serde(default = "default_breadth")]
    pub breadth: u32,

    /// Upper bound on any helper's breadth; fixes the numbering base
    #[serde(default = "default_breadth")]
    pub max_breadth: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_socket_name")]
    pub socket_name: String,

    #[serde(default = "default_log_name")]
    pub log_name: String,

    /// Client-side bound on one request round trip
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Grace period given to a helper process before it is killed
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Pushes buffered per subscriber before new ones are dropped
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// `podman` or `docker`; detected when unset
    #[serde(default)]
    pub runtime: Option<String>,

    #[serde(default = "default_image")]
    pub image: String,

    /// Container name is `{name_prefix}-{identity}`
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default)]
    pub entrypoint: Option<String>,

    /// Agent command started by the entrypoint after registration
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,

    /// Extra environment passed into every helper container
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

// Default value providers
fn default_depth() -> u32 {
    DEFAULT_DEPTH
}

fn default_breadth() -> u32 {
    DEFAULT_BREADTH
}

fn default_socket_name() -> String {
    "hub.sock".to_string()
}

fn default_log_name() -> String {
    "messages.jsonl".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_image() -> String {
    "brood-agent:latest".to_string()
}

fn default_name_prefix() -> String {
    "brood-helper".to_string()
}

fn default_agent_command() -> Vec<String> {
    vec!["claude".to_string()]
}

impl BroodConfig {
    /// Load configuration from `.brood/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = Self::path(root);

        let config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| BroodError::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.brood/config.toml`
    pub fn write_default(root: &Path) -> Result<()> {
        let config_dir = root.join(RUNTIME_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| BroodError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(Self::path(root), content)?;
        Ok(())
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(RUNTIME_DIR).join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.spawn.max_breadth == 0 {
            return Err(BroodError::Config("spawn.max_breadth must be at least 1".to_string()));
        }
        if self.spawn.breadth > self.spawn.max_breadth {
            return Err(BroodError::Config(format!(
                "spawn.breadth {} exceeds spawn.max_breadth {}",
                self.spawn.breadth, self.spawn.max_breadth
            )));
        }
        if self.hub.subscriber_queue == 0 {
            return Err(BroodError::Config("hub.subscriber_queue must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn director_budget(&self) -> SpawnBudget {
        SpawnBudget::new(self.spawn.depth, self.spawn.breadth)
    }

    pub fn numbering(&self) -> Result<Numbering> {
        Numbering::new(self.spawn.max_breadth)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.hub.request_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.hub.stop_grace_secs)
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            breadth: default_breadth(),
            max_breadth: default_breadth(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            socket_name: default_socket_name(),
            log_name: default_log_name(),
            request_timeout_ms: default_request_timeout_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            image: default_image(),
            name_prefix: default_name_prefix(),
            entrypoint: None,
            agent_command: default_agent_command(),
            env: BTreeMap::new(),
        }
    }
}

/// On-disk locations of one director's hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubPaths {
    pub runtime_dir: PathBuf,
    pub socket: PathBuf,
    pub log: PathBuf,
    pub helpers_root: PathBuf,
}

impl HubPaths {
    pub fn new(root: &Path, config: &BroodConfig) -> Self {
        let runtime_dir = root.join(RUNTIME_DIR);
        Self {
            socket: runtime_dir.join(&config.hub.socket_name),
            log: runtime_dir.join(&config.hub.log_name),
            helpers_root: runtime_dir.join("helpers"),
            runtime_dir,
        }
    }

    /// Like [`HubPaths::new`], but honours `BROOD_SOCKET`
    pub fn from_env(root: &Path, config: &BroodConfig) -> Self {
        let mut paths = Self::new(root, config);
        if let Some(socket) = std::env::var_os(ENV_SOCKET) {
            paths.socket = PathBuf::from(socket);
        }
        paths
    }

    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout::new(&self.helpers_root)
    }
}

/// Read-only `spawn.toml` handed to each helper
///
/// ```toml
/// identity = 5
/// parent = 1
///
/// [spawn]
/// depth = 1
/// breadth = 3
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetArtifact {
    pub identity: HelperId,
    pub parent: HelperId,
    pub spawn: SpawnBudget,
}

impl BudgetArtifact {
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|e| BroodError::Config(format!("Failed to serialize budget artifact: {}", e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BroodError::Config(format!("Failed to parse budget artifact: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load the artifact named by `BROOD_SPAWN_FILE`, if set and present
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os(ENV_SPAWN_FILE) {
            Some(path) if Path::new(&path).exists() => Self::load(Path::new(&path)).map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = BroodConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.director_budget(), SpawnBudget::new(4, 4));
        assert_eq!(config.numbering().unwrap().base(), 4);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(RUNTIME_DIR)).unwrap();
        std::fs::write(
            BroodConfig::path(dir.path()),
            "[spawn]\ndepth = 2\nbreadth = 3\nmax_breadth = 3\n\n[container]\nimage = \"agent:dev\"\n",
        )
        .unwrap();

        let config = BroodConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.director_budget(), SpawnBudget::new(2, 3));
        assert_eq!(config.container.image, "agent:dev");
        assert_eq!(config.container.name_prefix, "brood-helper");
        assert_eq!(config.hub.socket_name, "hub.sock");
    }

    #[test]
    fn test_breadth_above_max_rejected() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(RUNTIME_DIR)).unwrap();
        std::fs::write(
            BroodConfig::path(dir.path()),
            "[spawn]\nbreadth = 5\nmax_breadth = 4\n",
        )
        .unwrap();

        let err = BroodConfig::load_or_default(dir.path()).unwrap_err();
        assert!(matches!(err, BroodError::Config(_)));
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = tempdir().unwrap();
        BroodConfig::write_default(dir.path()).unwrap();
        let config = BroodConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.hub.subscriber_queue, 256);
    }

    #[test]
    fn test_hub_paths() {
        let paths = HubPaths::new(Path::new("/proj"), &BroodConfig::default());
        assert_eq!(paths.socket, PathBuf::from("/proj/.brood/hub.sock"));
        assert_eq!(paths.log, PathBuf::from("/proj/.brood/messages.jsonl"));
        assert_eq!(paths.layout().root(), Path::new("/proj/.brood/helpers"));
    }

    #[test]
    fn test_budget_artifact_format() {
        let artifact = BudgetArtifact {
            identity: 5,
            parent: 1,
            spawn: SpawnBudget::new(1, 3),
        };
        let text = artifact.to_toml().unwrap();
        assert!(text.contains("identity = 5"));
        assert!(text.contains("[spawn]"));
        assert_eq!(BudgetArtifact::from_toml(&text).unwrap(), artifact);
    }
}
