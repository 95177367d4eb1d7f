//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{WrapErr, eyre};
use serde::{Deserialize, Serialize};
use shepherd_api::{Group, Playbook};
use shepherd_bus::MqttConfig;
use shepherd_core::{DeployPolicy, DiscoveryConfig};

/// Top-level configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Broker connection
    #[serde(default)]
    pub bus: MqttConfig,
    /// Record storage
    #[serde(default)]
    pub store: StoreConfig,
    /// Discovery timing
    #[serde(default)]
    pub discovery: DiscoverySection,
    /// Deploy retry policy
    #[serde(default)]
    pub deploy: DeploySection,
    /// Playbooks loaded into the store at startup
    #[serde(default)]
    pub playbook: Vec<PlaybookConfig>,
    /// Groups loaded into the store at startup
    #[serde(default)]
    pub group: Vec<Group>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            bus: MqttConfig::default(),
            store: StoreConfig::default(),
            discovery: DiscoverySection::default(),
            deploy: DeploySection::default(),
            playbook: Vec::new(),
            group: Vec::new(),
        }
    }
}

/// Where records are kept
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory of JSON documents; records stay in memory when unset
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ping_delay_ms")]
    pub ping_delay_ms: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            ping_delay_ms: default_ping_delay_ms(),
            window_ms: default_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Attempts before abandoning; 0 retries until `abandon_after_secs`
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            abandon_after_secs: default_abandon_after_secs(),
            completion_timeout_secs: default_completion_timeout_secs(),
        }
    }
}

/// A playbook given inline or by file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Read the content from this file
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Inline content
    #[serde(default)]
    pub data: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

fn default_ping_delay_ms() -> u64 {
    500
}

fn default_window_ms() -> u64 {
    2000
}

fn default_retries() -> u32 {
    5
}

fn default_attempt_timeout_secs() -> u64 {
    5
}

fn default_abandon_after_secs() -> u64 {
    60 * 60
}

fn default_completion_timeout_secs() -> u64 {
    30 * 60
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be parsed
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("SHEPHERD_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            PathBuf::from("shepherd.toml"),
            PathBuf::from("/etc/shepherd/shepherd.toml"),
            dirs::config_dir()
                .map(|p| p.join("shepherd/shepherd.toml"))
                .unwrap_or_default(),
        ];

        for path in paths {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Config::default())
    }

    pub fn deploy_policy(&self) -> DeployPolicy {
        DeployPolicy {
            retries: self.deploy.retries,
            attempt_timeout: Duration::from_secs(self.deploy.attempt_timeout_secs),
            abandon_after: Duration::from_secs(self.deploy.abandon_after_secs),
            completion_timeout: Duration::from_secs(self.deploy.completion_timeout_secs),
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            interval: Duration::from_secs(self.discovery.interval_secs),
            ping_delay: Duration::from_millis(self.discovery.ping_delay_ms),
            window: Duration::from_millis(self.discovery.window_ms),
        }
    }

    /// Resolve configured playbooks, reading file-backed content
    ///
    /// # Errors
    /// Returns error if a playbook has neither `file` nor `data`, or its file cannot be read
    pub fn playbooks(&self) -> eyre::Result<Vec<Playbook>> {
        self.playbook
            .iter()
            .map(|pb| {
                let data = match (&pb.data, &pb.file) {
                    (Some(data), _) => data.clone(),
                    (None, Some(file)) => std::fs::read_to_string(file)
                        .wrap_err_with(|| format!("reading playbook {}", pb.id))?,
                    (None, None) => return Err(eyre!("playbook {} has no file or data", pb.id)),
                };
                let mut playbook = Playbook::new(pb.id.clone(), data);
                if let Some(name) = &pb.name {
                    playbook.name = name.clone();
                }
                Ok(playbook)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.deploy_policy(), DeployPolicy::default());
        assert_eq!(config.discovery(), DiscoveryConfig::default());
        assert!(config.store.dir.is_none());
        assert!(config.playbooks().unwrap().is_empty());
    }

    #[test]
    fn test_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("web.yml");
        std::fs::write(&file, "- hosts: web").unwrap();

        let config: Config = toml::from_str(&format!(
            r#"
            log_level = "debug"

            [store]
            dir = "/var/lib/shepherd"

            [deploy]
            retries = 0
            abandon_after_secs = 600

            [[playbook]]
            id = "base"
            data = "- hosts: all"

            [[playbook]]
            id = "web"
            name = "Web servers"
            file = "{}"

            [[group]]
            name = "web"
            playbook = "web"
            hosts = ["web1", "web2"]
            "#,
            file.display()
        ))
        .unwrap();

        let policy = config.deploy_policy();
        assert_eq!(policy.retries, 0);
        assert_eq!(policy.abandon_after, Duration::from_secs(600));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(5));

        let playbooks = config.playbooks().unwrap();
        assert_eq!(playbooks[0].data, "- hosts: all");
        assert_eq!(playbooks[1].name, "Web servers");
        assert_eq!(playbooks[1].data, "- hosts: web");

        assert_eq!(config.group[0].hosts, vec!["web1", "web2"]);
        assert_eq!(config.group[0].playbook.as_deref(), Some("web"));
    }

    #[test]
    fn test_playbook_without_content() {
        let config: Config = toml::from_str(
            r#"
            [[playbook]]
            id = "empty"
            "#,
        )
        .unwrap();

        assert!(config.playbooks().is_err());
    }
}
