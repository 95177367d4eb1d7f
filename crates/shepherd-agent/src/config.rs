//! Agent configuration loading and types

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use shepherd_bus::MqttConfig;

/// Top-level configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity answered on pings and used in topics; defaults to the OS hostname
    #[serde(default)]
    pub host: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Broker connection
    #[serde(default)]
    pub bus: MqttConfig,
    /// How playbooks are run
    #[serde(default)]
    pub job: JobConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            bus: MqttConfig::default(),
            job: JobConfig::default(),
        }
    }
}

/// Playbook runner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Program invoked with the playbook path as its first argument
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments after the playbook path
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Where the received playbook is written before each run
    #[serde(default = "default_playbook_path")]
    pub playbook_path: PathBuf,
    /// Seconds between SIGTERM and SIGKILL when cancelling
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            playbook_path: default_playbook_path(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_program() -> String {
    "ansible-playbook".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-i".to_string(), "127.0.0.1,".to_string()]
}

fn default_playbook_path() -> PathBuf {
    PathBuf::from("/etc/shepherd/current.yml")
}

fn default_cancel_grace_secs() -> u64 {
    10
}

impl AgentConfig {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be parsed
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("SHEPHERD_AGENT_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let paths = [
            PathBuf::from("shepherd-agent.toml"),
            PathBuf::from("/etc/shepherd/agent.toml"),
            dirs::config_dir()
                .map(|p| p.join("shepherd/agent.toml"))
                .unwrap_or_default(),
        ];

        for path in paths {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Self::default())
    }

    /// Configured host name, else the OS hostname
    #[must_use]
    pub fn host_name(&self) -> String {
        self.host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();

        assert_eq!(config.job.program, "ansible-playbook");
        assert_eq!(config.job.args, vec!["-i", "127.0.0.1,"]);
        assert_eq!(
            config.job.playbook_path,
            PathBuf::from("/etc/shepherd/current.yml")
        );
        assert_eq!(config.bus.port, 1883);
        assert!(!config.host_name().is_empty());
    }

    #[test]
    fn test_overrides() {
        let config: AgentConfig = toml::from_str(
            r#"
            host = "web1"
            log_format = "json"

            [bus]
            host = "broker.lan"

            [job]
            program = "sh"
            args = []
            cancel_grace_secs = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.host_name(), "web1");
        assert_eq!(config.bus.host, "broker.lan");
        assert_eq!(config.job.program, "sh");
        assert!(config.job.args.is_empty());
        assert_eq!(config.job.cancel_grace_secs, 2);
    }
}
