//! Suite configuration
//!
//! Loaded from a TOML file (path in `FLEETPROBE_CONFIG`, else the user config
//! directory) and then overridden from the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use fleetprobe_common::{AllowRuleSpec, PollError, PollPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid poll settings: {0}")]
    Poll(#[from] PollError),
}

/// How topic and health queries reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Run `curl` on the scenario host (the API listens on its localhost)
    #[default]
    Curl,
    /// Query the backend directly from this machine
    Http,
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "curl" => Ok(Self::Curl),
            "http" => Ok(Self::Http),
            _ => Err(format!("Unknown transport: {}", s)),
        }
    }
}

/// SSH defaults applied when an inventory instance leaves them unset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Timeout and interval override for one family of checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub timeout_secs: u64,
    pub interval_secs: u64,
}

impl PollSettings {
    fn policy(&self) -> Result<PollPolicy, ConfigError> {
        Ok(PollPolicy::from_secs(self.timeout_secs, self.interval_secs)?)
    }
}

/// Optional poll budget overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Log marker and topic checks
    #[serde(default)]
    pub short: Option<PollSettings>,
    /// Cluster rollout checks
    #[serde(default)]
    pub cluster: Option<PollSettings>,
    /// Swarm service metric checks
    #[serde(default)]
    pub swarm_metrics: Option<PollSettings>,
}

impl PollConfig {
    pub fn short(&self) -> Result<PollPolicy, ConfigError> {
        self.short
            .map(|s| s.policy())
            .unwrap_or(Ok(PollPolicy::short()))
    }

    pub fn cluster(&self) -> Result<PollPolicy, ConfigError> {
        self.cluster
            .map(|s| s.policy())
            .unwrap_or(Ok(PollPolicy::cluster()))
    }

    pub fn swarm_metrics(&self) -> Result<PollPolicy, ConfigError> {
        self.swarm_metrics
            .map(|s| s.policy())
            .unwrap_or(Ok(PollPolicy::swarm_metrics()))
    }
}

/// Top-level suite configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Base URL of the topic API
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Receiver health endpoint
    #[serde(default = "default_health_url")]
    pub health_url: String,

    #[serde(default)]
    pub transport: Transport,

    /// Where observed payloads and logs are written
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Molecule instance config (YAML list of instances)
    #[serde(default)]
    pub instance_config: Option<PathBuf>,

    /// Variable files such as `common_vars.yml`
    #[serde(default)]
    pub vars_files: Vec<PathBuf>,

    /// Branch the agent under test was built from
    #[serde(default)]
    pub agent_current_branch: Option<String>,

    /// Branch of the receiver and topic API images
    #[serde(default)]
    pub stackstate_branch: Option<String>,

    #[serde(default)]
    pub ssh: SshConfig,

    /// Host group name to inventory instance names
    #[serde(default = "default_groups")]
    pub groups: BTreeMap<String, Vec<String>>,

    /// Extra benign log lines, appended after the built-in rules
    #[serde(default)]
    pub allow_list: Vec<AllowRuleSpec>,

    #[serde(default)]
    pub poll: PollConfig,
}

fn default_backend_url() -> String {
    "http://localhost:7070".to_string()
}

fn default_health_url() -> String {
    "http://localhost:7077/health".to_string()
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_groups() -> BTreeMap<String, Vec<String>> {
    let mut groups = BTreeMap::new();
    groups.insert(
        "agent_vm".to_string(),
        vec!["agent-ubuntu".to_string(), "agent-fedora".to_string()],
    );
    groups.insert("agent_win_vm".to_string(), vec!["agent-win".to_string()]);
    groups.insert("receiver_vm".to_string(), vec!["receiver".to_string()]);
    groups
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            health_url: default_health_url(),
            transport: Transport::default(),
            artifacts_dir: default_artifacts_dir(),
            log_level: default_log_level(),
            instance_config: None,
            vars_files: Vec::new(),
            agent_current_branch: None,
            stackstate_branch: None,
            ssh: SshConfig::default(),
            groups: default_groups(),
            allow_list: Vec::new(),
            poll: PollConfig::default(),
        }
    }
}

impl SuiteConfig {
    /// Load from the configured file, if any, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FLEETPROBE_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                ProjectDirs::from("io", "fleetprobe", "fleetprobe")
                    .map(|dirs| dirs.config_dir().join("fleetprobe.toml"))
                    .filter(|p| p.exists())
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load config from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&contents)
    }

    /// Load config from a TOML string
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Override fields from environment-style lookups
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FLEETPROBE_BACKEND_URL") {
            self.backend_url = url;
        }

        if let Some(url) = lookup("FLEETPROBE_HEALTH_URL") {
            self.health_url = url;
        }

        if let Some(transport) = lookup("FLEETPROBE_TRANSPORT") {
            self.transport = transport.parse().map_err(|_| ConfigError::InvalidValue {
                key: "FLEETPROBE_TRANSPORT".to_string(),
                value: transport.clone(),
            })?;
        }

        if let Some(dir) = lookup("FLEETPROBE_ARTIFACTS_DIR") {
            self.artifacts_dir = PathBuf::from(dir);
        }

        if let Some(level) = lookup("FLEETPROBE_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(path) = lookup("MOLECULE_INSTANCE_CONFIG") {
            self.instance_config = Some(PathBuf::from(path));
        }

        if let Some(files) = lookup("FLEETPROBE_VARS") {
            self.vars_files = files
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(branch) = lookup("AGENT_CURRENT_BRANCH") {
            self.agent_current_branch = Some(branch);
        }

        if let Some(branch) = lookup("STACKSTATE_BRANCH") {
            self.stackstate_branch = Some(branch);
        }

        Ok(())
    }

    /// Instance names of a host group; an unknown group names a single instance
    pub fn group_members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .cloned()
            .unwrap_or_else(|| vec![group.to_string()])
    }

    /// Generate example TOML config
    pub fn example_toml() -> &'static str {
        r##"# fleetprobe configuration
# ========================

# Topic API and receiver health endpoints
backend_url = "http://localhost:7070"
health_url = "http://localhost:7077/health"

# "curl": query through curl on the scenario host
# "http": query directly from this machine
transport = "curl"

artifacts_dir = "artifacts"
log_level = "info"

# Molecule inventory
instance_config = "/tmp/molecule/instance_config.yml"
vars_files = ["common_vars.yml"]

agent_current_branch = "master"
stackstate_branch = "master"

[ssh]
user = "ubuntu"
# identity_file = "~/.ssh/id_rsa"
# port = 22

[groups]
agent_vm = ["agent-ubuntu", "agent-fedora"]
agent_win_vm = ["agent-win"]
receiver_vm = ["receiver"]

# Known benign log lines
# [[allow_list]]
# pattern = "conntrack"
# reason = "no conntrack module on CI kernels"

# Poll budget overrides
# [poll.short]
# timeout_secs = 60
# interval_secs = 5
"##
    }
}
