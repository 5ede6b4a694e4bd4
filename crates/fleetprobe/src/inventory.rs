//! Provisioned instances and suite variables
//!
//! Instances come from the Molecule instance config (a YAML list); variables
//! come from one or more YAML mapping files such as `common_vars.yml`. Any
//! variable can be overridden with `FLEETPROBE_VAR_<NAME>` in the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::SshConfig;
use crate::host::{Platform, SshHost};

/// Prefix for variable overrides in the environment
pub const VAR_ENV_PREFIX: &str = "FLEETPROBE_VAR_";

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("Instance '{instance}' has no {field}")]
    MissingField { instance: String, field: &'static str },

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Variable '{name}' is not usable as {expected}: {reason}")]
    InvalidVariable {
        name: String,
        expected: &'static str,
        reason: String,
    },
}

/// One provisioned machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance: String,
    pub address: String,
    #[serde(default)]
    pub private_address: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

/// Instances plus variables
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    instances: Vec<Instance>,
    vars: BTreeMap<String, serde_yaml::Value>,
    overrides: BTreeMap<String, String>,
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, InventoryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| InventoryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Inventory {
    pub fn new(instances: Vec<Instance>, vars: BTreeMap<String, serde_yaml::Value>) -> Self {
        Self {
            instances,
            vars,
            overrides: BTreeMap::new(),
        }
    }

    /// Load the instance config and variable files, then collect env overrides
    ///
    /// Later variable files win over earlier ones.
    pub fn load(
        instance_config: Option<&Path>,
        vars_files: &[PathBuf],
    ) -> Result<Self, InventoryError> {
        let instances: Vec<Instance> = match instance_config {
            Some(path) => read_yaml::<Option<Vec<Instance>>>(path)?.unwrap_or_default(),
            None => Vec::new(),
        };

        let mut vars = BTreeMap::new();
        for path in vars_files {
            let file_vars: Option<BTreeMap<String, serde_yaml::Value>> = read_yaml(path)?;
            debug!(path = %path.display(), "Loaded variable file");
            vars.extend(file_vars.unwrap_or_default());
        }

        let mut inventory = Self::new(instances, vars);
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(VAR_ENV_PREFIX) {
                inventory = inventory.with_override(&name.to_lowercase(), value);
            }
        }

        info!(
            instances = inventory.instances.len(),
            vars = inventory.vars.len(),
            overrides = inventory.overrides.len(),
            "Inventory loaded"
        );
        Ok(inventory)
    }

    /// Override one variable; names are case-insensitive
    pub fn with_override(mut self, name: &str, value: impl Into<String>) -> Self {
        self.overrides.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Result<&Instance, InventoryError> {
        self.instances
            .iter()
            .find(|i| i.instance == name)
            .ok_or_else(|| InventoryError::UnknownInstance(name.to_string()))
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.instances.iter().any(|i| i.instance == name)
    }

    pub fn address(&self, name: &str) -> Result<&str, InventoryError> {
        Ok(&self.instance(name)?.address)
    }

    pub fn private_address(&self, name: &str) -> Result<&str, InventoryError> {
        self.instance(name)?
            .private_address
            .as_deref()
            .ok_or_else(|| InventoryError::MissingField {
                instance: name.to_string(),
                field: "private_address",
            })
    }

    /// Scalar variable rendered as a string
    pub fn var(&self, name: &str) -> Result<String, InventoryError> {
        if let Some(value) = self.overrides.get(&name.to_lowercase()) {
            return Ok(value.clone());
        }

        match self.vars.get(name) {
            Some(serde_yaml::Value::String(s)) => Ok(s.clone()),
            Some(serde_yaml::Value::Number(n)) => Ok(n.to_string()),
            Some(serde_yaml::Value::Bool(b)) => Ok(b.to_string()),
            Some(_) => Err(InventoryError::InvalidVariable {
                name: name.to_string(),
                expected: "a scalar",
                reason: "value is a sequence, mapping, or null".to_string(),
            }),
            None => Err(InventoryError::UnknownVariable(name.to_string())),
        }
    }

    /// Variable parsed into `T`
    pub fn var_as<T>(&self, name: &str) -> Result<T, InventoryError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.var(name)?;
        raw.trim()
            .parse()
            .map_err(|e: T::Err| InventoryError::InvalidVariable {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
                reason: e.to_string(),
            })
    }

    /// SSH handle for an instance; instance fields win over `defaults`
    pub fn ssh_host(
        &self,
        name: &str,
        platform: Platform,
        defaults: &SshConfig,
    ) -> Result<SshHost, InventoryError> {
        let instance = self.instance(name)?;

        Ok(SshHost::new(&instance.instance, &instance.address, platform)
            .with_user(instance.user.clone().or_else(|| defaults.user.clone()))
            .with_port(instance.port.or(defaults.port))
            .with_identity_file(
                instance
                    .identity_file
                    .clone()
                    .or_else(|| defaults.identity_file.clone()),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCES: &str = r#"
- instance: agent-ubuntu
  address: 34.1.1.1
  private_address: 10.0.0.1
  user: ubuntu
  port: 22
  identity_file: /tmp/ssh_key
- instance: agent-fedora
  address: 34.1.1.2
  private_address: 10.0.0.2
- instance: receiver
  address: 34.1.1.9
"#;

    const VARS: &str = r#"
test_connection_port_after_start: 4321
test_connection_port_before_start: "4322"
major_version: 2
agent_repo_url: https://example.invalid/repo
nested:
  key: value
"#;

    fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn fixture() -> (tempfile::TempDir, Inventory) {
        let dir = tempfile::tempdir().unwrap();
        let instances = write_fixture(dir.path(), "instance_config.yml", INSTANCES);
        let vars = write_fixture(dir.path(), "common_vars.yml", VARS);
        let inventory = Inventory::load(Some(&instances), &[vars]).unwrap();
        (dir, inventory)
    }

    #[test]
    fn test_instances() {
        let (_dir, inventory) = fixture();

        assert_eq!(inventory.instances().len(), 3);
        assert_eq!(inventory.address("agent-fedora").unwrap(), "34.1.1.2");
        assert_eq!(inventory.private_address("agent-ubuntu").unwrap(), "10.0.0.1");
        assert!(inventory.has_instance("receiver"));
        assert!(!inventory.has_instance("agent-win"));
    }

    #[test]
    fn test_missing_private_address() {
        let (_dir, inventory) = fixture();
        assert!(matches!(
            inventory.private_address("receiver"),
            Err(InventoryError::MissingField { field: "private_address", .. })
        ));
        assert!(matches!(
            inventory.instance("agent-win"),
            Err(InventoryError::UnknownInstance(_))
        ));
    }

    #[test]
    fn test_vars() {
        let (_dir, inventory) = fixture();

        assert_eq!(inventory.var_as::<u16>("test_connection_port_after_start").unwrap(), 4321);
        assert_eq!(inventory.var_as::<u16>("test_connection_port_before_start").unwrap(), 4322);
        assert_eq!(inventory.var("major_version").unwrap(), "2");
        assert!(matches!(inventory.var("nested"), Err(InventoryError::InvalidVariable { .. })));
        assert!(matches!(inventory.var("nope"), Err(InventoryError::UnknownVariable(_))));
        assert!(matches!(
            inventory.var_as::<u16>("agent_repo_url"),
            Err(InventoryError::InvalidVariable { .. })
        ));
    }

    #[test]
    fn test_override_wins() {
        let (_dir, inventory) = fixture();
        let inventory = inventory.with_override("MAJOR_VERSION", "3");
        assert_eq!(inventory.var("major_version").unwrap(), "3");
    }

    #[test]
    fn test_later_vars_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_fixture(dir.path(), "a.yml", "major_version: 2\n");
        let second = write_fixture(dir.path(), "b.yml", "major_version: 3\n");

        let inventory = Inventory::load(None, &[first, second]).unwrap();
        assert_eq!(inventory.var("major_version").unwrap(), "3");
        assert!(inventory.instances().is_empty());
    }

    #[test]
    fn test_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let instances = write_fixture(dir.path(), "instances.yml", "");
        let vars = write_fixture(dir.path(), "vars.yml", "");

        let inventory = Inventory::load(Some(&instances), &[vars]).unwrap();
        assert!(inventory.instances().is_empty());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write_fixture(dir.path(), "bad.yml", "- instance: [unclosed\n");

        assert!(matches!(
            Inventory::load(Some(&bad), &[]),
            Err(InventoryError::Parse { .. })
        ));
        assert!(matches!(
            Inventory::load(Some(&dir.path().join("missing.yml")), &[]),
            Err(InventoryError::Io { .. })
        ));
    }

    #[test]
    fn test_ssh_host_merges_defaults() {
        let (_dir, inventory) = fixture();
        let defaults = SshConfig {
            user: Some("centos".to_string()),
            identity_file: Some(PathBuf::from("/default/key")),
            port: Some(2200),
        };

        let fedora = inventory
            .ssh_host("agent-fedora", Platform::Linux, &defaults)
            .unwrap();
        let args = fedora.ssh_args("true");
        assert!(args.contains(&"centos@34.1.1.2".to_string()));
        assert!(args.contains(&"/default/key".to_string()));

        let ubuntu = inventory
            .ssh_host("agent-ubuntu", Platform::Linux, &defaults)
            .unwrap();
        let args = ubuntu.ssh_args("true");
        assert!(args.contains(&"ubuntu@34.1.1.1".to_string()));
        assert!(args.contains(&"/tmp/ssh_key".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "22"]));
    }
}
