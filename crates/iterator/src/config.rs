use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::Command;
use crate::{Error, Result};

/// Default path of the rendered executor configuration. The declarative
/// front-end writes its YAML rendition here; `-f` or `ITERATOR_CONFIG`
/// override it.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/iterator/config.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP surface binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Address clients use to reach this server (the release subcommand).
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Driver binary invoked for apply/destroy, terraform or terragrunt.
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub tls_crt: String,
    #[serde(default)]
    pub tls_key: String,
    /// When present, bindings are persisted to the remote KV instead of the
    /// local filesystem.
    #[serde(default)]
    pub consul: Option<ConsulConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            address: default_address(),
            data_dir: default_data_dir(),
            driver: default_driver(),
            tls_crt: String::new(),
            tls_key: String::new(),
            consul: None,
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:9595".to_string()
}

fn default_address() -> String {
    "127.0.0.1:9595".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/iterator")
}

fn default_driver() -> String {
    "terraform".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub commands: Vec<Command>,
}

impl Config {
    /// Read and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("error reading config file {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration path: explicit flag, then the
    /// `ITERATOR_CONFIG` environment variable, then the default.
    pub fn resolve_path(flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| std::env::var("ITERATOR_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Returns true if the config contains the given command.
    pub fn has_command(&self, other: &Command) -> bool {
        self.commands.iter().any(|cmd| cmd.equal(other))
    }

    fn validate(&self) -> Result<()> {
        if self.commands.is_empty() {
            return Err(Error::Config(
                "missing command to execute on receipt of alarm".to_string(),
            ));
        }

        for (i, cmd) in self.commands.iter().enumerate() {
            cmd.parse_signal().map_err(|e| {
                Error::Config(format!(
                    "invalid resolved_signal specified for command {:?} at index {}: {}",
                    cmd.to_string(),
                    i,
                    e
                ))
            })?;

            if cmd.should_ignore_resolved() && !cmd.resolved_signal.is_empty() {
                warn!(
                    "Command {:?} at index {} specifies a resolved_signal, and also specifies \
                     to ignore resolved alerts. The signal won't be used.",
                    cmd.to_string(),
                    i
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_a_minimal_config() {
        let f = write_config(
            r#"
server:
  listen_address: "127.0.0.1:9595"
  data_dir: "/tmp/iterator"
commands:
  - cmd: terraform
    args: ["-chdir=/modules/web", "apply", "-auto-approve"]
    match_labels:
      alertname: HighLoad
    max: 1
    resolved_signal: SIGTERM
    scheduling: sawtooth
"#,
        );
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:9595");
        assert_eq!(config.server.driver, "terraform");
        assert_eq!(config.commands.len(), 1);
        let cmd = &config.commands[0];
        assert_eq!(cmd.max, 1);
        assert!(cmd.should_notify());
        assert!(!cmd.should_ignore_resolved());
        assert!(cmd.should_destroy());
        assert_eq!(cmd.scheduling, crate::command::SchedulingMode::Sawtooth);
    }

    #[test]
    fn rejects_empty_command_list() {
        let f = write_config("commands: []\n");
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn rejects_unknown_resolved_signal() {
        let f = write_config(
            r#"
commands:
  - cmd: echo
    resolved_signal: SIGNOPE
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn consul_block_enables_remote_store() {
        let f = write_config(
            r#"
server:
  consul:
    address: "127.0.0.1:8500"
commands:
  - cmd: echo
"#,
        );
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.server.consul.unwrap().address, "127.0.0.1:8500");
    }
}
