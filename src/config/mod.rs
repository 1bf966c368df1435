//! Daemon configuration schema.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DocumentPath, EntityName, MergePolicy, SourceName};

mod load;

pub use load::{config_path, load};

pub const DEFAULT_ADDRESS: &str = "tcp://127.0.0.1:60179";
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECONCILE_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_RETRY_CAP: u32 = 5;
pub const MIN_WORKERS: usize = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no config path: pass --config or set RETCON_CONFIG")]
    MissingPath,
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workers: Option<usize>,
    pub policy: String,
    pub reject_paths: Vec<Vec<String>>,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub source: SourceTuning,
    #[serde(rename = "entity")]
    pub entities: Vec<EntityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: None,
            policy: "ignoreConflicts".to_string(),
            reject_paths: Vec::new(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            source: SourceTuning::default(),
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub dsn: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: PathBuf::from("retcon.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceTuning {
    pub timeout_ms: u64,
    pub reconcile_timeout_ms: u64,
    pub retry_cap: u32,
}

impl Default for SourceTuning {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            reconcile_timeout_ms: DEFAULT_RECONCILE_TIMEOUT_MS,
            retry_cap: DEFAULT_RETRY_CAP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl Config {
    /// Check the shape constraints that are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::Invalid("at least one [[entity]] required".into()));
        }
        for entity in &self.entities {
            EntityName::new(&entity.name)
                .map_err(|e| ConfigError::Invalid(format!("entity name: {e}")))?;
            if entity.sources.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "entity {:?} has no sources",
                    entity.name
                )));
            }
            for source in &entity.sources {
                SourceName::new(&source.name)
                    .map_err(|e| ConfigError::Invalid(format!("source name: {e}")))?;
            }
        }
        self.merge_policy()?;
        parse_address(&self.server.address)?;
        Ok(())
    }

    /// Parse `policy` / `reject_paths` into a [`MergePolicy`].
    ///
    /// Accepted spellings: `ignoreConflicts`, `trustSource:<name>`,
    /// `rejectPaths` (paths taken from `reject_paths`).
    pub fn merge_policy(&self) -> Result<MergePolicy, ConfigError> {
        match self.policy.as_str() {
            "ignoreConflicts" => Ok(MergePolicy::IgnoreConflicts),
            "rejectPaths" => {
                let paths = self
                    .reject_paths
                    .iter()
                    .map(|segments| DocumentPath::new(segments.iter().cloned()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ConfigError::Invalid(format!("reject_paths: {e}")))?;
                Ok(MergePolicy::RejectPaths(paths))
            }
            other => match other.strip_prefix("trustSource:") {
                Some(name) => {
                    let source = SourceName::new(name)
                        .map_err(|e| ConfigError::Invalid(format!("policy source: {e}")))?;
                    Ok(MergePolicy::TrustSource(source))
                }
                None => Err(ConfigError::Invalid(format!("unknown policy {other:?}"))),
            },
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(MIN_WORKERS)
                .max(MIN_WORKERS)
        })
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source.timeout_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.source.reconcile_timeout_ms)
    }

    /// Source names configured for `entity`, in file order.
    pub fn entity_sources(&self, entity: &EntityName) -> Vec<SourceName> {
        self.entities
            .iter()
            .filter(|e| e.name == entity.as_str())
            .flat_map(|e| &e.sources)
            .filter_map(|s| SourceName::new(&s.name).ok())
            .collect()
    }
}

/// Parse a `tcp://HOST:PORT` address into the bindable `HOST:PORT` form.
pub fn parse_address(address: &str) -> Result<String, ConfigError> {
    let rest = address
        .strip_prefix("tcp://")
        .ok_or_else(|| ConfigError::Invalid(format!("address {address:?} must be tcp://HOST:PORT")))?;
    if rest.rsplit_once(':').is_none() {
        return Err(ConfigError::Invalid(format!(
            "address {address:?} is missing a port"
        )));
    }
    Ok(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
workers = 3
policy = "trustSource:db1"

[server]
address = "tcp://127.0.0.1:60179"

[store]
dsn = "/tmp/retcon-test.sqlite"

[source]
timeout_ms = 500

[[entity]]
name = "customer"

  [[entity.source]]
  name = "db1"
  driver = "memory"

  [[entity.source]]
  name = "db2"
  driver = "memory"
  [entity.source.settings]
  table = "customers"
"#;

    #[test]
    fn sample_parses_and_validates() {
        let config: Config = toml::from_str(SAMPLE).expect("parse");
        config.validate().expect("validate");
        assert_eq!(config.workers, Some(3));
        assert_eq!(config.source.timeout_ms, 500);
        assert_eq!(config.source.retry_cap, DEFAULT_RETRY_CAP);
        assert_eq!(
            config.merge_policy().expect("policy"),
            MergePolicy::TrustSource(SourceName::new("db1").unwrap())
        );
        let entity = EntityName::new("customer").unwrap();
        assert_eq!(config.entity_sources(&entity).len(), 2);
        assert_eq!(
            config.entities[0].sources[1].settings.get("table"),
            Some(&"customers".to_string())
        );
    }

    #[test]
    fn rejects_entity_without_sources() {
        let config: Config = toml::from_str("[[entity]]\nname = \"customer\"\n").expect("parse");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_policy() {
        let config = Config {
            policy: "latest-wins".to_string(),
            ..Config::default()
        };
        assert!(config.merge_policy().is_err());
    }

    #[test]
    fn reject_paths_policy_uses_configured_prefixes() {
        let config = Config {
            policy: "rejectPaths".to_string(),
            reject_paths: vec![vec!["secret".to_string()]],
            ..Config::default()
        };
        match config.merge_policy().expect("policy") {
            MergePolicy::RejectPaths(paths) => assert_eq!(paths.len(), 1),
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn address_must_be_tcp() {
        assert!(parse_address("tcp://0.0.0.0:60179").is_ok());
        assert!(parse_address("udp://0.0.0.0:60179").is_err());
        assert!(parse_address("tcp://nohost").is_err());
    }
}
