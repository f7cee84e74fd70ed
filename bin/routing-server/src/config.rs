use anyhow::{Context, Result};
use routing_db::{BackendType, DbConfig};
use routing_migration::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "ROUTING_API_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "routing-api.yml";

const BACKEND_ENV: &str = "ROUTING_API_BACKEND";
const ETCD_URL_ENV: &str = "ROUTING_API_ETCD_URL";
const DATABASE_URL_ENV: &str = "ROUTING_API_DATABASE_URL";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub lease_secs: u64,
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            lease_secs: runner.lease.as_secs(),
            grace_period_secs: runner.grace_period.as_secs(),
            poll_interval_ms: runner.poll_interval.as_millis() as u64,
        }
    }
}

/// Service configuration, read from YAML and then overridden from the environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub db: DbConfig,
    pub migration: MigrationConfig,
    pub sweep_interval_secs: u64,
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::default(),
            migration: MigrationConfig::default(),
            sweep_interval_secs: 30,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_path(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn from_path(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read config file {}", path.display())),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(backend) = lookup(BACKEND_ENV) {
            self.db.backend = backend
                .parse::<BackendType>()
                .with_context(|| format!("invalid {}", BACKEND_ENV))?;
        }
        if let Some(url) = lookup(ETCD_URL_ENV) {
            self.db.etcd.url = url;
        }
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.db.sql.url = url;
        }
        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            lease: Duration::from_secs(self.migration.lease_secs),
            grace_period: Duration::from_secs(self.migration.grace_period_secs),
            poll_interval: Duration::from_millis(self.migration.poll_interval_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_and_missing_are_defaults() {
        assert_eq!(ServiceConfig::from_yaml("").unwrap(), ServiceConfig::default());
        assert_eq!(
            ServiceConfig::from_path(Path::new("/nonexistent/routing-api.yml")).unwrap(),
            ServiceConfig::default()
        );
    }

    #[test]
    fn test_parse_yaml() {
        let config = ServiceConfig::from_yaml(
            r#"
backend: sql
sql:
  url: postgres://routing@db/routing
  max_connections: 4
migration:
  grace_period_secs: 10
sweep_interval_secs: 5
logging:
  format: json
"#,
        )
        .unwrap();

        assert_eq!(config.db.backend, BackendType::Sql);
        assert_eq!(config.db.sql.url, "postgres://routing@db/routing");
        assert_eq!(config.db.sql.max_connections, 4);
        assert_eq!(config.db.sql.acquire_timeout_ms, 5000);
        assert_eq!(config.migration.grace_period_secs, 10);
        assert_eq!(config.migration.lease_secs, 30);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROUTING_API_BACKEND", "etcd"),
            ("ROUTING_API_ETCD_URL", "http://etcd:2379"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.db.backend, BackendType::Etcd);
        assert_eq!(config.db.etcd.url, "http://etcd:2379");
        assert_eq!(config.db.sql.url, "sqlite::memory:");
    }

    #[test]
    fn test_bad_backend_override() {
        let mut config = ServiceConfig::default();
        assert!(config
            .apply_env(|key| (key == "ROUTING_API_BACKEND").then(|| "mongo".to_string()))
            .is_err());
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let config = ServiceConfig {
            sweep_interval_secs: 0,
            ..ServiceConfig::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }
}
