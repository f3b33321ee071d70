//! Load balancer configuration
//!
//! Clusters and their backends come from a YAML file; the listen port and
//! probe cadence can also be set from the environment (`LB_` prefix). A
//! malformed pool is fatal at startup, never at request time.

use crate::duration;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct LbConfig {
    /// Listen port for the proxy and probe endpoints
    #[serde(default = "default_port")]
    pub port: u16,

    /// Backend health probe cadence
    #[serde(default = "default_probe_interval", deserialize_with = "duration::deserialize")]
    pub probe_interval: Duration,

    /// How many alternate backends to try after a transport failure
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub retention_period: Duration,
}

fn default_port() -> u16 {
    9030
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_count() -> u32 {
    1
}

impl LbConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config: LbConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("LB"))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?
            .try_deserialize()
            .context("malformed configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("no clusters configured");
        }

        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if cluster.id.is_empty() {
                bail!("cluster with empty id");
            }
            if !seen.insert(cluster.id.as_str()) {
                bail!("duplicate cluster id: {}", cluster.id);
            }
            if cluster.backends.is_empty() {
                bail!("cluster {} has no backends", cluster.id);
            }
            for backend in &cluster.backends {
                Url::parse(&backend.url).with_context(|| {
                    format!("invalid backend url in cluster {}: {}", cluster.id, backend.url)
                })?;
                if backend.retention_period.is_zero() {
                    bail!(
                        "backend {} in cluster {} declares a zero retention period",
                        backend.url,
                        cluster.id
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(id: &str, backends: Vec<BackendConfig>) -> ClusterConfig {
        ClusterConfig {
            id: id.to_string(),
            backends,
        }
    }

    fn backend(url: &str, retention: Duration) -> BackendConfig {
        BackendConfig {
            url: url.to_string(),
            retention_period: retention,
        }
    }

    fn valid_config() -> LbConfig {
        LbConfig {
            port: default_port(),
            probe_interval: default_probe_interval(),
            retry_count: default_retry_count(),
            clusters: vec![cluster(
                "hpc",
                vec![
                    backend("http://tsdb-hot:9090", Duration::from_secs(6 * 3600)),
                    backend("http://tsdb-cold:9090", Duration::from_secs(30 * 24 * 3600)),
                ],
            )],
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_empty_pool_is_fatal() {
        let mut config = valid_config();
        config.clusters.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.clusters[0].backends.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_cluster_id_is_fatal() {
        let mut config = valid_config();
        let duplicate = config.clusters[0].clone();
        config.clusters.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_is_fatal() {
        let mut config = valid_config();
        config.clusters[0].backends[0].retention_period = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_url_is_fatal() {
        let mut config = valid_config();
        config.clusters[0].backends[0].url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_deserialization() {
        let yaml = r#"
port: 9030
probe_interval: 15s
retry_count: 2
clusters:
  - id: hpc
    backends:
      - url: http://tsdb-hot:9090
        retention_period: 6h
      - url: http://tsdb-cold:9090
        retention_period: 30d
"#;
        let config: LbConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.port, 9030);
        assert_eq!(config.probe_interval, Duration::from_secs(15));
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(
            config.clusters[0].backends[1].retention_period,
            Duration::from_secs(30 * 24 * 3600)
        );
        assert!(config.validate().is_ok());
    }
}
