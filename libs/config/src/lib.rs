use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

/// Longest blocking query wait Consul will honour.
pub const MAX_CONSUL_WAIT: Duration = Duration::from_secs(600);
/// Upper bound for `watch.health_quiet_period`.
pub const MAX_HEALTH_QUIET_PERIOD: Duration = Duration::from_secs(3600);

/// coordination config for one connector group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationConfig {
    pub consul: ConsulConfig,
    pub service_name: String,
    /// id of this instance, defaults to the service name
    pub service_id: Option<String>,
    pub key_prefix: String,
    pub watch: WatchConfig,
    path: Option<PathBuf>,
}

/// how to reach the Consul agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulConfig {
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub wait: Duration,
}

/// watch engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub health_quiet_period: Duration,
    pub subscriber_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        wire::Watch::default().into()
    }
}

impl From<wire::Watch> for WatchConfig {
    fn from(w: wire::Watch) -> Self {
        Self {
            retry_base_delay: w.retry_base_delay,
            retry_max_delay: w.retry_max_delay,
            health_quiet_period: w.health_quiet_period,
            subscriber_buffer: w.subscriber_buffer,
        }
    }
}

impl TryFrom<wire::Config> for CoordinationConfig {
    type Error = anyhow::Error;
    fn try_from(cfg: wire::Config) -> Result<Self> {
        let wire::Config {
            consul,
            service,
            watch,
        } = cfg;

        let config = Self {
            consul: ConsulConfig {
                address: consul.address,
                token: consul.token.filter(|t| !t.is_empty()),
                datacenter: consul.datacenter.filter(|dc| !dc.is_empty()),
                wait: consul.wait,
            },
            service_name: service.name,
            service_id: service.id.filter(|id| !id.is_empty()),
            key_prefix: service.key_prefix.trim_matches('/').to_owned(),
            watch: watch.into(),
            path: None,
        };
        config.validate()?;
        Ok(config)
    }
}

impl CoordinationConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn new<S: AsRef<str>>(input: S) -> Result<Self> {
        let input = input.as_ref();
        let wire: wire::Config = match serde_json::from_str(input) {
            Ok(cfg) => cfg,
            Err(_err) => serde_yaml::from_str(input).context("config is neither JSON nor YAML")?,
        };
        let config = Self::try_from(wire)?;
        debug!(?config);
        Ok(config)
    }

    /// read and decode the config at `path`
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// the file this config was read from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// instance id, falling back to the service name
    pub fn effective_service_id(&self) -> &str {
        self.service_id.as_deref().unwrap_or(&self.service_name)
    }

    /// check invariants that serde can't express
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            bail!("service.name must not be empty");
        }
        if self.service_name.contains('/') {
            bail!("service.name must not contain '/': {}", self.service_name);
        }
        if self.key_prefix.is_empty() {
            bail!("service.key_prefix must not be empty");
        }
        if self.consul.address.trim().is_empty() {
            bail!("consul.address must not be empty");
        }
        if self.consul.wait.is_zero() || self.consul.wait > MAX_CONSUL_WAIT {
            bail!(
                "consul.wait must be between 1ms and {:?}, got {:?}",
                MAX_CONSUL_WAIT,
                self.consul.wait
            );
        }
        if self.watch.retry_base_delay.is_zero() {
            bail!("watch.retry_base_delay must be non-zero");
        }
        if self.watch.retry_base_delay > self.watch.retry_max_delay {
            bail!(
                "watch.retry_base_delay ({:?}) exceeds watch.retry_max_delay ({:?})",
                self.watch.retry_base_delay,
                self.watch.retry_max_delay
            );
        }
        if self.watch.health_quiet_period > MAX_HEALTH_QUIET_PERIOD {
            bail!(
                "watch.health_quiet_period must be at most {:?}, got {:?}",
                MAX_HEALTH_QUIET_PERIOD,
                self.watch.health_quiet_period
            );
        }
        if self.watch.subscriber_buffer == 0 {
            bail!("watch.subscriber_buffer must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_and_json() {
        let yaml = CoordinationConfig::new("service:\n  name: cbes\n  id: node-1\n").unwrap();
        assert_eq!(yaml.service_name, "cbes");
        assert_eq!(yaml.effective_service_id(), "node-1");

        let json = CoordinationConfig::new(r#"{"service":{"name":"cbes"}}"#).unwrap();
        assert_eq!(json.effective_service_id(), "cbes");
        assert_eq!(json.key_prefix, wire::DEFAULT_KEY_PREFIX);
        assert_eq!(json.watch, WatchConfig::default());
        assert!(json.path().is_none());
    }

    #[test]
    fn test_empty_strings_are_unset() {
        let cfg = CoordinationConfig::new(
            r#"{"consul":{"token":"","datacenter":""},"service":{"name":"cbes","id":"","key_prefix":"/a/b/"}}"#,
        )
        .unwrap();
        assert!(cfg.consul.token.is_none());
        assert!(cfg.consul.datacenter.is_none());
        assert!(cfg.service_id.is_none());
        assert_eq!(cfg.key_prefix, "a/b");
    }

    #[test]
    fn test_invalid_configs() {
        assert!(CoordinationConfig::new(r#"{"service":{"name":""}}"#).is_err());
        assert!(CoordinationConfig::new(r#"{"service":{"name":"a/b"}}"#).is_err());
        assert!(
            CoordinationConfig::new(r#"{"consul":{"wait":"11m"},"service":{"name":"a"}}"#)
                .is_err()
        );
        assert!(
            CoordinationConfig::new(
                r#"{"service":{"name":"a"},"watch":{"retry_base_delay":"1m","retry_max_delay":"1s"}}"#
            )
            .is_err()
        );
        assert!(
            CoordinationConfig::new(r#"{"service":{"name":"a"},"watch":{"subscriber_buffer":0}}"#)
                .is_err()
        );
        assert!(
            CoordinationConfig::new(
                r#"{"service":{"name":"a"},"watch":{"health_quiet_period":"2h"}}"#
            )
            .is_err()
        );
        assert!(
            CoordinationConfig::new(
                r#"{"service":{"name":"a"},"watch":{"health_quiet_period":18446744073709551615}}"#
            )
            .is_err()
        );
        assert!(CoordinationConfig::new("not: [valid").is_err());
    }
}
