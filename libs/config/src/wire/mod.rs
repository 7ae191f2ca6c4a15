//! # Config docs
//!
//! ## Consul
//!
//! `consul.address` is the base URL of the agent (scheme optional, defaults to
//! `http`). `consul.token` is sent as the ACL token on every request and
//! `consul.datacenter` pins queries to a datacenter other than the agent's.
//! `consul.wait` bounds every blocking query; Consul caps this at 10 minutes.
//!
//! ## Service
//!
//! `service.name` is the logical connector group. All coordination documents
//! live under `<key_prefix>/<name>/`. `service.id` identifies this instance
//! and defaults to the service name.
//!
//! ## Watch
//!
//! Transport failures inside a watch are retried forever, starting at
//! `retry_base_delay` and doubling up to `retry_max_delay`.
//! `health_quiet_period` is how long health membership must stay unchanged
//! before it is reported. `subscriber_buffer` bounds how many undelivered
//! changes a slow subscriber may fall behind before older ones are dropped.
//!
//! Durations accept a bare number of seconds or a string with a unit:
//! `"250ms"`, `"5s"`, `"1m"`, `"1h"`.
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, de};

pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";
pub const DEFAULT_KEY_PREFIX: &str = "couchbase/cbes";

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub consul: Consul,
    pub service: Service,
    #[serde(default)]
    pub watch: Watch,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Consul {
    #[serde(default = "default_address")]
    pub address: String,
    pub token: Option<String>,
    pub datacenter: Option<String>,
    #[serde(
        default = "default_wait",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Service {
    pub name: String,
    pub id: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Watch {
    #[serde(
        default = "default_retry_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_base_delay: Duration,
    #[serde(
        default = "default_retry_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub retry_max_delay: Duration,
    #[serde(
        default = "default_health_quiet_period",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub health_quiet_period: Duration,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

pub fn default_address() -> String {
    DEFAULT_CONSUL_ADDRESS.to_owned()
}

pub fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_owned()
}

pub const fn default_wait() -> Duration {
    Duration::from_secs(300)
}

pub const fn default_retry_base_delay() -> Duration {
    Duration::from_secs(1)
}

pub const fn default_retry_max_delay() -> Duration {
    Duration::from_secs(30)
}

pub const fn default_health_quiet_period() -> Duration {
    Duration::from_secs(5)
}

pub const fn default_subscriber_buffer() -> usize {
    16
}

impl Default for Consul {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: None,
            datacenter: None,
            wait: default_wait(),
        }
    }
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            health_quiet_period: default_health_quiet_period(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "30", "30s", "250ms", "5m", "1h"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match WireDuration::deserialize(de)? {
        WireDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        WireDuration::String(s) => parse_duration(&s).map_err(de::Error::custom),
    }
}

fn serialize_duration<S>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    ser.serialize_str(&format!("{}ms", dur.as_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = r#"
consul:
  address: "http://consul.service:8500"
  token: "secret"
  wait: "5m"
service:
  name: "cbes-group"
watch:
  retry_base_delay: "250ms"
  health_quiet_period: 2
"#;

    #[test]
    fn test_example() {
        let cfg: Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.consul.address, "http://consul.service:8500");
        assert_eq!(cfg.consul.token.as_deref(), Some("secret"));
        assert_eq!(cfg.consul.wait, Duration::from_secs(300));
        assert_eq!(cfg.service.name, "cbes-group");
        assert_eq!(cfg.service.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(cfg.watch.retry_base_delay, Duration::from_millis(250));
        assert_eq!(cfg.watch.retry_max_delay, default_retry_max_delay());
        assert_eq!(cfg.watch.health_quiet_period, Duration::from_secs(2));
        // back to the yaml and read it again
        let s = serde_yaml::to_string(&cfg).unwrap();
        let again: Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_defaults_only_service() {
        let cfg: Config = serde_json::from_str(r#"{"service": {"name": "svc"}}"#).unwrap();
        assert_eq!(cfg.consul, Consul::default());
        assert_eq!(cfg.watch, Watch::default());
        assert!(cfg.service.id.is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 2s ").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("60d").is_err());
        assert!(parse_duration("5mins").is_err());
        assert!(parse_duration("ms").is_err());
    }
}
