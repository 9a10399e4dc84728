use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Name this conductor publishes notifications under.
    pub host: String,
    pub dev_mode: bool,
    /// Hosts registered by the in-memory inventory in dev mode.
    pub dev_hosts: Vec<String>,
    pub database: DbConfig,
    pub scheduler: SchedulerConfig,
    pub migration: MigrationConfig,
    pub compute: ComputeAgentConfig,
    pub image: ImageConfig,
    pub service_group: ServiceGroupConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CIRRUS_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8775".to_string())
            .parse()
            .context("CIRRUS_LISTEN_ADDR")?;

        let log_level = std::env::var("CIRRUS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let host = std::env::var("CIRRUS_HOST")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "conductor".to_string());

        let dev_mode = std::env::var("CIRRUS_DEV")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let dev_hosts = std::env::var("CIRRUS_DEV_HOSTS")
            .map(|v| parse_list(&v))
            .unwrap_or_else(|_| vec!["compute-1".to_string(), "compute-2".to_string()]);

        Ok(Self {
            listen_addr,
            log_level,
            host,
            dev_mode,
            dev_hosts,
            database: DbConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            migration: MigrationConfig::from_env(),
            compute: ComputeAgentConfig::from_env(),
            image: ImageConfig::from_env(),
            service_group: ServiceGroupConfig::from_env(),
        })
    }
}

/// Placement behaviour.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduling attempts per instance; 1 disables retry tracking.
    pub max_attempts: u32,
    /// Instance group policies the placement service understands.
    pub supported_group_policies: Vec<String>,
    /// Base URL of the placement service.
    pub placement_url: String,
    pub request_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            supported_group_policies: vec!["affinity".to_string(), "anti-affinity".to_string()],
            placement_url: "http://127.0.0.1:8778".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_parse("CIRRUS_SCHEDULER_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .max(1),
            supported_group_policies: std::env::var("CIRRUS_SCHEDULER_GROUP_POLICIES")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.supported_group_policies),
            placement_url: std::env::var("CIRRUS_PLACEMENT_URL")
                .unwrap_or(defaults.placement_url),
            request_timeout: env_parse("CIRRUS_PLACEMENT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

/// Live migration behaviour.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Destinations tried before giving up; `None` retries until the
    /// scheduler runs out of hosts.
    pub max_retries: Option<u32>,
    /// Bound on synchronous pre-check calls to compute agents.
    pub precheck_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            precheck_timeout: Duration::from_secs(60),
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: std::env::var("CIRRUS_MIGRATE_MAX_RETRIES")
                .ok()
                .and_then(|v| parse_max_retries(&v))
                .unwrap_or(defaults.max_retries),
            precheck_timeout: env_parse("CIRRUS_PRECHECK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.precheck_timeout),
        }
    }
}

/// How compute agents are reached.
#[derive(Debug, Clone)]
pub struct ComputeAgentConfig {
    /// Agent base URL; `{host}` is replaced with the compute host name.
    pub url_template: String,
    /// Transport timeout for casts. Calls wait at least the pre-check timeout.
    pub request_timeout: Duration,
}

impl Default for ComputeAgentConfig {
    fn default() -> Self {
        Self {
            url_template: "http://{host}:8776".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ComputeAgentConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url_template: std::env::var("CIRRUS_COMPUTE_URL_TEMPLATE")
                .unwrap_or(defaults.url_template),
            request_timeout: env_parse("CIRRUS_COMPUTE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }

    pub fn url_for(&self, host: &str) -> String {
        self.url_template.replace("{host}", host)
    }
}

#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub url: String,
    pub request_timeout: Duration,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9292".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ImageConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: std::env::var("CIRRUS_IMAGE_URL").unwrap_or(defaults.url),
            request_timeout: env_parse("CIRRUS_IMAGE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

/// Compute service liveness.
#[derive(Debug, Clone)]
pub struct ServiceGroupConfig {
    /// A service whose last heartbeat is older than this is down.
    pub service_down_time: Duration,
}

impl Default for ServiceGroupConfig {
    fn default() -> Self {
        Self {
            service_down_time: Duration::from_secs(60),
        }
    }
}

impl ServiceGroupConfig {
    pub fn from_env() -> Self {
        Self {
            service_down_time: env_parse("CIRRUS_SERVICE_DOWN_TIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or_else(|| Self::default().service_down_time),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `-1` means unlimited. Returns `None` for unparseable input.
fn parse_max_retries(value: &str) -> Option<Option<u32>> {
    let n: i64 = value.trim().parse().ok()?;
    match n {
        -1 => Some(None),
        n if n >= 0 => u32::try_from(n).ok().map(Some),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("yes"));
    }

    #[test]
    fn test_parse_max_retries() {
        assert_eq!(parse_max_retries("-1"), Some(None));
        assert_eq!(parse_max_retries("0"), Some(Some(0)));
        assert_eq!(parse_max_retries("5"), Some(Some(5)));
        assert_eq!(parse_max_retries("-3"), None);
        assert_eq!(parse_max_retries("many"), None);
    }

    #[test]
    fn test_url_template() {
        let config = ComputeAgentConfig::default();
        assert_eq!(config.url_for("compute-7"), "http://compute-7:8776");
    }

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert!(config
            .supported_group_policies
            .iter()
            .any(|p| p == "anti-affinity"));
    }
}
