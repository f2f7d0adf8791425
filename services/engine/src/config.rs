//! Engine configuration.
//!
//! Directories and the provider name come from the environment the broker
//! launches us with; tuning knobs come from the provider config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hostprov_reconcile::{Policy, RetryPolicy};
use serde::Deserialize;

use crate::engine::DEFAULT_MAX_PARALLEL;

/// Engine configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider name; prefixes the config, template and store file names.
    pub provider_name: String,

    /// Directory holding `conf/`.
    pub conf_dir: PathBuf,

    /// Directory holding the store file.
    pub data_dir: PathBuf,

    /// Log level override (trace, debug, info, warn, error).
    pub log_level: Option<String>,

    /// Concurrent provider calls per invocation.
    pub max_parallel: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |primary: &str, fallback: &str| {
            lookup(primary)
                .or_else(|| lookup(fallback))
                .filter(|v| !v.trim().is_empty())
        };

        let conf_dir = var("HOSTPROV_CONF_DIR", "PRO_CONF_DIR")
            .map(PathBuf::from)
            .context("Missing config directory. Set HOSTPROV_CONF_DIR (or PRO_CONF_DIR).")?;

        let data_dir = var("HOSTPROV_DATA_DIR", "PRO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| conf_dir.join("data"));

        let provider_name = lookup("PROVIDER_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "hostprov".to_string());

        let log_level = lookup("HOSTPROV_LOG_LEVEL").filter(|v| !v.trim().is_empty());

        let max_parallel: usize = lookup("HOSTPROV_MAX_PARALLEL")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTPROV_MAX_PARALLEL must be a positive integer.")?
            .unwrap_or(DEFAULT_MAX_PARALLEL)
            .max(1);

        Ok(Self {
            provider_name,
            conf_dir,
            data_dir,
            log_level,
            max_parallel,
        })
    }

    pub fn provider_config_path(&self) -> PathBuf {
        self.conf_dir
            .join("conf")
            .join(format!("{}prov_config.json", self.provider_name))
    }

    pub fn templates_path(&self) -> PathBuf {
        self.conf_dir
            .join("conf")
            .join(format!("{}prov_templates.json", self.provider_name))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}-db.json", self.provider_name))
    }
}

/// Contents of `<provider>prov_config.json`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub log_level: Option<String>,
    /// Minutes.
    pub instance_creation_timeout: Option<u64>,
    /// Minutes.
    pub orphan_grace_window: Option<u64>,
    /// Seconds.
    pub reclaim_notice_window: Option<u64>,
    /// Hours.
    pub request_gc_window: Option<u64>,
    pub spot_terminate_on_reclaim: Option<bool>,
    pub retry_max_attempts: Option<u32>,
    pub retry_initial_backoff_ms: Option<u64>,
    pub retry_max_backoff_ms: Option<u64>,
    /// Snapshot file of the simulated provider.
    pub simulator_state_file: Option<PathBuf>,
}

impl ProviderConfig {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Lifecycle policy, with defaults for unset keys.
    pub fn policy(&self) -> Result<Policy> {
        let defaults = Policy::default();
        let policy = Policy {
            creation_timeout: scaled(
                "instanceCreationTimeout",
                self.instance_creation_timeout.filter(|m| *m > 0),
                60,
            )?
            .unwrap_or(defaults.creation_timeout),
            orphan_grace_window: scaled("orphanGraceWindow", self.orphan_grace_window, 60)?
                .unwrap_or(defaults.orphan_grace_window),
            reclaim_notice_window: scaled("reclaimNoticeWindow", self.reclaim_notice_window, 1)?
                .unwrap_or(defaults.reclaim_notice_window),
            request_gc_window: scaled("requestGcWindow", self.request_gc_window, 3600)?
                .unwrap_or(defaults.request_gc_window),
            terminate_on_reclaim: self
                .spot_terminate_on_reclaim
                .unwrap_or(defaults.terminate_on_reclaim),
        };
        policy.validate().context("invalid lifecycle policy")?;
        Ok(policy)
    }

    /// Provider retry policy, with defaults for unset keys.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: self.retry_max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: self
                .retry_initial_backoff_ms
                .map_or(defaults.initial_backoff, Duration::from_millis),
            max_backoff: self
                .retry_max_backoff_ms
                .map_or(defaults.max_backoff, Duration::from_millis),
            multiplier: defaults.multiplier,
        };
        retry.validate().context("invalid retry policy")?;
        Ok(retry)
    }
}

/// Longest window accepted from the provider file: one hundred years.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

/// `value` in units of `unit_secs` seconds, rejecting absurd values.
fn scaled(key: &str, value: Option<u64>, unit_secs: u64) -> Result<Option<Duration>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let secs = value
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_WINDOW_SECS)
        .ok_or_else(|| anyhow::anyhow!("{value} is out of range"))
        .with_context(|| format!("invalid {key}"))?;
    Ok(Some(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_paths_follow_provider_name() {
        let config = Config::from_lookup(lookup(&[
            ("PRO_CONF_DIR", "/opt/broker"),
            ("PROVIDER_NAME", "aws"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/opt/broker/data"));
        assert_eq!(
            config.provider_config_path(),
            PathBuf::from("/opt/broker/conf/awsprov_config.json")
        );
        assert_eq!(
            config.templates_path(),
            PathBuf::from("/opt/broker/conf/awsprov_templates.json")
        );
        assert_eq!(config.store_path(), PathBuf::from("/opt/broker/data/aws-db.json"));
        assert_eq!(config.max_parallel, DEFAULT_MAX_PARALLEL);
    }

    #[test]
    fn test_own_variables_win() {
        let config = Config::from_lookup(lookup(&[
            ("HOSTPROV_CONF_DIR", "/etc/hostprov"),
            ("PRO_CONF_DIR", "/opt/broker"),
            ("PRO_DATA_DIR", "/var/lib/broker"),
            ("HOSTPROV_MAX_PARALLEL", "0"),
        ]))
        .unwrap();

        assert_eq!(config.conf_dir, PathBuf::from("/etc/hostprov"));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/broker"));
        assert_eq!(config.provider_name, "hostprov");
        assert_eq!(config.max_parallel, 1);
    }

    #[test]
    fn test_missing_conf_dir_is_an_error() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(Config::from_lookup(lookup(&[
            ("PRO_CONF_DIR", "/opt/broker"),
            ("HOSTPROV_MAX_PARALLEL", "many"),
        ]))
        .is_err());
    }

    #[test]
    fn test_provider_config_units() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{
                "logLevel": "debug",
                "instanceCreationTimeout": 15,
                "orphanGraceWindow": 2,
                "reclaimNoticeWindow": 90,
                "requestGcWindow": 48,
                "spotTerminateOnReclaim": true,
                "retryMaxAttempts": 5,
                "retryInitialBackoffMs": 100
            }"#,
        )
        .unwrap();

        let policy = config.policy().unwrap();
        assert_eq!(policy.creation_timeout, Duration::from_secs(15 * 60));
        assert_eq!(policy.orphan_grace_window, Duration::from_secs(120));
        assert_eq!(policy.reclaim_notice_window, Duration::from_secs(90));
        assert_eq!(policy.request_gc_window, Duration::from_secs(48 * 3600));
        assert!(policy.terminate_on_reclaim);

        let retry = config.retry_policy().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(retry.max_backoff, RetryPolicy::default().max_backoff);
    }

    #[test]
    fn test_out_of_range_windows_are_rejected() {
        for body in [
            r#"{ "instanceCreationTimeout": 18446744073709551615 }"#,
            r#"{ "orphanGraceWindow": 307445734561825861 }"#,
            r#"{ "requestGcWindow": 5124095576030432 }"#,
            r#"{ "reclaimNoticeWindow": 18446744073709551615 }"#,
        ] {
            let config: ProviderConfig = serde_json::from_str(body).unwrap();
            let err = config.policy().unwrap_err();
            assert!(format!("{err:#}").contains("out of range"), "{err:#}");
        }
    }

    #[test]
    fn test_missing_provider_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProviderConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ProviderConfig::default());
        assert_eq!(config.policy().unwrap(), Policy::default());
    }
}
