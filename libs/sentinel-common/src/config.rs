// Service configuration, read from the environment with defaults matching
// the executor image layout.

use crate::types::{IntakePolicy, Language};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub redis_url: String,
    pub scratch_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub languages_config: PathBuf,
    pub max_workers: usize,
    pub max_queued: usize,
    pub tenant_quota: usize,
    pub max_workspaces: usize,
    pub min_free_bytes: u64,
    pub cache_enabled: bool,
    /// Paths sandboxed programs may write to besides their workspace
    pub sandbox_writable: Vec<PathBuf>,
    pub workspace_max_age: Duration,
    pub result_ttl_secs: u64,
    pub worker_languages: Vec<Language>,
    pub api_addr: SocketAddr,
    pub worker_addr: SocketAddr,
    pub log_json: bool,
    pub intake: IntakePolicy,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            redis_url: get("REDIS_URL", "redis://127.0.0.1:6379"),
            scratch_dir: PathBuf::from(get("SENTINEL_SCRATCH_DIR", "/tmp/code-execution")),
            cache_dir: PathBuf::from(get("SENTINEL_CACHE_DIR", "/tmp/sentinel-cache")),
            languages_config: PathBuf::from(get("SENTINEL_LANGUAGES_CONFIG", "config/languages.json")),
            max_workers: parse("SENTINEL_MAX_WORKERS", get("SENTINEL_MAX_WORKERS", "4"))?,
            max_queued: parse("SENTINEL_MAX_QUEUED", get("SENTINEL_MAX_QUEUED", "16"))?,
            tenant_quota: parse("SENTINEL_TENANT_QUOTA", get("SENTINEL_TENANT_QUOTA", "4"))?,
            max_workspaces: parse("SENTINEL_MAX_WORKSPACES", get("SENTINEL_MAX_WORKSPACES", "64"))?,
            min_free_bytes: parse_mebibytes("SENTINEL_MIN_FREE_MB", get("SENTINEL_MIN_FREE_MB", "64"))?,
            cache_enabled: parse_bool("SENTINEL_CACHE_ENABLED", get("SENTINEL_CACHE_ENABLED", "true"))?,
            sandbox_writable: std::env::split_paths(&get("SENTINEL_SANDBOX_WRITABLE", ""))
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
            workspace_max_age: Duration::from_secs(parse(
                "SENTINEL_WORKSPACE_MAX_AGE_SECS",
                get("SENTINEL_WORKSPACE_MAX_AGE_SECS", "3600"),
            )?),
            result_ttl_secs: parse("SENTINEL_RESULT_TTL_SECS", get("SENTINEL_RESULT_TTL_SECS", "86400"))?,
            worker_languages: parse_languages(get("WORKER_LANGUAGES", "cpp"))?,
            api_addr: parse("SENTINEL_API_ADDR", get("SENTINEL_API_ADDR", "0.0.0.0:3000"))?,
            worker_addr: parse("SENTINEL_WORKER_ADDR", get("SENTINEL_WORKER_ADDR", "0.0.0.0:3001"))?,
            log_json: parse_bool("SENTINEL_LOG_JSON", get("SENTINEL_LOG_JSON", "false"))?,
            intake: IntakePolicy::default(),
        })
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

fn parse_mebibytes(key: &'static str, value: String) -> Result<u64, ConfigError> {
    let mebibytes: u64 = parse(key, value.clone())?;
    mebibytes.checked_mul(1024 * 1024).ok_or_else(|| ConfigError::Invalid {
        key,
        value,
        reason: "too large".to_string(),
    })
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_languages(value: String) -> Result<Vec<Language>, ConfigError> {
    let mut languages = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let language = part.parse::<Language>().map_err(|e| ConfigError::Invalid {
            key: "WORKER_LANGUAGES",
            value: value.clone(),
            reason: e.to_string(),
        })?;
        if !languages.contains(&language) {
            languages.push(language);
        }
    }
    if languages.is_empty() {
        return Err(ConfigError::Invalid {
            key: "WORKER_LANGUAGES",
            value,
            reason: "no languages listed".to_string(),
        });
    }
    Ok(languages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults_match_image_layout() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.scratch_dir, PathBuf::from("/tmp/code-execution"));
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/sentinel-cache"));
        assert_eq!(config.worker_languages, vec![Language::Cpp]);
        assert_eq!(config.min_free_bytes, 64 * 1024 * 1024);
        assert!(config.cache_enabled);
        assert!(config.sandbox_writable.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("SENTINEL_MAX_WORKERS", "8"),
            ("WORKER_LANGUAGES", "cpp, java,cpp"),
            ("SENTINEL_CACHE_ENABLED", "off"),
            ("SENTINEL_SANDBOX_WRITABLE", "/dev/shm:/var/tmp/judge"),
        ])
        .unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.worker_languages, vec![Language::Cpp, Language::Java]);
        assert!(!config.cache_enabled);
        assert_eq!(
            config.sandbox_writable,
            vec![PathBuf::from("/dev/shm"), PathBuf::from("/var/tmp/judge")]
        );
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(config_from(&[("SENTINEL_MAX_WORKERS", "many")]).is_err());
        assert!(config_from(&[("WORKER_LANGUAGES", "cobol")]).is_err());
        assert!(config_from(&[("SENTINEL_LOG_JSON", "maybe")]).is_err());
    }

    #[test]
    fn test_huge_free_space_floor_is_rejected() {
        let err = config_from(&[("SENTINEL_MIN_FREE_MB", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("SENTINEL_MIN_FREE_MB"));
        assert!(err.to_string().contains("too large"));

        let config = config_from(&[("SENTINEL_MIN_FREE_MB", "1024")]).unwrap();
        assert_eq!(config.min_free_bytes, 1024 * 1024 * 1024);
    }
}
