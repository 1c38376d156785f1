//! Configuration management for the reporter.

use crate::{CoreError, CoreResult, Paths};
use event_transport::{
    DEFAULT_MAX_BREADCRUMBS, DEFAULT_MAX_CONCURRENT_ATTEMPTS, DEFAULT_MAX_EVENTS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;
use url::Url;

/// Collector endpoint used when none is configured (can be overridden at
/// compile time via REPORTER_ENDPOINT).
pub const DEFAULT_ENDPOINT: &str = match option_env!("REPORTER_ENDPOINT") {
    Some(url) => url,
    None => "http://localhost:8000/api/events",
};

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Reporter configuration, stored as JSON in `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Collector URL events are POSTed to.
    pub endpoint: String,
    pub auth_token: Option<String>,
    /// Fraction of fresh events sent, in [0, 1].
    pub sample_rate: f64,
    /// Capacity of the offline store.
    pub max_events: usize,
    pub max_breadcrumbs: usize,
    pub request_timeout_secs: u64,
    pub max_concurrent_attempts: usize,
    pub hook_timeout_ms: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Drain stored events every N seconds. Unset disables periodic drains.
    pub drain_interval_secs: Option<u64>,
    pub drain_on_start: bool,
    pub drain_after_success: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_token: None,
            sample_rate: 1.0,
            max_events: DEFAULT_MAX_EVENTS,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            request_timeout_secs: 30,
            max_concurrent_attempts: DEFAULT_MAX_CONCURRENT_ATTEMPTS,
            hook_timeout_ms: 2_000,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            drain_interval_secs: None,
            drain_on_start: true,
            drain_after_success: false,
        }
    }
}

impl Config {
    /// Defaults overridden from the environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load `config.json` if present, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override fields from `REPORTER_*` environment variables.
    pub fn load_from_env(&mut self) {
        self.apply_env(|name| std::env::var(name).ok());
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).and_then(non_empty);

        if let Some(log_level) = var("REPORTER_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(endpoint) = var("REPORTER_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(raw) = var("REPORTER_SAMPLE_RATE") {
            match raw.parse::<f64>() {
                Ok(rate) if !rate.is_nan() => self.sample_rate = rate.clamp(0.0, 1.0),
                _ => warn!(value = %raw, "Ignoring invalid REPORTER_SAMPLE_RATE"),
            }
        }
        if let Some(raw) = var("REPORTER_MAX_EVENTS") {
            match raw.parse::<usize>() {
                Ok(max_events) => self.max_events = max_events,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid REPORTER_MAX_EVENTS"),
            }
        }
    }

    /// The collector endpoint as a parsed URL. Only http and https are accepted.
    pub fn endpoint_url(&self) -> CoreResult<Url> {
        let url = Url::parse(&self.endpoint)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(CoreError::Config(format!(
                "unsupported endpoint scheme: {scheme}"
            ))),
        }
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.max_events, DEFAULT_MAX_EVENTS);
        assert!(config.drain_on_start);
    }

    #[test]
    fn test_config_load_from_file_fills_missing_fields() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");

        let config_json = r#"{
            "log_level": "debug",
            "sample_rate": 0.5
        }"#;
        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.sample_rate, 0.5);
        assert_eq!(config.max_events, DEFAULT_MAX_EVENTS);
    }

    #[test]
    fn test_config_load_from_invalid_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ not json").unwrap();

        assert!(matches!(
            Config::load_from_file(&config_path),
            Err(CoreError::Json(_))
        ));
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config {
            max_events: 42,
            drain_interval_secs: Some(60),
            auth_token: Some("secret".to_string()),
            ..Default::default()
        };
        config.save(&paths).unwrap();

        let loaded = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.max_breadcrumbs, DEFAULT_MAX_BREADCRUMBS);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("REPORTER_LOG_LEVEL", "trace"),
            ("REPORTER_ENDPOINT", "https://collector.example.com/events"),
            ("REPORTER_SAMPLE_RATE", "0.25"),
            ("REPORTER_MAX_EVENTS", "50"),
        ]));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.endpoint, "https://collector.example.com/events");
        assert_eq!(config.sample_rate, 0.25);
        assert_eq!(config.max_events, 50);
    }

    #[test]
    fn test_env_sample_rate_clamped() {
        let mut config = Config::default();
        config.apply_env(env(&[("REPORTER_SAMPLE_RATE", "7")]));
        assert_eq!(config.sample_rate, 1.0);

        config.apply_env(env(&[("REPORTER_SAMPLE_RATE", "-1")]));
        assert_eq!(config.sample_rate, 0.0);
    }

    #[test]
    fn test_env_invalid_and_empty_values_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("REPORTER_SAMPLE_RATE", "often"),
            ("REPORTER_MAX_EVENTS", "-3"),
            ("REPORTER_LOG_LEVEL", "   "),
        ]));

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_endpoint_url_parse() {
        let config = Config {
            endpoint: "https://collector.example.com/api/events".to_string(),
            ..Default::default()
        };
        let url = config.endpoint_url().unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("collector.example.com"));
    }

    #[test]
    fn test_endpoint_url_invalid() {
        let mut config = Config::default();
        config.endpoint = "not a valid url".to_string();
        assert!(matches!(config.endpoint_url(), Err(CoreError::InvalidUrl(_))));

        config.endpoint = "ftp://collector.example.com".to_string();
        assert!(matches!(config.endpoint_url(), Err(CoreError::Config(_))));
    }
}
