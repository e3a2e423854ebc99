use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BACKEND_URL: &str = "http://localhost:4466";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub backend_url: String,
    pub request_timeout: Duration,
    pub stream: StreamDefaults,
}

#[derive(Debug, Clone)]
pub struct StreamDefaults {
    pub reconnect_on_failure: bool,
    pub max_reconnects: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            stream: StreamDefaults::default(),
        }
    }
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            reconnect_on_failure: true,
            max_reconnects: None,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct GatewayConfigFile {
    #[serde(default)]
    backend_url: Option<String>,
    #[serde(default, alias = "timeout", alias = "timeout_secs")]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    stream: StreamSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct StreamSection {
    #[serde(default)]
    reconnect_on_failure: Option<bool>,
    #[serde(default)]
    max_reconnects: Option<u32>,
    #[serde(default, alias = "initial_backoff")]
    initial_backoff_ms: Option<u64>,
    #[serde(default, alias = "max_backoff")]
    max_backoff_secs: Option<u64>,
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let Some(path) = discover_config_path() else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read gateway config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse gateway config {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let parsed: GatewayConfigFile = serde_yaml::from_str(raw)?;
        let defaults = StreamDefaults::default();

        Ok(Self {
            backend_url: parsed
                .backend_url
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            request_timeout: Duration::from_secs(
                parsed.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            stream: StreamDefaults {
                reconnect_on_failure: parsed
                    .stream
                    .reconnect_on_failure
                    .unwrap_or(defaults.reconnect_on_failure),
                max_reconnects: parsed.stream.max_reconnects,
                initial_backoff: parsed
                    .stream
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: parsed
                    .stream
                    .max_backoff_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.max_backoff),
            },
        })
    }
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GANGWAY_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("gangway.yaml"),
        PathBuf::from("gangway.yml"),
        PathBuf::from(".gangway.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/gangway/config.yaml"),
            PathBuf::from(&home).join(".config/gangway/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = GatewayConfig::parse("").unwrap();
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.stream.reconnect_on_failure);
        assert_eq!(config.stream.max_reconnects, None);
    }

    #[test]
    fn fields_override_defaults() {
        let raw = r#"
backend_url: "http://127.0.0.1:9000"
timeout: 5
stream:
  reconnect_on_failure: false
  max_reconnects: 3
  initial_backoff_ms: 100
  max_backoff_secs: 10
"#;
        let config = GatewayConfig::parse(raw).unwrap();
        assert_eq!(config.backend_url, "http://127.0.0.1:9000");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert!(!config.stream.reconnect_on_failure);
        assert_eq!(config.stream.max_reconnects, Some(3));
        assert_eq!(config.stream.initial_backoff, Duration::from_millis(100));
        assert_eq!(config.stream.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        assert!(GatewayConfig::parse("backend_url: [").is_err());
    }
}
