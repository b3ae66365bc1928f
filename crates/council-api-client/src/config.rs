use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const ENV_API_BASE_URL: &str = "COUNCIL_API_BASE_URL";
pub const ENV_API_TIMEOUT_MS: &str = "COUNCIL_API_TIMEOUT_MS";

/// Fixed budget for generic calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Orchestrator calls may involve multi-step reasoning and get a longer one.
pub const DEFAULT_ORCHESTRATOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub orchestrator_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: normalize_base_url(base_url.as_ref())?,
            timeout: DEFAULT_TIMEOUT,
            orchestrator_timeout: DEFAULT_ORCHESTRATOR_TIMEOUT,
        })
    }

    /// Resolve from the environment: `COUNCIL_API_BASE_URL` (falling back to
    /// the local default) and an optional `COUNCIL_API_TIMEOUT_MS` override
    /// for the generic budget.
    pub fn from_env() -> Result<Self, ConfigError> {
        let (base_url, _source) = resolve_api_base_url()?;
        let mut config = Self::new(base_url)?;
        if let Some(raw) = env_non_empty(ENV_API_TIMEOUT_MS) {
            if let Ok(ms) = raw.parse::<u64>() {
                config.timeout = Duration::from_millis(ms.max(250));
            } else {
                tracing::warn!(value = %raw, "ignoring unparsable {ENV_API_TIMEOUT_MS}");
            }
        }
        Ok(config)
    }
}

pub fn resolve_api_base_url() -> Result<(String, &'static str), ConfigError> {
    if let Some(base_url) = env_non_empty(ENV_API_BASE_URL) {
        return normalize_base_url(&base_url).map(|normalized| (normalized, ENV_API_BASE_URL));
    }
    normalize_base_url(DEFAULT_API_BASE_URL).map(|normalized| (normalized, "default_local"))
}

pub fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub(crate) fn with_env<T>(
        overrides: &[(&str, Option<&str>)],
        test: impl FnOnce() -> T,
    ) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = overrides
            .iter()
            .map(|(key, _)| (*key, std::env::var(key).ok()))
            .collect::<Vec<_>>();

        for (key, value) in overrides {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        let result = test();

        for (key, value) in previous {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        result
    }

    #[test]
    fn normalize_base_url_trims_and_drops_trailing_slash() {
        let normalized = normalize_base_url(" https://api.council.example/ ").expect("valid url");
        assert_eq!(normalized, "https://api.council.example");
    }

    #[test]
    fn normalize_base_url_requires_http_scheme() {
        let error = normalize_base_url("api.council.example").expect_err("invalid url");
        assert_eq!(error, ConfigError::InvalidBaseUrl);
    }

    #[test]
    fn normalize_base_url_rejects_missing_host() {
        assert_eq!(
            normalize_base_url("https:///orchestrator").expect_err("invalid url"),
            ConfigError::InvalidBaseUrl
        );
        assert_eq!(
            normalize_base_url("   ").expect_err("empty url"),
            ConfigError::EmptyBaseUrl
        );
    }

    #[test]
    fn resolve_api_base_url_defaults_local() {
        with_env(&[(ENV_API_BASE_URL, None)], || {
            let (resolved, source) = resolve_api_base_url().expect("default local url");
            assert_eq!(resolved, DEFAULT_API_BASE_URL);
            assert_eq!(source, "default_local");
        });
    }

    #[test]
    fn resolve_api_base_url_prefers_env() {
        with_env(
            &[(ENV_API_BASE_URL, Some("https://staging.council.example/"))],
            || {
                let (resolved, source) = resolve_api_base_url().expect("env url");
                assert_eq!(resolved, "https://staging.council.example");
                assert_eq!(source, ENV_API_BASE_URL);
            },
        );
    }

    #[test]
    fn from_env_applies_timeout_override() {
        with_env(
            &[
                (ENV_API_BASE_URL, None),
                (ENV_API_TIMEOUT_MS, Some("2500")),
            ],
            || {
                let config = GatewayConfig::from_env().expect("config");
                assert_eq!(config.timeout, Duration::from_millis(2500));
                assert_eq!(config.orchestrator_timeout, DEFAULT_ORCHESTRATOR_TIMEOUT);
            },
        );
    }

    #[test]
    fn from_env_ignores_garbage_timeout() {
        with_env(
            &[
                (ENV_API_BASE_URL, None),
                (ENV_API_TIMEOUT_MS, Some("soon")),
            ],
            || {
                let config = GatewayConfig::from_env().expect("config");
                assert_eq!(config.timeout, DEFAULT_TIMEOUT);
            },
        );
    }
}
