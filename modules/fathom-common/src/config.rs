use std::env;
use std::time::Duration;

use tracing::info;

use crate::error::FathomError;

/// Default bound on a single execution-environment call.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 120;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Browserless
    pub browserless_url: String,
    pub browserless_token: Option<String>,

    // Training
    pub execution_timeout: Duration,
    pub seed: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, FathomError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, FathomError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let browserless_url = lookup("BROWSERLESS_URL").ok_or_else(|| {
            FathomError::Config("BROWSERLESS_URL environment variable is required".to_string())
        })?;

        let execution_timeout = match lookup("FATHOM_EXECUTION_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(FathomError::Config(format!(
                        "FATHOM_EXECUTION_TIMEOUT_SECS must be a positive number, got {raw:?}"
                    )))
                }
            },
            None => Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
        };

        let seed = match lookup("FATHOM_SEED") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                FathomError::Config(format!("FATHOM_SEED must be a number, got {raw:?}"))
            })?),
            None => None,
        };

        Ok(Self {
            browserless_url,
            browserless_token: lookup("BROWSERLESS_TOKEN").filter(|t| !t.is_empty()),
            execution_timeout,
            seed,
        })
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        let token = match self.browserless_token {
            Some(_) => "[set]",
            None => "[unset]",
        };
        info!(
            browserless_url = self.browserless_url.as_str(),
            browserless_token = token,
            execution_timeout_secs = self.execution_timeout.as_secs(),
            seed = ?self.seed,
            "Configuration loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_optional_vars_missing() {
        let config =
            Config::from_lookup(lookup_from(&[("BROWSERLESS_URL", "http://localhost:3000")]))
                .unwrap();
        assert_eq!(config.browserless_url, "http://localhost:3000");
        assert_eq!(config.browserless_token, None);
        assert_eq!(
            config.execution_timeout,
            Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS)
        );
        assert_eq!(config.seed, None);
    }

    #[test]
    fn missing_browserless_url_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, FathomError::Config(_)));
    }

    #[test]
    fn parses_timeout_and_seed() {
        let config = Config::from_lookup(lookup_from(&[
            ("BROWSERLESS_URL", "http://b:3000"),
            ("BROWSERLESS_TOKEN", "secret"),
            ("FATHOM_EXECUTION_TIMEOUT_SECS", "300"),
            ("FATHOM_SEED", "7"),
        ]))
        .unwrap();
        assert_eq!(config.browserless_token.as_deref(), Some("secret"));
        assert_eq!(config.execution_timeout, Duration::from_secs(300));
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn rejects_non_numeric_timeout() {
        let err = Config::from_lookup(lookup_from(&[
            ("BROWSERLESS_URL", "http://b:3000"),
            ("FATHOM_EXECUTION_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, FathomError::Config(_)));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = Config::from_lookup(lookup_from(&[
            ("BROWSERLESS_URL", "http://b:3000"),
            ("FATHOM_EXECUTION_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, FathomError::Config(_)));
    }
}
