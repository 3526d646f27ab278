use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_TABLE_NAME: &str = "foodshare";
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_CURRENCY: &str = "usd";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:5173";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is missing")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    DynamoDb,
    Memory,
}

/// Runtime settings, read once at cold start.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub table_name: String,
    pub store_backend: StoreBackend,
    pub stripe_secret_key: String,
    pub stripe_api_base: String,
    pub payment_currency: String,
    /// Upper bound on any identity-provider or payment-gateway call.
    pub dependency_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let stripe_secret_key = get("STRIPE_SECRET_KEY").ok_or(ConfigError::Missing("STRIPE_SECRET_KEY"))?;

        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("dynamodb") => StoreBackend::DynamoDb,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let dependency_timeout = match get("DEPENDENCY_TIMEOUT_MS") {
            None => Duration::from_millis(DEFAULT_TIMEOUT_MS),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "DEPENDENCY_TIMEOUT_MS",
                        value: raw,
                    })
                }
            },
        };

        let allowed_origins = get("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            table_name: get("TABLE_NAME").unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string()),
            store_backend,
            stripe_secret_key,
            stripe_api_base: get("STRIPE_API_BASE")
                .unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            payment_currency: get("PAYMENT_CURRENCY")
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string())
                .to_lowercase(),
            dependency_timeout,
            allowed_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn applies_defaults_when_only_the_secret_is_set() {
        let config = Config::from_lookup(lookup(&[("STRIPE_SECRET_KEY", "sk_test_1")])).unwrap();
        assert_eq!(config.table_name, "foodshare");
        assert_eq!(config.store_backend, StoreBackend::DynamoDb);
        assert_eq!(config.payment_currency, "usd");
        assert_eq!(config.dependency_timeout, Duration::from_secs(5));
        assert_eq!(config.allowed_origins, vec!["http://localhost:5173"]);
    }

    #[test]
    fn refuses_to_start_without_stripe_secret() {
        assert_eq!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("STRIPE_SECRET_KEY"))
        );
    }

    #[test]
    fn parses_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", "sk"),
            ("STORE_BACKEND", "memory"),
            ("DEPENDENCY_TIMEOUT_MS", "750"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("STRIPE_API_BASE", "http://localhost:12111/"),
        ]))
        .unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.dependency_timeout, Duration::from_millis(750));
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.stripe_api_base, "http://localhost:12111");
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", "sk"),
            ("DEPENDENCY_TIMEOUT_MS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "DEPENDENCY_TIMEOUT_MS", .. }));
    }
}
