use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Testing,
}

impl Environment {
    fn default_cache_ttl(self) -> Duration {
        match self {
            Environment::Development => Duration::from_secs(300),
            Environment::Production => Duration::from_secs(600),
            Environment::Testing => Duration::from_secs(60),
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "default" | "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "testing" => Ok(Environment::Testing),
            other => bail!("unknown environment {:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub environment: Environment,
    /// How long a cached answer stays valid (`CACHE_TTL`, seconds).
    pub cache_ttl: Duration,
    /// How often the server sweeps expired answers (`CACHE_SWEEP_INTERVAL`, seconds).
    pub cache_sweep_interval: Duration,
    pub executor_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    /// JSON price list to serve instead of the built-in reference prices.
    pub price_catalog: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            cache_ttl: Environment::Development.default_cache_ttl(),
            cache_sweep_interval: Duration::from_secs(300),
            executor_timeout: Duration::from_secs(10),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 100,
            price_catalog: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => Environment::Development,
        };
        let defaults = Config::default();

        let cache_sweep_interval = seconds(&lookup, "CACHE_SWEEP_INTERVAL")?
            .unwrap_or(defaults.cache_sweep_interval);
        if cache_sweep_interval.is_zero() {
            bail!("CACHE_SWEEP_INTERVAL must be at least one second");
        }

        Ok(Config {
            environment,
            cache_ttl: seconds(&lookup, "CACHE_TTL")?
                .unwrap_or_else(|| environment.default_cache_ttl()),
            cache_sweep_interval,
            executor_timeout: seconds(&lookup, "EXECUTOR_TIMEOUT")?
                .unwrap_or(defaults.executor_timeout),
            rate_limit_window: seconds(&lookup, "RATE_LIMIT_WINDOW")?
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max: match lookup("RATE_LIMIT_MAX") {
                Some(value) => value
                    .trim()
                    .parse()
                    .with_context(|| format!("RATE_LIMIT_MAX must be a count, got {:?}", value))?,
                None => defaults.rate_limit_max,
            },
            price_catalog: lookup("PRICE_CATALOG")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .with_context(|| format!("{} must be a number of seconds, got {:?}", key, value))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = config(&[]).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn environment_picks_ttl_profile() {
        assert_eq!(
            config(&[("ENVIRONMENT", "production")]).unwrap().cache_ttl,
            Duration::from_secs(600)
        );
        assert_eq!(
            config(&[("ENVIRONMENT", "Testing")]).unwrap().cache_ttl,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn explicit_values_override_profile() {
        let config = config(&[
            ("ENVIRONMENT", "production"),
            ("CACHE_TTL", "42"),
            ("CACHE_SWEEP_INTERVAL", "30"),
            ("EXECUTOR_TIMEOUT", "3"),
            ("RATE_LIMIT_WINDOW", "10"),
            ("RATE_LIMIT_MAX", "5"),
            ("PRICE_CATALOG", "/tmp/prices.json"),
        ])
        .unwrap();

        assert_eq!(config.cache_ttl, Duration::from_secs(42));
        assert_eq!(config.cache_sweep_interval, Duration::from_secs(30));
        assert_eq!(config.executor_timeout, Duration::from_secs(3));
        assert_eq!(config.rate_limit_window, Duration::from_secs(10));
        assert_eq!(config.rate_limit_max, 5);
        assert_eq!(config.price_catalog, Some(PathBuf::from("/tmp/prices.json")));
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(config(&[("CACHE_TTL", "five minutes")]).is_err());
        assert!(config(&[("RATE_LIMIT_MAX", "-1")]).is_err());
        assert!(config(&[("ENVIRONMENT", "staging")]).is_err());
        assert!(config(&[("CACHE_SWEEP_INTERVAL", "0")]).is_err());
    }
}
