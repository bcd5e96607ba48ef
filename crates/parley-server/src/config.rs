use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Placeholder shipped for local development. Refused in production.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";
const MIN_PRODUCTION_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub production: bool,
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
    pub gemini_api_key: Option<String>,
    /// Overrides the public Gemini endpoint (proxies, tests).
    pub gemini_base_url: Option<String>,
    pub model: String,
    pub history_limit: u32,
    pub assistant_timeout: Duration,
    /// Account promoted to `admin` at startup, if it exists.
    pub admin_username: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let parsed = |key: &str, default: u64| -> Result<u64> {
            match var(key) {
                Some(raw) => raw.parse().with_context(|| format!("{key} must be a number")),
                None => Ok(default),
            }
        };

        let production = var("PARLEY_ENV").is_some_and(|env| env.eq_ignore_ascii_case("production"));
        let jwt_secret = var("PARLEY_JWT_SECRET").unwrap_or_else(|| DEV_JWT_SECRET.into());
        if production && (jwt_secret == DEV_JWT_SECRET || jwt_secret.len() < MIN_PRODUCTION_SECRET_LEN) {
            bail!(
                "PARLEY_JWT_SECRET must be set to a random value of at least {MIN_PRODUCTION_SECRET_LEN} characters in production"
            );
        }

        let span = |key: &str, default: u64, unit: fn(i64) -> Option<chrono::Duration>| -> Result<chrono::Duration> {
            i64::try_from(parsed(key, default)?)
                .ok()
                .and_then(unit)
                .with_context(|| format!("{key} out of range"))
        };

        let port = parsed("PARLEY_PORT", 3000)?;
        let port = u16::try_from(port).context("PARLEY_PORT out of range")?;

        Ok(Self {
            host: var("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: PathBuf::from(var("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into())),
            jwt_secret,
            production,
            access_ttl: span("PARLEY_ACCESS_TTL_SECS", 3600, chrono::Duration::try_seconds)?,
            refresh_ttl: span("PARLEY_REFRESH_TTL_DAYS", 30, chrono::Duration::try_days)?,
            gemini_api_key: var("GEMINI_API_KEY"),
            gemini_base_url: var("GEMINI_BASE_URL"),
            model: var("PARLEY_MODEL").unwrap_or_else(|| "gemini-2.5-flash".into()),
            history_limit: u32::try_from(parsed("PARLEY_HISTORY_LIMIT", 5)?)
                .context("PARLEY_HISTORY_LIMIT out of range")?,
            assistant_timeout: Duration::from_secs(parsed("PARLEY_ASSISTANT_TIMEOUT_SECS", 20)?),
            admin_username: var("PARLEY_ADMIN_USERNAME"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.jwt_secret, DEV_JWT_SECRET);
        assert!(!config.production);
        assert_eq!(config.refresh_ttl, chrono::Duration::days(30));
        assert_eq!(config.history_limit, 5);
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn production_refuses_placeholder_secret() {
        assert!(Config::from_lookup(lookup(&[("PARLEY_ENV", "production")])).is_err());
        assert!(
            Config::from_lookup(lookup(&[("PARLEY_ENV", "production"), ("PARLEY_JWT_SECRET", "short")]))
                .is_err()
        );

        let secret = "x".repeat(48);
        let config = Config::from_lookup(lookup(&[
            ("PARLEY_ENV", "production"),
            ("PARLEY_JWT_SECRET", &secret),
        ]))
        .unwrap();
        assert!(config.production);
    }

    #[test]
    fn rejects_garbage_numbers() {
        assert!(Config::from_lookup(lookup(&[("PARLEY_PORT", "eighty")])).is_err());
        assert!(Config::from_lookup(lookup(&[("PARLEY_PORT", "70000")])).is_err());
    }

    #[test]
    fn oversized_lifetimes_are_errors() {
        assert!(Config::from_lookup(lookup(&[("PARLEY_REFRESH_TTL_DAYS", "18446744073709551615")])).is_err());
        assert!(Config::from_lookup(lookup(&[("PARLEY_REFRESH_TTL_DAYS", "9223372036854775807")])).is_err());
        assert!(Config::from_lookup(lookup(&[("PARLEY_ACCESS_TTL_SECS", "9223372036854775807")])).is_err());

        let config = Config::from_lookup(lookup(&[("PARLEY_ACCESS_TTL_SECS", "900")])).unwrap();
        assert_eq!(config.access_ttl, chrono::Duration::minutes(15));
    }
}
