//! Connection and session defaults.

use crate::error::{OrmError, OrmResult};
use std::time::Duration;

/// Which statements reach the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Failed statements only (`RecordNotFound` is not a failure).
    #[default]
    Default,
    /// Every statement.
    Detailed,
    /// Nothing.
    Silent,
}

impl LogMode {
    pub(crate) fn from_flag(enable: bool) -> Self {
        if enable {
            LogMode::Detailed
        } else {
            LogMode::Silent
        }
    }
}

/// Settings used by [`open`](crate::open) and by the root session.
///
/// ```ignore
/// let db = pgseam::open(
///     Config::new("postgres://localhost/app")
///         .max_connections(32)
///         .query_timeout(Duration::from_secs(5)),
/// ).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub max_connections: usize,
    pub log_mode: LogMode,
    pub singular_table: bool,
    pub block_global_update: bool,
    /// Applied to every statement unless the session context sets its own.
    pub query_timeout: Option<Duration>,
    pub slow_query_threshold: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 16,
            log_mode: LogMode::Default,
            singular_table: false,
            block_global_update: false,
            query_timeout: None,
            slow_query_threshold: None,
        }
    }
}

impl Config {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Some(database_url.into()),
            ..Self::default()
        }
    }

    /// Read `DATABASE_URL`, `PGSEAM_MAX_CONNECTIONS`, `PGSEAM_LOG_SQL`,
    /// `PGSEAM_QUERY_TIMEOUT_MS` and `PGSEAM_SLOW_QUERY_MS`.
    ///
    /// Load a `.env` file first (e.g. with `dotenvy`) if you use one.
    pub fn from_env() -> OrmResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> OrmResult<Self> {
        let mut config = Self {
            database_url: lookup("DATABASE_URL"),
            ..Self::default()
        };
        if let Some(v) = lookup("PGSEAM_MAX_CONNECTIONS") {
            config.max_connections = parse_env("PGSEAM_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("PGSEAM_LOG_SQL") {
            config.log_mode = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => LogMode::Detailed,
                "0" | "false" | "no" | "off" => LogMode::Silent,
                "" | "default" => LogMode::Default,
                other => {
                    return Err(OrmError::validation(format!(
                        "PGSEAM_LOG_SQL: expected a boolean, got {other:?}"
                    )));
                }
            };
        }
        if let Some(v) = lookup("PGSEAM_QUERY_TIMEOUT_MS") {
            config.query_timeout = Some(Duration::from_millis(parse_env(
                "PGSEAM_QUERY_TIMEOUT_MS",
                &v,
            )?));
        }
        if let Some(v) = lookup("PGSEAM_SLOW_QUERY_MS") {
            config.slow_query_threshold =
                Some(Duration::from_millis(parse_env("PGSEAM_SLOW_QUERY_MS", &v)?));
        }
        Ok(config)
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn log_mode(mut self, mode: LogMode) -> Self {
        self.log_mode = mode;
        self
    }

    pub fn singular_table(mut self, enable: bool) -> Self {
        self.singular_table = enable;
        self
    }

    pub fn block_global_update(mut self, enable: bool) -> Self {
        self.block_global_update = enable;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> OrmResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| OrmError::validation(format!("{key}: {e}")))
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/app"),
            ("PGSEAM_MAX_CONNECTIONS", "4"),
            ("PGSEAM_LOG_SQL", "true"),
            ("PGSEAM_QUERY_TIMEOUT_MS", "1500"),
            ("PGSEAM_SLOW_QUERY_MS", "200"),
        ]))
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/app"));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.log_mode, LogMode::Detailed);
        assert_eq!(config.query_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.slow_query_threshold, Some(Duration::from_millis(200)));
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.log_mode, LogMode::Default);
        assert!(config.query_timeout.is_none());
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(Config::from_lookup(lookup(&[("PGSEAM_MAX_CONNECTIONS", "many")])).is_err());
        assert!(Config::from_lookup(lookup(&[("PGSEAM_LOG_SQL", "loud")])).is_err());
    }
}
