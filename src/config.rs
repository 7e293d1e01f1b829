//! Runtime configuration, environment-driven.

use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Optional CSV seed file for the api_credentials table.
    pub credentials_file: Option<String>,
    /// Days of history fetched per device when backfilling.
    pub historical_window_days: i64,
    pub historical_enabled: bool,
    pub realtime_enabled: bool,
    pub realtime_interval_seconds: u64,
    /// Concurrent vendor fetches per run.
    pub fetch_workers: usize,
    pub shinemonitor_base_url: String,
    pub solarman_base_url: String,
    pub soliscloud_base_url: String,
    /// ShineMonitor company key, appended to auth requests when set.
    pub company_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Config, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, String> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| format!("missing required environment variable {}", key))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            credentials_file: optional("CREDENTIALS_FILE"),
            historical_window_days: parsed(&lookup, "HISTORICAL_WINDOW_DAYS", 10)?,
            historical_enabled: parsed_bool(&lookup, "HISTORICAL_ENABLED", true)?,
            realtime_enabled: parsed_bool(&lookup, "REALTIME_ENABLED", true)?,
            realtime_interval_seconds: parsed(&lookup, "REALTIME_INTERVAL_SECONDS", 300)?,
            fetch_workers: parsed(&lookup, "FETCH_WORKERS", 4)?,
            shinemonitor_base_url: optional("SHINEMONITOR_BASE_URL")
                .unwrap_or_else(|| "http://api.shinemonitor.com/public/".to_string()),
            solarman_base_url: optional("SOLARMAN_BASE_URL")
                .unwrap_or_else(|| "https://globalapi.solarmanpv.com".to_string()),
            soliscloud_base_url: optional("SOLISCLOUD_BASE_URL")
                .unwrap_or_else(|| "https://www.soliscloud.com:13333".to_string()),
            company_key: optional("SHINEMONITOR_COMPANY_KEY"),
        })
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match lookup(key) {
        Some(raw) if !raw.is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has unparseable value {:?}", key, raw)),
        _ => Ok(default),
    }
}

fn parsed_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    match lookup(key) {
        Some(raw) if !raw.is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(format!("{} has unparseable boolean {:?}", key, raw)),
        },
        _ => Ok(default),
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
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let cfg =
            Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/solar")]))
                .unwrap();
        assert_eq!(cfg.historical_window_days, 10);
        assert!(cfg.historical_enabled);
        assert!(cfg.realtime_enabled);
        assert_eq!(cfg.realtime_interval_seconds, 300);
        assert_eq!(cfg.fetch_workers, 4);
        assert!(cfg.company_key.is_none());
    }

    #[test]
    fn database_url_is_required() {
        assert!(Config::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn overrides_and_booleans() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/solar"),
            ("HISTORICAL_WINDOW_DAYS", "30"),
            ("REALTIME_ENABLED", "off"),
            ("FETCH_WORKERS", "8"),
        ]))
        .unwrap();
        assert_eq!(cfg.historical_window_days, 30);
        assert!(!cfg.realtime_enabled);
        assert_eq!(cfg.fetch_workers, 8);
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/solar"),
            ("FETCH_WORKERS", "many"),
        ]));
        assert!(err.is_err());
    }
}
