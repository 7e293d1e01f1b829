pub mod adapters;
pub mod config;
pub mod db {
    pub mod models;
}
pub mod models {
    pub mod reading;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod flatten;
    pub mod ingest;
    pub mod mapper;
    pub mod normalize;
    pub mod pipeline;
    pub mod refs;
    pub mod validate;
}

use crate::config::Config;
use crate::services::{pipeline, refs};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info, warn};
use std::path::{Path, PathBuf};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

pub fn run() -> Result<(), String> {
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (historical_enabled={}, historical_window_days={}, realtime_enabled={}, realtime_interval={}s, fetch_workers={})",
        cfg.historical_enabled,
        cfg.historical_window_days,
        cfg.realtime_enabled,
        cfg.realtime_interval_seconds,
        cfg.fetch_workers,
    );

    let mut conn = PgConnection::establish(&cfg.database_url)
        .map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    apply_database_migrations(&mut conn)?;

    if let Some(path) = &cfg.credentials_file {
        refs::seed_credentials_from_csv(&mut conn, path)?;
    }

    let creds = refs::load_credentials(&mut conn)?;
    if creds.is_empty() {
        return Err("no API credentials configured; seed api_credentials or set CREDENTIALS_FILE".to_string());
    }
    info!("Loaded {} credential(s)", creds.len());

    if cfg.historical_enabled {
        for cred in &creds {
            if let Err(e) = pipeline::historical_for_credential(&mut conn, &cfg, cred) {
                warn!("{}: historical ingestion failed: {}", cred.user_id, e);
            }
        }
    } else {
        info!("Historical ingestion disabled via HISTORICAL_ENABLED={}", cfg.historical_enabled);
    }

    if cfg.realtime_enabled {
        pipeline::realtime_loop(&mut conn, &cfg, &creds)?;
    } else {
        info!("Realtime loop disabled via REALTIME_ENABLED={}", cfg.realtime_enabled);
    }

    Ok(())
}

fn configure_env_from_cli() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                env_file = Some(PathBuf::from(&s["--env-file=".len()..]));
            }
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    match env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            load_env_file(&path)?;
            Ok(Some(path))
        }
        None => {
            let default_path = PathBuf::from(".env");
            if default_path.is_file() {
                load_env_file(&default_path)?;
                Ok(Some(default_path))
            } else {
                Ok(None)
            }
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;

    for (index, line) in text.lines().enumerate() {
        match parse_env_assignment(line) {
            Ok(Some((key, value))) => {
                // Values already in the process environment take precedence.
                if std::env::var_os(&key).is_none() {
                    std::env::set_var(key, value);
                }
            }
            Ok(None) => {}
            Err(e) => return Err(format!("{}:{}: {}", path.display(), index + 1, e)),
        }
    }
    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let without_export = trimmed
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(trimmed);

    let (key, raw_value) = without_export
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid environment variable name: {:?}", key));
    }

    let raw_value = raw_value.trim();
    let value = if let Some(inner) = raw_value
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| raw_value.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
    {
        inner.to_string()
    } else {
        raw_value
            .split_once('#')
            .map(|(v, _)| v)
            .unwrap_or(raw_value)
            .trim_end()
            .to_string()
    };
    Ok(Some((key.to_string(), value)))
}

fn main() {
    let loaded_env = match configure_env_from_cli() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(path) = loaded_env.as_ref() {
        info!("Environment loaded from .env file: {}", path.display());
    }

    info!(
        "solar-timescale {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_env_assignment;

    #[test]
    fn env_assignment_forms() {
        assert_eq!(
            parse_env_assignment("DATABASE_URL=postgres://x").unwrap(),
            Some(("DATABASE_URL".into(), "postgres://x".into()))
        );
        assert_eq!(
            parse_env_assignment("export KEY=\"a b\"").unwrap(),
            Some(("KEY".into(), "a b".into()))
        );
        assert_eq!(
            parse_env_assignment("KEY=value # comment").unwrap(),
            Some(("KEY".into(), "value".into()))
        );
        assert_eq!(parse_env_assignment("# comment").unwrap(), None);
        assert_eq!(parse_env_assignment("").unwrap(), None);
        assert!(parse_env_assignment("novalue").is_err());
    }
}
