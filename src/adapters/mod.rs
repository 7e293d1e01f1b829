//! Vendor API adapters.
//!
//! One blocking client per vendor (`ureq`, no async), all exposing the same
//! four operations: list plants, list devices, fetch a historical window,
//! fetch the current snapshot. Authentication and request signing are
//! adapter-internal; callers only ever see raw vendor-shaped JSON rows.

pub mod shinemonitor;
pub mod solarman;
pub mod soliscloud;

use chrono::NaiveDate;
use log::warn;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::db::models::Credential;
use crate::models::reading::{DeviceRef, PlantRef, RawPayload, Vendor};

pub use shinemonitor::ShinemonitorClient;
pub use solarman::SolarmanClient;
pub use soliscloud::SoliscloudClient;

/// Give up on a device's historical window after this many consecutive
/// days without data (day-windowed vendor APIs only).
pub const MAX_CONSECUTIVE_NO_DATA_DAYS: u32 = 30;

/// What to fetch for a device.
#[derive(Debug, Clone, Copy)]
pub enum FetchKind {
    Historical { start: NaiveDate, end: NaiveDate },
    Realtime,
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum AdapterError {
    /// Network-level failure or an HTTP error status; retried with backoff.
    Transport(String),
    Http { status: u16, message: String },
    /// Vendor-reported application error ("no data for date", bad
    /// credentials); never retried.
    Business(String),
    Json(serde_json::Error),
    Auth(String),
    /// Credential row is missing a field this vendor requires.
    Credential(String),
}

impl core::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AdapterError::Transport(s) => write!(f, "transport error: {}", s),
            AdapterError::Http { status, message } => write!(f, "http {}: {}", status, message),
            AdapterError::Business(s) => write!(f, "vendor error: {}", s),
            AdapterError::Json(e) => write!(f, "json error: {}", e),
            AdapterError::Auth(e) => write!(f, "auth error: {}", e),
            AdapterError::Credential(e) => write!(f, "credential error: {}", e),
        }
    }
}

impl std::error::Error for AdapterError {}

impl From<serde_json::Error> for AdapterError {
    fn from(value: serde_json::Error) -> Self {
        AdapterError::Json(value)
    }
}

impl AdapterError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AdapterError::Transport(_) | AdapterError::Http { .. })
    }

    /// "Nothing to do" for this unit of work rather than a fault.
    pub fn is_no_data(&self) -> bool {
        match self {
            AdapterError::Business(msg) => {
                let msg = msg.to_ascii_uppercase();
                msg.contains("ERR_NO_RECORD") || msg.contains("NO DATA")
            }
            _ => false,
        }
    }
}

pub(crate) fn classify_ureq(err: ureq::Error) -> AdapterError {
    match err {
        ureq::Error::Transport(t) => AdapterError::Transport(t.to_string()),
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_else(|_| String::from("<no body>"));
            AdapterError::Http { status, message: body }
        }
    }
}

/// Run a vendor call with bounded exponential backoff. Only transport-class
/// errors are retried; vendor business errors surface immediately.
pub(crate) fn with_backoff<T>(
    what: &str,
    mut call: impl FnMut() -> Result<T, AdapterError>,
) -> Result<T, AdapterError> {
    let mut delay = RETRY_INITIAL;
    let mut attempt = 1;
    loop {
        match call() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transport() && attempt < RETRY_ATTEMPTS => {
                warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, attempt, RETRY_ATTEMPTS, e, delay);
                thread::sleep(delay);
                delay = (delay * 2).min(RETRY_CAP);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Closed polymorphic adapter: one variant per vendor, selected from the
/// credential's `api_provider` at run start.
pub enum VendorAdapter {
    Shinemonitor(ShinemonitorClient),
    Solarman(SolarmanClient),
    Soliscloud(SoliscloudClient),
}

impl VendorAdapter {
    pub fn from_credential(cred: &Credential, cfg: &Config) -> Result<VendorAdapter, AdapterError> {
        match Vendor::from_provider(&cred.api_provider) {
            Vendor::Shinemonitor => Ok(VendorAdapter::Shinemonitor(ShinemonitorClient::new(
                &cfg.shinemonitor_base_url,
                cfg.company_key.as_deref(),
                &cred.username,
                &cred.password,
            ))),
            Vendor::Solarman => {
                let (key, secret) = require_key_pair(cred)?;
                Ok(VendorAdapter::Solarman(SolarmanClient::new(
                    &cfg.solarman_base_url,
                    &cred.username,
                    &cred.password,
                    key,
                    secret,
                )))
            }
            Vendor::Soliscloud => {
                let (key, secret) = require_key_pair(cred)?;
                Ok(VendorAdapter::Soliscloud(SoliscloudClient::new(
                    &cfg.soliscloud_base_url,
                    key,
                    secret,
                    &cred.user_id,
                )))
            }
        }
    }

    pub fn vendor(&self) -> Vendor {
        match self {
            VendorAdapter::Shinemonitor(_) => Vendor::Shinemonitor,
            VendorAdapter::Solarman(_) => Vendor::Solarman,
            VendorAdapter::Soliscloud(_) => Vendor::Soliscloud,
        }
    }

    pub fn list_plants(&self) -> Result<Vec<PlantRef>, AdapterError> {
        match self {
            VendorAdapter::Shinemonitor(c) => c.list_plants(),
            VendorAdapter::Solarman(c) => c.list_plants(),
            VendorAdapter::Soliscloud(c) => c.list_plants(),
        }
    }

    pub fn list_devices(&self, plant: &PlantRef) -> Result<Vec<DeviceRef>, AdapterError> {
        match self {
            VendorAdapter::Shinemonitor(c) => c.list_devices(plant),
            VendorAdapter::Solarman(c) => c.list_devices(plant),
            VendorAdapter::Soliscloud(c) => c.list_devices(plant),
        }
    }

    pub fn fetch_historical(
        &self,
        device: &DeviceRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawPayload, AdapterError> {
        match self {
            VendorAdapter::Shinemonitor(c) => c.fetch_historical(device, start, end),
            VendorAdapter::Solarman(c) => c.fetch_historical(device, start, end),
            VendorAdapter::Soliscloud(c) => c.fetch_historical(device, start, end),
        }
    }

    pub fn fetch_realtime(&self, device: &DeviceRef) -> Result<RawPayload, AdapterError> {
        match self {
            VendorAdapter::Shinemonitor(c) => c.fetch_realtime(device),
            VendorAdapter::Solarman(c) => c.fetch_realtime(device),
            VendorAdapter::Soliscloud(c) => c.fetch_realtime(device),
        }
    }
}

fn require_key_pair(cred: &Credential) -> Result<(&str, &str), AdapterError> {
    match (cred.api_key.as_deref(), cred.api_secret.as_deref()) {
        (Some(k), Some(s)) if !k.is_empty() && !s.is_empty() => Ok((k, s)),
        _ => Err(AdapterError::Credential(format!(
            "user {} ({}) is missing api_key/api_secret",
            cred.user_id, cred.api_provider
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_data_detection() {
        assert!(AdapterError::Business("ERR_NO_RECORD".into()).is_no_data());
        assert!(AdapterError::Business("no data for date".into()).is_no_data());
        assert!(!AdapterError::Business("invalid signature".into()).is_no_data());
        assert!(!AdapterError::Transport("timeout".into()).is_no_data());
    }

    #[test]
    fn business_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_backoff("test", || {
            calls += 1;
            Err(AdapterError::Business("ERR_NO_RECORD".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
