//! ShineMonitor (ESS/dessmonitor) portal client.
//!
//! Every call is a signed GET: the signature is the SHA-1 hex of
//! `salt + secret-material + action`, where the secret material is the
//! SHA-1 of the password for auth calls and `secret + token` for everything
//! else. The salt is the current epoch in milliseconds and rides along as a
//! query parameter. The envelope is `{err, desc, dat}` with `err == 0` on
//! success.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{classify_ureq, with_backoff, AdapterError, MAX_CONSECUTIVE_NO_DATA_DAYS};
use crate::models::reading::{DeviceRef, PlantRef, RawPayload};

/// Tokens outlive this by far upstream, but re-authing well before vendor
/// expiry avoids clock-skew surprises.
const SESSION_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const PAGE_SIZE: u32 = 200;

struct Session {
    secret: String,
    token: String,
    obtained: Instant,
}

pub struct ShinemonitorClient {
    agent: ureq::Agent,
    base_url: String,
    company_key: Option<String>,
    username: String,
    password: String,
    session: Mutex<Option<Session>>,
}

impl ShinemonitorClient {
    pub fn new(base_url: &str, company_key: Option<&str>, username: &str, password: &str) -> Self {
        ShinemonitorClient {
            agent: ureq::AgentBuilder::new()
                .timeout_read(Duration::from_secs(30))
                .timeout_write(Duration::from_secs(30))
                .build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            company_key: company_key.map(str::to_string),
            username: username.to_string(),
            password: password.to_string(),
            session: Mutex::new(None),
        }
    }

    fn salt() -> String {
        Utc::now().timestamp_millis().to_string()
    }

    /// Authenticate and cache the (secret, token) pair.
    fn ensure_session(&self) -> Result<(String, String), AdapterError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|_| AdapterError::Auth("session lock poisoned".to_string()))?;

        if let Some(s) = guard.as_ref() {
            if s.obtained.elapsed() < SESSION_TTL {
                return Ok((s.secret.clone(), s.token.clone()));
            }
        }

        let mut action = format!(
            "&action=authSource&usr={}&source=1",
            urlencode(&self.username)
        );
        if let Some(key) = &self.company_key {
            action.push_str("&company-key=");
            action.push_str(key);
        }

        let salt = Self::salt();
        let pwd_hash = sha1_hex(self.password.as_bytes());
        let sign = sha1_hex(format!("{}{}{}", salt, pwd_hash, action).as_bytes());
        let url = format!("{}?sign={}&salt={}{}", self.base_url, sign, salt, action);

        let dat = with_backoff("shinemonitor auth", || self.call_envelope(&url))
            .map_err(|e| match e {
                AdapterError::Business(msg) => AdapterError::Auth(msg),
                other => other,
            })?;

        let secret = dat
            .get("secret")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Auth("auth response missing secret".to_string()))?
            .to_string();
        let token = dat
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Auth("auth response missing token".to_string()))?
            .to_string();

        info!("shinemonitor: authenticated as {}", self.username);
        *guard = Some(Session {
            secret: secret.clone(),
            token: token.clone(),
            obtained: Instant::now(),
        });
        Ok((secret, token))
    }

    /// Signed GET for an already-authenticated action string. The action must
    /// start with `&action=`.
    fn signed_get(&self, action: &str) -> Result<Value, AdapterError> {
        let (secret, token) = self.ensure_session()?;
        let salt = Self::salt();
        let sign = sha1_hex(format!("{}{}{}{}", salt, secret, token, action).as_bytes());
        let url = format!(
            "{}?sign={}&salt={}&token={}{}",
            self.base_url, sign, salt, token, action
        );
        with_backoff("shinemonitor request", || self.call_envelope(&url))
    }

    fn call_envelope(&self, url: &str) -> Result<Value, AdapterError> {
        let body: Value = self
            .agent
            .get(url)
            .call()
            .map_err(classify_ureq)?
            .into_json()
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let err = body.get("err").and_then(Value::as_i64).unwrap_or(-1);
        if err != 0 {
            let desc = body
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(AdapterError::Business(desc));
        }
        Ok(body.get("dat").cloned().unwrap_or(Value::Null))
    }

    pub fn list_plants(&self) -> Result<Vec<PlantRef>, AdapterError> {
        let action = format!("&action=queryPlants&page=0&pagesize={}", PAGE_SIZE);
        let dat = self.signed_get(&action)?;

        let mut plants = Vec::new();
        for plant in dat.get("plant").and_then(Value::as_array).into_iter().flatten() {
            let Some(pid) = scalar_string(plant.get("pid")) else {
                warn!("shinemonitor: plant entry without pid, skipping");
                continue;
            };
            plants.push(PlantRef {
                plant_id: pid,
                name: plant.get("name").and_then(Value::as_str).map(str::to_string),
                capacity_kw: plant.get("nominalPower").and_then(Value::as_f64),
                install_date: plant.get("install").cloned().filter(|v| !v.is_null()),
            });
        }
        Ok(plants)
    }

    pub fn list_devices(&self, plant: &PlantRef) -> Result<Vec<DeviceRef>, AdapterError> {
        let action = format!(
            "&action=queryPlantDevice&plantid={}&page=0&pagesize={}",
            urlencode(&plant.plant_id),
            PAGE_SIZE
        );
        let dat = self.signed_get(&action)?;

        let mut devices = Vec::new();
        for dev in dat.get("device").and_then(Value::as_array).into_iter().flatten() {
            let Some(sn) = scalar_string(dev.get("sn")) else {
                warn!("shinemonitor: device entry without sn, skipping");
                continue;
            };
            devices.push(DeviceRef {
                device_sn: sn,
                inverter_model: dev.get("alias").and_then(Value::as_str).map(str::to_string),
                panel_model: None,
                pv_count: None,
                string_count: None,
                vendor_device_id: None,
                pn: scalar_string(dev.get("pn")),
                devcode: scalar_string(dev.get("devcode")),
                devaddr: scalar_string(dev.get("devaddr")),
            });
        }
        Ok(devices)
    }

    /// Day-by-day fetch over [start, end]. Columns arrive positionally with a
    /// parallel `title` table, so each row is re-keyed by its title text. The
    /// second field of every row is the sample timestamp.
    ///
    /// Day-level cumulative energy is stamped onto each row of its own day
    /// inside `fetch_one_day`; the payload carries no day energy, since one
    /// payload-level value cannot be correct for a multi-day window.
    pub fn fetch_historical(
        &self,
        device: &DeviceRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawPayload, AdapterError> {
        let mut rows: Vec<Value> = Vec::new();
        let mut dry_days = 0u32;
        let mut date = start;

        while date <= end {
            match self.fetch_one_day(device, date) {
                Ok(mut day_rows) => {
                    if day_rows.is_empty() {
                        dry_days += 1;
                    } else {
                        dry_days = 0;
                        rows.append(&mut day_rows);
                    }
                }
                Err(e) if e.is_no_data() => {
                    debug!("shinemonitor: {} has no data on {}", device.device_sn, date);
                    dry_days += 1;
                }
                Err(e) => return Err(e),
            }

            if dry_days >= MAX_CONSECUTIVE_NO_DATA_DAYS {
                info!(
                    "shinemonitor: {} dry for {} consecutive days, stopping at {}",
                    device.device_sn, dry_days, date
                );
                break;
            }
            date += ChronoDuration::days(1);
        }

        Ok(RawPayload {
            rows: Value::Array(rows),
            day_energy_kwh: None,
        })
    }

    fn fetch_one_day(
        &self,
        device: &DeviceRef,
        date: NaiveDate,
    ) -> Result<Vec<Value>, AdapterError> {
        let action = format!(
            "&action=queryDeviceDataOneDay&pn={}&devcode={}&devaddr={}&sn={}&date={}&i18n=en_US",
            urlencode(device.pn.as_deref().unwrap_or("")),
            urlencode(device.devcode.as_deref().unwrap_or("")),
            urlencode(device.devaddr.as_deref().unwrap_or("")),
            urlencode(&device.device_sn),
            date.format("%Y-%m-%d"),
        );
        let dat = self.signed_get(&action)?;

        let titles: Vec<String> = dat
            .get("title")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|t| {
                t.get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect();

        let day_energy = dat.get("energy_today").and_then(Value::as_f64);

        let mut rows = Vec::new();
        for row in dat.get("row").and_then(Value::as_array).into_iter().flatten() {
            let Some(fields) = row.get("field").and_then(Value::as_array) else {
                continue;
            };
            let mut entry = Map::new();
            for (title, field) in titles.iter().zip(fields) {
                if !title.is_empty() {
                    entry.insert(title.clone(), field.clone());
                }
            }
            // Field 1 is the sample time regardless of its column title.
            if let Some(ts) = fields.get(1) {
                entry.insert("timestamp".to_string(), ts.clone());
            }
            if let Some(e) = day_energy {
                entry.insert("energy_today".to_string(), json!(e));
            }
            rows.push(Value::Object(entry));
        }
        Ok(rows)
    }

    /// Latest snapshot: the portal reports it as a flat title/value list.
    pub fn fetch_realtime(&self, device: &DeviceRef) -> Result<RawPayload, AdapterError> {
        let action = format!(
            "&action=queryDeviceLastData&pn={}&devcode={}&devaddr={}&sn={}&i18n=en_US",
            urlencode(device.pn.as_deref().unwrap_or("")),
            urlencode(device.devcode.as_deref().unwrap_or("")),
            urlencode(device.devaddr.as_deref().unwrap_or("")),
            urlencode(&device.device_sn),
        );
        let dat = match self.signed_get(&action) {
            Ok(dat) => dat,
            Err(e) if e.is_no_data() => return Ok(RawPayload::empty()),
            Err(e) => return Err(e),
        };

        let mut entry = Map::new();
        for item in dat.as_array().into_iter().flatten() {
            if let (Some(title), Some(val)) = (item.get("title").and_then(Value::as_str), item.get("val")) {
                entry.insert(title.to_string(), val.clone());
            }
        }
        if entry.is_empty() {
            return Ok(RawPayload::empty());
        }
        entry.insert("timestamp".to_string(), json!(Utc::now().timestamp()));

        Ok(RawPayload {
            rows: Value::Array(vec![Value::Object(entry)]),
            day_energy_kwh: None,
        })
    }
}

pub(crate) fn sha1_hex(input: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Percent-encode for query-string use. Signing happens over the encoded
/// action text, so encoding must be applied before the signature.
pub(crate) fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn scalar_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            sha1_hex(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn urlencode_reserved_characters() {
        assert_eq!(urlencode("user@example.com"), "user%40example.com");
        assert_eq!(urlencode("a b+c"), "a%20b%2Bc");
        assert_eq!(urlencode("plain-01_X.~"), "plain-01_X.~");
    }

    #[test]
    fn scalar_string_accepts_numbers() {
        assert_eq!(scalar_string(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(scalar_string(Some(&json!("sn1"))), Some("sn1".to_string()));
        assert_eq!(scalar_string(Some(&json!(""))), None);
        assert_eq!(scalar_string(Some(&json!(null))), None);
        assert_eq!(scalar_string(None), None);
    }
}
