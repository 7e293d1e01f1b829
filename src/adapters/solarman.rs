//! Solarman Business (SolarmanPV) OpenAPI client.
//!
//! OAuth-style bearer tokens obtained from `/account/v1.0/token` with the
//! app id/secret pair plus the account email and SHA-256 of the password.
//! Data endpoints are plain POSTs with a JSON body; responses carry a
//! `success` flag and `msg`. Historical data comes back already structured
//! as `paramDataList[].dataList[]`, which the flattener folds per sample.

use chrono::{NaiveDate, Utc};
use log::{info, warn};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{classify_ureq, with_backoff, AdapterError};
use crate::models::reading::{DeviceRef, PlantRef, RawPayload};

/// Refresh this long before the vendor-reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(300);

struct Token {
    access_token: String,
    obtained: Instant,
    lifetime: Duration,
}

impl Token {
    fn is_fresh(&self) -> bool {
        let usable = self.lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        self.obtained.elapsed() < usable
    }
}

pub struct SolarmanClient {
    agent: ureq::Agent,
    base_url: String,
    email: String,
    password_sha256: String,
    app_id: String,
    app_secret: String,
    token: Mutex<Option<Token>>,
}

impl SolarmanClient {
    pub fn new(base_url: &str, email: &str, password: &str, app_id: &str, app_secret: &str) -> Self {
        SolarmanClient {
            agent: ureq::AgentBuilder::new()
                .timeout_read(Duration::from_secs(30))
                .timeout_write(Duration::from_secs(30))
                .build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            password_sha256: sha256_hex(password.as_bytes()),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            token: Mutex::new(None),
        }
    }

    fn ensure_token(&self) -> Result<String, AdapterError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| AdapterError::Auth("token lock poisoned".to_string()))?;

        if let Some(t) = guard.as_ref() {
            if t.is_fresh() {
                return Ok(t.access_token.clone());
            }
        }

        let url = format!("{}/account/v1.0/token?appId={}", self.base_url, self.app_id);
        let body = json!({
            "appSecret": self.app_secret,
            "email": self.email,
            "password": self.password_sha256,
        });

        let resp = with_backoff("solarman token", || {
            self.agent
                .post(&url)
                .send_json(body.clone())
                .map_err(classify_ureq)?
                .into_json::<Value>()
                .map_err(|e| AdapterError::Transport(e.to_string()))
        })?;

        if !resp.get("success").and_then(Value::as_bool).unwrap_or(false) {
            let msg = resp
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("token request rejected");
            return Err(AdapterError::Auth(msg.to_string()));
        }

        let access_token = resp
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Auth("token response missing access_token".to_string()))?
            .to_string();
        let lifetime = resp
            .get("expires_in")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| resp.get("expires_in").and_then(Value::as_u64))
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));

        info!("solarman: authenticated as {}", self.email);
        *guard = Some(Token {
            access_token: access_token.clone(),
            obtained: Instant::now(),
            lifetime,
        });
        Ok(access_token)
    }

    fn post(&self, path: &str, body: Value) -> Result<Value, AdapterError> {
        let token = self.ensure_token()?;
        let url = format!("{}{}", self.base_url, path);

        let resp = with_backoff("solarman request", || {
            self.agent
                .post(&url)
                .set("Authorization", &format!("Bearer {}", token))
                .send_json(body.clone())
                .map_err(classify_ureq)?
                .into_json::<Value>()
                .map_err(|e| AdapterError::Transport(e.to_string()))
        })?;

        if !resp.get("success").and_then(Value::as_bool).unwrap_or(false) {
            let msg = resp
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string();
            return Err(AdapterError::Business(msg));
        }
        Ok(resp)
    }

    pub fn list_plants(&self) -> Result<Vec<PlantRef>, AdapterError> {
        let resp = self.post(
            "/station/v1.0/list",
            json!({"page": 1, "size": 200, "language": "en"}),
        )?;

        let mut plants = Vec::new();
        for station in resp
            .get("stationList")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(id) = id_string(station.get("id")) else {
                warn!("solarman: station entry without id, skipping");
                continue;
            };
            plants.push(PlantRef {
                plant_id: id,
                name: station.get("name").and_then(Value::as_str).map(str::to_string),
                capacity_kw: station.get("installedCapacity").and_then(Value::as_f64),
                install_date: station
                    .get("startOperatingTime")
                    .or_else(|| station.get("createdDate"))
                    .cloned()
                    .filter(|v| !v.is_null()),
            });
        }
        Ok(plants)
    }

    pub fn list_devices(&self, plant: &PlantRef) -> Result<Vec<DeviceRef>, AdapterError> {
        let station_id: Value = plant
            .plant_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(plant.plant_id.clone()));
        let resp = self.post(
            "/station/v1.0/device",
            json!({"stationId": station_id, "deviceType": "INVERTER"}),
        )?;

        let mut devices = Vec::new();
        for dev in resp
            .get("deviceListItems")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(sn) = dev.get("deviceSn").and_then(Value::as_str) else {
                warn!("solarman: device entry without deviceSn, skipping");
                continue;
            };
            devices.push(DeviceRef {
                device_sn: sn.to_string(),
                inverter_model: dev.get("deviceType").and_then(Value::as_str).map(str::to_string),
                panel_model: None,
                pv_count: None,
                string_count: None,
                vendor_device_id: id_string(dev.get("deviceId")),
                pn: None,
                devcode: None,
                devaddr: None,
            });
        }
        Ok(devices)
    }

    /// One call covers the whole window; `timeType: 1` selects the raw
    /// five-minute sample granularity.
    pub fn fetch_historical(
        &self,
        device: &DeviceRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawPayload, AdapterError> {
        let resp = match self.post(
            "/device/v1.0/historical",
            json!({
                "deviceSn": device.device_sn,
                "startTime": start.format("%Y-%m-%d").to_string(),
                "endTime": end.format("%Y-%m-%d").to_string(),
                "timeType": 1,
            }),
        ) {
            Ok(resp) => resp,
            Err(e) if e.is_no_data() => return Ok(RawPayload::empty()),
            Err(e) => return Err(e),
        };

        let rows = resp
            .get("paramDataList")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(RawPayload {
            rows,
            day_energy_kwh: None,
        })
    }

    /// Current snapshot, reshaped into a single historical-style sample so
    /// the rest of the pipeline sees one row format.
    pub fn fetch_realtime(&self, device: &DeviceRef) -> Result<RawPayload, AdapterError> {
        let resp = match self.post(
            "/device/v1.0/currentData",
            json!({"deviceSn": device.device_sn}),
        ) {
            Ok(resp) => resp,
            Err(e) if e.is_no_data() => return Ok(RawPayload::empty()),
            Err(e) => return Err(e),
        };

        let data_list = resp
            .get("dataList")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if data_list.is_empty() {
            return Ok(RawPayload::empty());
        }

        let collect_time = resp
            .get("collectionTime")
            .cloned()
            .unwrap_or_else(|| json!(Utc::now().timestamp()));
        Ok(RawPayload {
            rows: json!([{"collectTime": collect_time, "dataList": data_list}]),
            day_energy_kwh: None,
        })
    }
}

fn sha256_hex(input: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

fn id_string(v: Option<&Value>) -> Option<String> {
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
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn token_freshness_accounts_for_margin() {
        let t = Token {
            access_token: "x".to_string(),
            obtained: Instant::now(),
            lifetime: Duration::from_secs(200),
        };
        // Lifetime shorter than the margin counts as already stale.
        assert!(!t.is_fresh());

        let t = Token {
            access_token: "x".to_string(),
            obtained: Instant::now(),
            lifetime: Duration::from_secs(3600),
        };
        assert!(t.is_fresh());
    }

    #[test]
    fn id_string_from_numeric_station_id() {
        assert_eq!(id_string(Some(&json!(123456))), Some("123456".to_string()));
        assert_eq!(id_string(Some(&json!("abc"))), Some("abc".to_string()));
        assert_eq!(id_string(Some(&json!(null))), None);
    }
}
