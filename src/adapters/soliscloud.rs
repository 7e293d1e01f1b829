//! SolisCloud (Ginlong) platform client.
//!
//! Requests are JSON POSTs signed with HMAC-SHA1 over `path + timestamp +
//! body` using the API secret, sent as `Authorization: API <key>:<hex sig>`
//! together with an epoch-seconds `Timestamp` header. The platform rate-limits
//! aggressively, so consecutive requests are spaced out client-side.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde_json::{json, Value};
use sha1::Sha1;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::{classify_ureq, with_backoff, AdapterError, MAX_CONSECUTIVE_NO_DATA_DAYS};
use crate::models::reading::{DeviceRef, PlantRef, RawPayload};

/// Minimum spacing between requests; the documented limit is roughly two
/// requests per second per endpoint.
const REQUEST_SPACING: Duration = Duration::from_millis(600);
const PAGE_SIZE: u32 = 100;

pub struct SoliscloudClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    api_secret: String,
    user_id: String,
    last_request: Mutex<Option<Instant>>,
}

impl SoliscloudClient {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str, user_id: &str) -> Self {
        SoliscloudClient {
            agent: ureq::AgentBuilder::new()
                .timeout_read(Duration::from_secs(30))
                .timeout_write(Duration::from_secs(30))
                .build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            user_id: user_id.to_string(),
            last_request: Mutex::new(None),
        }
    }

    fn pace(&self) {
        if let Ok(mut guard) = self.last_request.lock() {
            if let Some(last) = *guard {
                let elapsed = last.elapsed();
                if elapsed < REQUEST_SPACING {
                    thread::sleep(REQUEST_SPACING - elapsed);
                }
            }
            *guard = Some(Instant::now());
        }
    }

    fn post(&self, path: &str, body: Value) -> Result<Value, AdapterError> {
        let body_text = body.to_string();
        let url = format!("{}{}", self.base_url, path);

        let resp = with_backoff("soliscloud request", || {
            self.pace();
            let timestamp = signing_timestamp();
            let signature = hmac_sha1_hex(
                self.api_secret.as_bytes(),
                format!("{}{}{}", path, timestamp, body_text).as_bytes(),
            );
            self.agent
                .post(&url)
                .set("Content-Type", "application/json")
                .set("Authorization", &format!("API {}:{}", self.api_key, signature))
                .set("Timestamp", &timestamp)
                .send_string(&body_text)
                .map_err(classify_ureq)?
                .into_json::<Value>()
                .map_err(|e| AdapterError::Transport(e.to_string()))
        })?;

        let success = resp.get("success").and_then(Value::as_bool).unwrap_or(false)
            || resp.get("code").and_then(Value::as_str) == Some("0");
        if !success {
            let msg = resp
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string();
            return Err(AdapterError::Business(msg));
        }
        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    }

    pub fn list_plants(&self) -> Result<Vec<PlantRef>, AdapterError> {
        let data = self.post(
            "/v1/api/userStationList",
            json!({"userId": self.user_id, "pageNo": 1, "pageSize": PAGE_SIZE}),
        )?;

        let mut plants = Vec::new();
        for station in page_records(&data).into_iter().flatten() {
            let Some(id) = id_string(station.get("id")) else {
                warn!("soliscloud: station entry without id, skipping");
                continue;
            };
            plants.push(PlantRef {
                plant_id: id,
                name: station
                    .get("stationName")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                capacity_kw: station.get("capacity").and_then(Value::as_f64),
                install_date: station
                    .get("createDate")
                    .cloned()
                    .filter(|v| !v.is_null()),
            });
        }
        Ok(plants)
    }

    pub fn list_devices(&self, plant: &PlantRef) -> Result<Vec<DeviceRef>, AdapterError> {
        let data = self.post(
            "/v1/api/inverterList",
            json!({"stationId": plant.plant_id, "pageNo": 1, "pageSize": PAGE_SIZE}),
        )?;

        let mut devices = Vec::new();
        for inv in page_records(&data).into_iter().flatten() {
            let Some(sn) = inv.get("sn").and_then(Value::as_str) else {
                warn!("soliscloud: inverter entry without sn, skipping");
                continue;
            };
            devices.push(DeviceRef {
                device_sn: sn.to_string(),
                inverter_model: inv
                    .get("machine")
                    .or_else(|| inv.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                panel_model: None,
                pv_count: None,
                string_count: None,
                vendor_device_id: id_string(inv.get("id")),
                pn: None,
                devcode: None,
                devaddr: None,
            });
        }
        Ok(devices)
    }

    /// Day-by-day: `/v1/api/inverterDay` serves a single calendar day of
    /// five-minute samples per call.
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
            let day = match self.fetch_one_day(device, date) {
                Ok(day) => day,
                Err(e) if e.is_no_data() => Vec::new(),
                Err(e) => return Err(e),
            };

            if day.is_empty() {
                debug!("soliscloud: {} has no data on {}", device.device_sn, date);
                dry_days += 1;
            } else {
                dry_days = 0;
                rows.extend(day);
            }

            if dry_days >= MAX_CONSECUTIVE_NO_DATA_DAYS {
                info!(
                    "soliscloud: {} dry for {} consecutive days, stopping at {}",
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

    fn fetch_one_day(&self, device: &DeviceRef, date: NaiveDate) -> Result<Vec<Value>, AdapterError> {
        let data = self.post(
            "/v1/api/inverterDay",
            json!({
                "id": device.vendor_device_id,
                "sn": device.device_sn,
                "time": date.format("%Y-%m-%d").to_string(),
                "timeZone": 0,
            }),
        )?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    pub fn fetch_realtime(&self, device: &DeviceRef) -> Result<RawPayload, AdapterError> {
        let data = match self.post(
            "/v1/api/inverterDetail",
            json!({"id": device.vendor_device_id, "sn": device.device_sn}),
        ) {
            Ok(data) => data,
            Err(e) if e.is_no_data() => return Ok(RawPayload::empty()),
            Err(e) => return Err(e),
        };

        if data.is_null() {
            return Ok(RawPayload::empty());
        }
        Ok(RawPayload {
            rows: Value::Array(vec![data]),
            day_energy_kwh: None,
        })
    }
}

/// Platform signatures are computed over epoch seconds, not milliseconds;
/// the `Timestamp` header must carry the exact value that was signed.
fn signing_timestamp() -> String {
    Utc::now().timestamp().to_string()
}

fn hmac_sha1_hex(key: &[u8], message: &[u8]) -> String {
    // HMAC can take a key of any length.
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// List payloads arrive either paged (`page.records`) or as a flat
/// `stationList`/`inverterList` array depending on endpoint version.
fn page_records(data: &Value) -> Option<&Vec<Value>> {
    data.get("page")
        .and_then(|p| p.get("records"))
        .and_then(Value::as_array)
        .or_else(|| data.get("stationList").and_then(Value::as_array))
        .or_else(|| data.get("inverterList").and_then(Value::as_array))
        .or_else(|| data.as_array())
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
    fn hmac_sha1_known_vector() {
        // RFC 2202 test case 2.
        assert_eq!(
            hmac_sha1_hex(b"Jefe", b"what do ya want for nothing?"),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[test]
    fn signing_timestamp_is_epoch_seconds() {
        let ts = signing_timestamp();
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
        // Seconds since 2001, not the 13-digit millisecond form.
        let value: i64 = ts.parse().unwrap();
        assert!(value > 1_000_000_000 && value < 10_000_000_000);
    }

    #[test]
    fn page_records_handles_both_shapes() {
        let paged = json!({"page": {"records": [{"id": 1}]}});
        assert_eq!(page_records(&paged).map(|r| r.len()), Some(1));

        let flat = json!({"stationList": [{"id": 1}, {"id": 2}]});
        assert_eq!(page_records(&flat).map(|r| r.len()), Some(2));

        let bare = json!([{"id": 3}]);
        assert_eq!(page_records(&bare).map(|r| r.len()), Some(1));

        assert!(page_records(&json!({})).is_none());
    }
}
