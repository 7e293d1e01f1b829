//! Diesel model structs for reference data and time-series rows.
//!
//! Migrations set up a TimescaleDB hypertable for `device_data_historical`;
//! the per-customer real-time tables share its column layout and are created
//! at runtime (see `services::ingest`).

use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;

use crate::models::reading::CanonicalReading;
use crate::schema;

/// One credential row: the identity used against one vendor API on behalf of
/// one customer. Loaded once per run, immutable for the run's duration.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = schema::api_credentials)]
pub struct Credential {
    pub user_id: String,
    pub customer_id: String,
    pub api_provider: String,
    pub username: String,
    pub password: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::api_credentials)]
pub struct NewCredential {
    pub user_id: String,
    pub customer_id: String,
    pub api_provider: String,
    pub username: String,
    pub password: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::customers)]
pub struct NewCustomer {
    pub customer_id: String,
    pub customer_name: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::plants)]
pub struct NewPlant {
    pub plant_id: String,
    pub customer_id: String,
    pub plant_name: Option<String>,
    pub capacity_kw: Option<f64>,
    pub install_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub device_sn: String,
    pub plant_id: String,
    pub inverter_model: Option<String>,
    pub panel_model: Option<String>,
    pub pv_count: Option<i32>,
    pub string_count: Option<i32>,
    pub first_install_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::validation_errors)]
pub struct NewValidationError {
    pub customer_id: String,
    pub device_sn: String,
    pub api_provider: String,
    pub field_name: String,
    pub field_value: Option<String>,
    pub error_message: String,
}

// Hypertable: device_data_historical
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::device_data_historical)]
pub struct NewDeviceReading {
    pub device_sn: String,
    pub timestamp: DateTime<Utc>,
    pub pv01_voltage: Option<f64>,
    pub pv01_current: Option<f64>,
    pub pv02_voltage: Option<f64>,
    pub pv02_current: Option<f64>,
    pub pv03_voltage: Option<f64>,
    pub pv03_current: Option<f64>,
    pub pv04_voltage: Option<f64>,
    pub pv04_current: Option<f64>,
    pub pv05_voltage: Option<f64>,
    pub pv05_current: Option<f64>,
    pub pv06_voltage: Option<f64>,
    pub pv06_current: Option<f64>,
    pub pv07_voltage: Option<f64>,
    pub pv07_current: Option<f64>,
    pub pv08_voltage: Option<f64>,
    pub pv08_current: Option<f64>,
    pub pv09_voltage: Option<f64>,
    pub pv09_current: Option<f64>,
    pub pv10_voltage: Option<f64>,
    pub pv10_current: Option<f64>,
    pub pv11_voltage: Option<f64>,
    pub pv11_current: Option<f64>,
    pub pv12_voltage: Option<f64>,
    pub pv12_current: Option<f64>,
    pub r_voltage: Option<f64>,
    pub s_voltage: Option<f64>,
    pub t_voltage: Option<f64>,
    pub r_current: Option<f64>,
    pub s_current: Option<f64>,
    pub t_current: Option<f64>,
    pub rs_voltage: Option<f64>,
    pub st_voltage: Option<f64>,
    pub tr_voltage: Option<f64>,
    pub frequency: Option<f64>,
    pub total_power: Option<f64>,
    pub reactive_power: Option<f64>,
    pub energy_today: Option<f64>,
    pub cuf: Option<f64>,
    pub pr: Option<f64>,
    pub state: Option<String>,
}

impl From<&CanonicalReading> for NewDeviceReading {
    fn from(r: &CanonicalReading) -> Self {
        let ch = &r.channels;
        NewDeviceReading {
            device_sn: r.device_sn.clone(),
            timestamp: r.timestamp,
            pv01_voltage: ch.pv01_voltage,
            pv01_current: ch.pv01_current,
            pv02_voltage: ch.pv02_voltage,
            pv02_current: ch.pv02_current,
            pv03_voltage: ch.pv03_voltage,
            pv03_current: ch.pv03_current,
            pv04_voltage: ch.pv04_voltage,
            pv04_current: ch.pv04_current,
            pv05_voltage: ch.pv05_voltage,
            pv05_current: ch.pv05_current,
            pv06_voltage: ch.pv06_voltage,
            pv06_current: ch.pv06_current,
            pv07_voltage: ch.pv07_voltage,
            pv07_current: ch.pv07_current,
            pv08_voltage: ch.pv08_voltage,
            pv08_current: ch.pv08_current,
            pv09_voltage: ch.pv09_voltage,
            pv09_current: ch.pv09_current,
            pv10_voltage: ch.pv10_voltage,
            pv10_current: ch.pv10_current,
            pv11_voltage: ch.pv11_voltage,
            pv11_current: ch.pv11_current,
            pv12_voltage: ch.pv12_voltage,
            pv12_current: ch.pv12_current,
            r_voltage: ch.r_voltage,
            s_voltage: ch.s_voltage,
            t_voltage: ch.t_voltage,
            r_current: ch.r_current,
            s_current: ch.s_current,
            t_current: ch.t_current,
            rs_voltage: ch.rs_voltage,
            st_voltage: ch.st_voltage,
            tr_voltage: ch.tr_voltage,
            frequency: ch.frequency,
            total_power: ch.total_power,
            reactive_power: ch.reactive_power,
            energy_today: ch.energy_today,
            cuf: ch.cuf,
            pr: ch.pr,
            state: ch.state.clone(),
        }
    }
}
