//! Canonical, vendor-independent telemetry types.
//!
//! Every vendor payload is mapped into [`ChannelSet`] / [`CanonicalReading`]
//! before validation and persistence. All channels are independently
//! nullable; a reading carrying no numeric signal at all is never written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three supported monitoring-portal vendors. Adapter selection is a
/// closed enum decided once per credential at run start.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Shinemonitor,
    Solarman,
    Soliscloud,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Shinemonitor => "shinemonitor",
            Vendor::Solarman => "solarman",
            Vendor::Soliscloud => "soliscloud",
        }
    }

    /// Credential rows carry the provider as free text; unknown providers
    /// fall back to ShineMonitor like the credential loader always has.
    pub fn from_provider(provider: &str) -> Vendor {
        match provider.trim().to_ascii_lowercase().as_str() {
            "soliscloud" => Vendor::Soliscloud,
            "solarman" => Vendor::Solarman,
            _ => Vendor::Shinemonitor,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plant as reported by a vendor list endpoint.
#[derive(Debug, Clone)]
pub struct PlantRef {
    pub plant_id: String,
    pub name: Option<String>,
    pub capacity_kw: Option<f64>,
    /// Raw install date as delivered: epoch seconds/millis or a date string.
    pub install_date: Option<serde_json::Value>,
}

/// A device (inverter/collector) within a plant. The extra ShineMonitor
/// addressing fields ride along because its data endpoint needs them.
#[derive(Debug, Clone)]
pub struct DeviceRef {
    pub device_sn: String,
    pub inverter_model: Option<String>,
    pub panel_model: Option<String>,
    pub pv_count: Option<i32>,
    pub string_count: Option<i32>,
    /// SolisCloud internal inverter id.
    pub vendor_device_id: Option<String>,
    /// ShineMonitor collector addressing (pn, devcode, devaddr).
    pub pn: Option<String>,
    pub devcode: Option<String>,
    pub devaddr: Option<String>,
}

/// One raw fetch result: vendor-shaped JSON rows plus the payload-level
/// day cumulative energy some vendors report once per day instead of per
/// sample.
#[derive(Debug, Clone, Default)]
pub struct RawPayload {
    pub rows: serde_json::Value,
    pub day_energy_kwh: Option<f64>,
}

impl RawPayload {
    pub fn empty() -> RawPayload {
        RawPayload {
            rows: serde_json::Value::Array(Vec::new()),
            day_energy_kwh: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.rows {
            serde_json::Value::Array(items) => items.is_empty(),
            serde_json::Value::Null => true,
            _ => false,
        }
    }
}

pub const PV_CHANNEL_MAX: u32 = 12;

/// Canonical numeric channel names in persistence order. `state` is the
/// only non-numeric channel and always comes last in SQL column lists.
pub const NUMERIC_CHANNELS: [&str; 39] = [
    "pv01_voltage",
    "pv01_current",
    "pv02_voltage",
    "pv02_current",
    "pv03_voltage",
    "pv03_current",
    "pv04_voltage",
    "pv04_current",
    "pv05_voltage",
    "pv05_current",
    "pv06_voltage",
    "pv06_current",
    "pv07_voltage",
    "pv07_current",
    "pv08_voltage",
    "pv08_current",
    "pv09_voltage",
    "pv09_current",
    "pv10_voltage",
    "pv10_current",
    "pv11_voltage",
    "pv11_current",
    "pv12_voltage",
    "pv12_current",
    "r_voltage",
    "s_voltage",
    "t_voltage",
    "r_current",
    "s_current",
    "t_current",
    "rs_voltage",
    "st_voltage",
    "tr_voltage",
    "frequency",
    "total_power",
    "reactive_power",
    "energy_today",
    "cuf",
    "pr",
];

/// Fixed schema for every physical channel the pipeline knows about.
/// Absent channels are explicit `None`, never a previous record's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSet {
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

impl ChannelSet {
    /// Set a numeric channel by canonical column name. Returns false for an
    /// unknown name so mapper tables cannot silently misspell a channel.
    pub fn set_numeric(&mut self, field: &str, value: f64) -> bool {
        match self.numeric_slot_mut(field) {
            Some(slot) => {
                *slot = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn get_numeric(&self, field: &str) -> Option<f64> {
        self.numeric_fields().iter().find(|(name, _)| *name == field).and_then(|(_, v)| *v)
    }

    fn numeric_slot_mut(&mut self, field: &str) -> Option<&mut Option<f64>> {
        self.numeric_fields_mut().into_iter().find(|(name, _)| *name == field).map(|(_, slot)| slot)
    }

    /// Any numeric channel populated. Readings without signal are dropped,
    /// `state` alone does not count.
    pub fn has_signal(&self) -> bool {
        self.numeric_fields().iter().any(|(_, v)| v.is_some())
    }

    pub fn numeric_fields(&self) -> [(&'static str, Option<f64>); 39] {
        [
            ("pv01_voltage", self.pv01_voltage),
            ("pv01_current", self.pv01_current),
            ("pv02_voltage", self.pv02_voltage),
            ("pv02_current", self.pv02_current),
            ("pv03_voltage", self.pv03_voltage),
            ("pv03_current", self.pv03_current),
            ("pv04_voltage", self.pv04_voltage),
            ("pv04_current", self.pv04_current),
            ("pv05_voltage", self.pv05_voltage),
            ("pv05_current", self.pv05_current),
            ("pv06_voltage", self.pv06_voltage),
            ("pv06_current", self.pv06_current),
            ("pv07_voltage", self.pv07_voltage),
            ("pv07_current", self.pv07_current),
            ("pv08_voltage", self.pv08_voltage),
            ("pv08_current", self.pv08_current),
            ("pv09_voltage", self.pv09_voltage),
            ("pv09_current", self.pv09_current),
            ("pv10_voltage", self.pv10_voltage),
            ("pv10_current", self.pv10_current),
            ("pv11_voltage", self.pv11_voltage),
            ("pv11_current", self.pv11_current),
            ("pv12_voltage", self.pv12_voltage),
            ("pv12_current", self.pv12_current),
            ("r_voltage", self.r_voltage),
            ("s_voltage", self.s_voltage),
            ("t_voltage", self.t_voltage),
            ("r_current", self.r_current),
            ("s_current", self.s_current),
            ("t_current", self.t_current),
            ("rs_voltage", self.rs_voltage),
            ("st_voltage", self.st_voltage),
            ("tr_voltage", self.tr_voltage),
            ("frequency", self.frequency),
            ("total_power", self.total_power),
            ("reactive_power", self.reactive_power),
            ("energy_today", self.energy_today),
            ("cuf", self.cuf),
            ("pr", self.pr),
        ]
    }

    pub fn numeric_fields_mut(&mut self) -> [(&'static str, &mut Option<f64>); 39] {
        [
            ("pv01_voltage", &mut self.pv01_voltage),
            ("pv01_current", &mut self.pv01_current),
            ("pv02_voltage", &mut self.pv02_voltage),
            ("pv02_current", &mut self.pv02_current),
            ("pv03_voltage", &mut self.pv03_voltage),
            ("pv03_current", &mut self.pv03_current),
            ("pv04_voltage", &mut self.pv04_voltage),
            ("pv04_current", &mut self.pv04_current),
            ("pv05_voltage", &mut self.pv05_voltage),
            ("pv05_current", &mut self.pv05_current),
            ("pv06_voltage", &mut self.pv06_voltage),
            ("pv06_current", &mut self.pv06_current),
            ("pv07_voltage", &mut self.pv07_voltage),
            ("pv07_current", &mut self.pv07_current),
            ("pv08_voltage", &mut self.pv08_voltage),
            ("pv08_current", &mut self.pv08_current),
            ("pv09_voltage", &mut self.pv09_voltage),
            ("pv09_current", &mut self.pv09_current),
            ("pv10_voltage", &mut self.pv10_voltage),
            ("pv10_current", &mut self.pv10_current),
            ("pv11_voltage", &mut self.pv11_voltage),
            ("pv11_current", &mut self.pv11_current),
            ("pv12_voltage", &mut self.pv12_voltage),
            ("pv12_current", &mut self.pv12_current),
            ("r_voltage", &mut self.r_voltage),
            ("s_voltage", &mut self.s_voltage),
            ("t_voltage", &mut self.t_voltage),
            ("r_current", &mut self.r_current),
            ("s_current", &mut self.s_current),
            ("t_current", &mut self.t_current),
            ("rs_voltage", &mut self.rs_voltage),
            ("st_voltage", &mut self.st_voltage),
            ("tr_voltage", &mut self.tr_voltage),
            ("frequency", &mut self.frequency),
            ("total_power", &mut self.total_power),
            ("reactive_power", &mut self.reactive_power),
            ("energy_today", &mut self.energy_today),
            ("cuf", &mut self.cuf),
            ("pr", &mut self.pr),
        ]
    }
}

/// The mapper's output: channels the vendor actually reported plus the raw
/// timestamp field, before normalization resolves it.
#[derive(Debug, Clone, Default)]
pub struct MappedReading {
    pub raw_timestamp: Option<serde_json::Value>,
    pub channels: ChannelSet,
}

/// One validated telemetry sample for one device at one instant. Natural key
/// is `(device_sn, timestamp)`; rows are append-only and idempotent on
/// conflict.
#[derive(Debug, Clone)]
pub struct CanonicalReading {
    pub device_sn: String,
    pub timestamp: DateTime<Utc>,
    pub channels: ChannelSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_numeric_rejects_unknown_channel() {
        let mut ch = ChannelSet::default();
        assert!(ch.set_numeric("pv01_voltage", 350.5));
        assert_eq!(ch.pv01_voltage, Some(350.5));
        assert!(!ch.set_numeric("pv13_voltage", 1.0));
        assert!(!ch.set_numeric("pv01_volts", 1.0));
    }

    #[test]
    fn has_signal_ignores_state() {
        let mut ch = ChannelSet::default();
        ch.state = Some("unknown".to_string());
        assert!(!ch.has_signal());
        ch.frequency = Some(50.0);
        assert!(ch.has_signal());
    }

    #[test]
    fn channel_constant_matches_field_table() {
        let ch = ChannelSet::default();
        let names: Vec<&str> = ch.numeric_fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, NUMERIC_CHANNELS);
    }

    #[test]
    fn vendor_provider_fallback() {
        assert_eq!(Vendor::from_provider("SolisCloud"), Vendor::Soliscloud);
        assert_eq!(Vendor::from_provider("solarman"), Vendor::Solarman);
        assert_eq!(Vendor::from_provider("anything-else"), Vendor::Shinemonitor);
    }
}
