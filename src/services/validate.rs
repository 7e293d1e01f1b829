//! Physical plausibility validation.
//!
//! Each channel with a known physical range is checked inclusively; a value
//! outside its range is nulled and recorded as a violation rather than
//! failing the sample. A sample left with no numeric signal after nulling is
//! dropped entirely.

use crate::models::reading::CanonicalReading;

/// One rejected field value, destined for the validation_errors table once
/// the caller attaches device and customer context.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub field: String,
    pub value: Option<String>,
    pub message: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct ValidateStats {
    pub nulled: usize,
    pub dropped_empty: usize,
}

/// Inclusive physical bounds per channel. Channels without an entry
/// (line voltages, cuf) pass through unvalidated.
fn range_for(field: &str) -> Option<(f64, f64)> {
    if field.starts_with("pv") {
        if field.ends_with("_voltage") {
            return Some((0.0, 1000.0));
        }
        if field.ends_with("_current") {
            return Some((0.0, 50.0));
        }
    }
    match field {
        "r_voltage" | "s_voltage" | "t_voltage" => Some((0.0, 300.0)),
        "r_current" | "s_current" | "t_current" => Some((0.0, 100.0)),
        "total_power" => Some((0.0, 100_000.0)),
        "energy_today" => Some((0.0, 1000.0)),
        "pr" => Some((0.0, 100.0)),
        "frequency" => Some((0.0, 70.0)),
        "reactive_power" => Some((-100_000.0, 100_000.0)),
        _ => None,
    }
}

/// Validate readings in place. Returns the surviving readings plus every
/// violation encountered; a violation never discards the other channels of
/// its sample.
pub fn validate(
    readings: Vec<CanonicalReading>,
) -> (Vec<CanonicalReading>, Vec<Violation>, ValidateStats) {
    let mut out = Vec::with_capacity(readings.len());
    let mut violations = Vec::new();
    let mut stats = ValidateStats::default();

    for mut reading in readings {
        for (field, slot) in reading.channels.numeric_fields_mut() {
            let Some(value) = *slot else { continue };
            let Some((min, max)) = range_for(field) else { continue };
            if !value.is_finite() || value < min || value > max {
                violations.push(Violation {
                    field: field.to_string(),
                    value: Some(format_value(value)),
                    message: format!("out of range [{}, {}]", min, max),
                });
                *slot = None;
                stats.nulled += 1;
            }
        }

        if reading.channels.has_signal() {
            out.push(reading);
        } else {
            stats.dropped_empty += 1;
        }
    }

    (out, violations, stats)
}

fn format_value(v: f64) -> String {
    if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reading::ChannelSet;
    use chrono::{TimeZone, Utc};

    fn reading(f: impl FnOnce(&mut ChannelSet)) -> CanonicalReading {
        let mut channels = ChannelSet::default();
        f(&mut channels);
        CanonicalReading {
            device_sn: "SN1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 10, 6, 0, 0).unwrap(),
            channels,
        }
    }

    #[test]
    fn bounds_are_inclusive() {
        let (out, violations, stats) = validate(vec![reading(|c| {
            c.pv01_voltage = Some(1000.0);
            c.frequency = Some(0.0);
        })]);
        assert!(violations.is_empty());
        assert_eq!(stats.nulled, 0);
        assert_eq!(out[0].channels.pv01_voltage, Some(1000.0));
    }

    #[test]
    fn out_of_range_is_nulled_not_fatal() {
        let (out, violations, stats) = validate(vec![reading(|c| {
            c.pv01_voltage = Some(1000.01);
            c.total_power = Some(4000.0);
        })]);
        assert_eq!(stats.nulled, 1);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "pv01_voltage");
        assert_eq!(out[0].channels.pv01_voltage, None);
        assert_eq!(out[0].channels.total_power, Some(4000.0));
    }

    #[test]
    fn negative_reactive_power_is_allowed() {
        let (out, violations, _) = validate(vec![reading(|c| {
            c.reactive_power = Some(-5000.0);
        })]);
        assert!(violations.is_empty());
        assert_eq!(out[0].channels.reactive_power, Some(-5000.0));
    }

    #[test]
    fn sample_with_only_invalid_channels_is_dropped() {
        let (out, violations, stats) = validate(vec![reading(|c| {
            c.frequency = Some(999.0);
        })]);
        assert!(out.is_empty());
        assert_eq!(violations.len(), 1);
        assert_eq!(stats.dropped_empty, 1);
    }

    #[test]
    fn nan_is_rejected() {
        let (out, violations, _) = validate(vec![reading(|c| {
            c.frequency = Some(f64::NAN);
            c.total_power = Some(10.0);
        })]);
        assert_eq!(violations.len(), 1);
        assert_eq!(out[0].channels.frequency, None);
    }

    #[test]
    fn unbounded_channels_pass_through() {
        let (out, violations, _) = validate(vec![reading(|c| {
            c.rs_voltage = Some(405.0);
            c.cuf = Some(17.3);
        })]);
        assert!(violations.is_empty());
        assert_eq!(out[0].channels.rs_voltage, Some(405.0));
    }
}
