//! Mapped-row normalization: resolve timestamps, apply defaults, drop
//! signal-free samples.

use log::debug;

use crate::models::reading::{CanonicalReading, MappedReading};
use crate::services::validate::Violation;
use crate::utils::parse_timestamp;

#[derive(Debug, Default, PartialEq)]
pub struct NormalizeStats {
    pub produced: usize,
    pub dropped_empty: usize,
    pub dropped_bad_timestamp: usize,
}

/// Turn mapped rows into canonical readings for one device.
///
/// Samples without a resolvable UTC timestamp are dropped and reported as a
/// violation; samples with no numeric signal at all are dropped silently.
/// `state` defaults to "unknown" and a missing per-sample `energy_today`
/// falls back to the payload-level day value when the vendor supplied one.
pub fn normalize(
    device_sn: &str,
    mapped: Vec<MappedReading>,
    day_energy_kwh: Option<f64>,
) -> (Vec<CanonicalReading>, Vec<Violation>, NormalizeStats) {
    let mut readings = Vec::with_capacity(mapped.len());
    let mut violations = Vec::new();
    let mut stats = NormalizeStats::default();

    for m in mapped {
        let mut channels = m.channels;

        if channels.energy_today.is_none() {
            channels.energy_today = day_energy_kwh;
        }
        if !channels.has_signal() {
            stats.dropped_empty += 1;
            continue;
        }
        if channels.state.is_none() {
            channels.state = Some("unknown".to_string());
        }

        let timestamp = match m.raw_timestamp.as_ref().map(parse_timestamp) {
            Some(Ok(ts)) => ts,
            Some(Err(e)) => {
                debug!("{}: dropping sample, {}", device_sn, e);
                stats.dropped_bad_timestamp += 1;
                violations.push(Violation {
                    field: "timestamp".to_string(),
                    value: Some(e.raw),
                    message: "unparseable timestamp".to_string(),
                });
                continue;
            }
            None => {
                stats.dropped_bad_timestamp += 1;
                violations.push(Violation {
                    field: "timestamp".to_string(),
                    value: None,
                    message: "missing timestamp".to_string(),
                });
                continue;
            }
        };

        readings.push(CanonicalReading {
            device_sn: device_sn.to_string(),
            timestamp,
            channels,
        });
    }

    stats.produced = readings.len();
    (readings, violations, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::reading::ChannelSet;
    use serde_json::json;

    fn mapped(ts: Option<serde_json::Value>, f: impl FnOnce(&mut ChannelSet)) -> MappedReading {
        let mut channels = ChannelSet::default();
        f(&mut channels);
        MappedReading { raw_timestamp: ts, channels }
    }

    #[test]
    fn millisecond_and_second_timestamps_resolve_identically() {
        let rows = vec![
            mapped(Some(json!(1_718_000_000_000_i64)), |c| c.frequency = Some(50.0)),
            mapped(Some(json!(1_718_000_060_i64)), |c| c.frequency = Some(50.1)),
        ];
        let (readings, violations, stats) = normalize("SN1", rows, None);
        assert!(violations.is_empty());
        assert_eq!(stats.produced, 2);
        assert_eq!(readings[0].timestamp.timestamp(), 1_718_000_000);
        assert_eq!(readings[1].timestamp.timestamp(), 1_718_000_060);
    }

    #[test]
    fn state_defaults_to_unknown() {
        let rows = vec![mapped(Some(json!(1_718_000_000_i64)), |c| {
            c.total_power = Some(1.0)
        })];
        let (readings, _, _) = normalize("SN1", rows, None);
        assert_eq!(readings[0].channels.state.as_deref(), Some("unknown"));
    }

    #[test]
    fn day_energy_fallback_only_fills_missing() {
        let rows = vec![
            mapped(Some(json!(1_718_000_000_i64)), |c| c.total_power = Some(1.0)),
            mapped(Some(json!(1_718_000_060_i64)), |c| {
                c.total_power = Some(1.0);
                c.energy_today = Some(3.3);
            }),
        ];
        let (readings, _, _) = normalize("SN1", rows, Some(9.9));
        assert_eq!(readings[0].channels.energy_today, Some(9.9));
        assert_eq!(readings[1].channels.energy_today, Some(3.3));
    }

    #[test]
    fn signal_free_samples_are_dropped_silently() {
        let rows = vec![mapped(Some(json!(1_718_000_000_i64)), |c| {
            c.state = Some("Alarm".to_string())
        })];
        let (readings, violations, stats) = normalize("SN1", rows, None);
        assert!(readings.is_empty());
        assert!(violations.is_empty());
        assert_eq!(stats.dropped_empty, 1);
    }

    #[test]
    fn unparseable_timestamp_is_dropped_with_violation() {
        let rows = vec![
            mapped(Some(json!("yesterday-ish")), |c| c.frequency = Some(50.0)),
            mapped(None, |c| c.frequency = Some(50.0)),
        ];
        let (readings, violations, stats) = normalize("SN1", rows, None);
        assert!(readings.is_empty());
        assert_eq!(stats.dropped_bad_timestamp, 2);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].field, "timestamp");
        assert_eq!(violations[1].value, None);
    }
}
