//! Per-credential orchestration.
//!
//! One credential selects one vendor adapter and one customer. Discovery
//! registers plants and devices, then each device's payload moves through
//! the pipeline: fetch, flatten, map, normalize, validate, write. Fetches
//! fan out over a small worker pool because vendor calls dominate wall time;
//! everything touching the database stays on the caller's thread.

use chrono::{Duration as ChronoDuration, Utc};
use crossbeam_channel::unbounded;
use diesel::PgConnection;
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

use crate::adapters::{AdapterError, FetchKind, VendorAdapter};
use crate::config::Config;
use crate::db::models::{Credential, NewValidationError};
use crate::models::reading::{CanonicalReading, DeviceRef, RawPayload, Vendor};
use crate::services::flatten::{flatten_payload, FlattenStats};
use crate::services::ingest;
use crate::services::mapper::map_row;
use crate::services::normalize::{normalize, NormalizeStats};
use crate::services::refs;
use crate::services::validate::{validate, ValidateStats, Violation};

/// Lifecycle of one device within one run. Transitions only move forward;
/// `Skipped` and `Failed` are terminal alternatives to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Fetching,
    Flattening,
    Normalizing,
    Validating,
    Writing,
    Done,
    Skipped,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Fetching => "fetching",
            Stage::Flattening => "flattening",
            Stage::Normalizing => "normalizing",
            Stage::Validating => "validating",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Skipped => "skipped",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Skipped | Stage::Failed)
    }

    fn ordinal(&self) -> u8 {
        match self {
            Stage::Pending => 0,
            Stage::Fetching => 1,
            Stage::Flattening => 2,
            Stage::Normalizing => 3,
            Stage::Validating => 4,
            Stage::Writing => 5,
            Stage::Done | Stage::Skipped | Stage::Failed => 6,
        }
    }
}

pub struct StageTracker {
    device_sn: String,
    stage: Stage,
}

impl StageTracker {
    pub fn new(device_sn: &str) -> StageTracker {
        StageTracker {
            device_sn: device_sn.to_string(),
            stage: Stage::Pending,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move forward one or more stages. Backward or post-terminal moves are
    /// rejected and logged; they indicate a pipeline bug, not a data problem.
    pub fn advance(&mut self, next: Stage) {
        if self.stage.is_terminal() || next.ordinal() <= self.stage.ordinal() {
            warn!(
                "{}: illegal stage transition {} -> {}",
                self.device_sn,
                self.stage.as_str(),
                next.as_str()
            );
            return;
        }
        debug!("{}: {} -> {}", self.device_sn, self.stage.as_str(), next.as_str());
        self.stage = next;
    }

    pub fn skip(&mut self, reason: &str) {
        info!("{}: skipped ({})", self.device_sn, reason);
        self.stage = Stage::Skipped;
    }

    pub fn fail(&mut self, reason: &str) {
        warn!("{}: failed ({})", self.device_sn, reason);
        self.stage = Stage::Failed;
    }

    pub fn done(&mut self) {
        debug!("{}: {} -> done", self.device_sn, self.stage.as_str());
        self.stage = Stage::Done;
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub readings: Vec<CanonicalReading>,
    pub violations: Vec<Violation>,
    pub flatten: FlattenStats,
    pub unmapped_fields: usize,
    pub normalize: NormalizeStats,
    pub validate: ValidateStats,
}

/// Flatten, map, normalize and validate one device's payload. Pure with
/// respect to the database; violations are returned for the caller to
/// persist with credential context attached.
pub fn process_payload(
    vendor: Vendor,
    device_sn: &str,
    payload: &RawPayload,
    tracker: &mut StageTracker,
) -> PipelineOutput {
    tracker.advance(Stage::Flattening);
    let (rows, flatten_stats) = flatten_payload(payload);

    let mut mapped = Vec::with_capacity(rows.len());
    let mut unmapped_fields = 0usize;
    for row in &rows {
        let (reading, stats) = map_row(vendor, row);
        unmapped_fields += stats.unmapped;
        mapped.push(reading);
    }
    if unmapped_fields > 0 {
        debug!("{}: {} vendor fields had no canonical channel", device_sn, unmapped_fields);
    }

    tracker.advance(Stage::Normalizing);
    let (readings, mut violations, normalize_stats) =
        normalize(device_sn, mapped, payload.day_energy_kwh);

    tracker.advance(Stage::Validating);
    let (readings, range_violations, validate_stats) = validate(readings);
    violations.extend(range_violations);

    PipelineOutput {
        readings,
        violations,
        flatten: flatten_stats,
        unmapped_fields,
        normalize: normalize_stats,
        validate: validate_stats,
    }
}

/// Fan device fetches out over a bounded worker pool. Results come back in
/// completion order; each device appears exactly once.
pub fn fetch_all(
    adapter: &VendorAdapter,
    devices: Vec<DeviceRef>,
    kind: FetchKind,
    workers: usize,
) -> Vec<(DeviceRef, Result<RawPayload, AdapterError>)> {
    if devices.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, devices.len());

    let (job_tx, job_rx) = unbounded::<DeviceRef>();
    let (result_tx, result_rx) = unbounded();
    for device in devices {
        // Receivers outlive this loop, send cannot fail here.
        let _ = job_tx.send(device);
    }
    drop(job_tx);

    thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(device) = job_rx.recv() {
                    let outcome = match kind {
                        FetchKind::Historical { start, end } => {
                            adapter.fetch_historical(&device, start, end)
                        }
                        FetchKind::Realtime => adapter.fetch_realtime(&device),
                    };
                    if result_tx.send((device, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);
        result_rx.iter().collect()
    })
}

/// Register the customer and every vendor-reported plant/device for one
/// credential, returning the device list for fetching.
fn discover(
    conn: &mut PgConnection,
    cred: &Credential,
    adapter: &VendorAdapter,
) -> Result<Vec<DeviceRef>, String> {
    refs::ensure_customer(conn, &cred.customer_id)?;

    let plants = adapter
        .list_plants()
        .map_err(|e| format!("listing plants for {}: {}", cred.user_id, e))?;
    info!(
        "{}: {} reports {} plant(s)",
        cred.user_id,
        adapter.vendor(),
        plants.len()
    );

    let mut devices = Vec::new();
    for plant in &plants {
        refs::sync_plant(conn, &cred.customer_id, plant)?;
        match adapter.list_devices(plant) {
            Ok(found) => {
                for device in &found {
                    refs::sync_device(conn, &plant.plant_id, device)?;
                }
                devices.extend(found);
            }
            Err(e) => warn!("{}: listing devices of plant {} failed: {}", cred.user_id, plant.plant_id, e),
        }
    }
    info!("{}: {} device(s) discovered", cred.user_id, devices.len());
    Ok(devices)
}

fn violation_rows(cred: &Credential, device_sn: &str, violations: &[Violation]) -> Vec<NewValidationError> {
    violations
        .iter()
        .map(|v| NewValidationError {
            customer_id: cred.customer_id.clone(),
            device_sn: device_sn.to_string(),
            api_provider: cred.api_provider.clone(),
            field_name: v.field.clone(),
            field_value: v.value.clone(),
            error_message: v.message.clone(),
        })
        .collect()
}

/// Historical backfill for one credential: discover, fetch the configured
/// window for every device in parallel, pipeline and persist sequentially.
pub fn historical_for_credential(
    conn: &mut PgConnection,
    cfg: &Config,
    cred: &Credential,
) -> Result<(), String> {
    let adapter = VendorAdapter::from_credential(cred, cfg)
        .map_err(|e| format!("building adapter for {}: {}", cred.user_id, e))?;
    let devices = discover(conn, cred, &adapter)?;
    if devices.is_empty() {
        info!("{}: nothing to backfill", cred.user_id);
        return Ok(());
    }

    let end = Utc::now().date_naive();
    let start = end - ChronoDuration::days(cfg.historical_window_days);
    info!(
        "{}: backfilling {} device(s), {} to {}",
        cred.user_id,
        devices.len(),
        start,
        end
    );

    let vendor = adapter.vendor();
    let results = fetch_all(
        &adapter,
        devices,
        FetchKind::Historical { start, end },
        cfg.fetch_workers,
    );

    for (device, outcome) in results {
        let mut tracker = StageTracker::new(&device.device_sn);
        tracker.advance(Stage::Fetching);

        let payload = match outcome {
            Ok(p) if p.is_empty() => {
                tracker.skip("no data in window");
                continue;
            }
            Ok(p) => p,
            Err(e) => {
                tracker.fail(&e.to_string());
                continue;
            }
        };

        let output = process_payload(vendor, &device.device_sn, &payload, &mut tracker);

        tracker.advance(Stage::Writing);
        let errors = violation_rows(cred, &device.device_sn, &output.violations);
        if let Err(e) = ingest::write_violations(conn, &errors) {
            warn!("{}: {}", device.device_sn, e);
        }
        match ingest::write_historical(conn, &output.readings) {
            Ok(written) => {
                info!(
                    "{}: {} rows written ({} duplicates, {} unmapped fields, {} nulled, {} dropped)",
                    device.device_sn,
                    written,
                    output.flatten.duplicates,
                    output.unmapped_fields,
                    output.validate.nulled,
                    output.normalize.dropped_empty
                        + output.normalize.dropped_bad_timestamp
                        + output.validate.dropped_empty,
                );
                tracker.done();
            }
            Err(e) => tracker.fail(&e),
        }
    }
    Ok(())
}

struct Fleet {
    cred: Credential,
    adapter: VendorAdapter,
    devices: Vec<DeviceRef>,
}

/// Real-time collection at a steady cadence. Discovery happens once up
/// front; each tick fetches every device's current snapshot and writes to
/// the owning customer's table.
pub fn realtime_loop(
    conn: &mut PgConnection,
    cfg: &Config,
    creds: &[Credential],
) -> Result<(), String> {
    let mut fleets = Vec::new();
    for cred in creds {
        let adapter = match VendorAdapter::from_credential(cred, cfg) {
            Ok(a) => a,
            Err(e) => {
                warn!("{}: skipping credential: {}", cred.user_id, e);
                continue;
            }
        };
        match discover(conn, cred, &adapter) {
            Ok(devices) if !devices.is_empty() => fleets.push(Fleet {
                cred: cred.clone(),
                adapter,
                devices,
            }),
            Ok(_) => info!("{}: no devices, excluded from real-time loop", cred.user_id),
            Err(e) => warn!("{}: discovery failed: {}", cred.user_id, e),
        }
    }
    if fleets.is_empty() {
        return Err("no credential yielded devices for real-time collection".to_string());
    }

    let interval = Duration::from_secs(cfg.realtime_interval_seconds);
    info!(
        "real-time loop started: {} fleet(s), interval {}s",
        fleets.len(),
        interval.as_secs()
    );

    loop {
        let tick_start = Instant::now();

        for fleet in &fleets {
            collect_fleet(conn, cfg, fleet);
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

fn collect_fleet(conn: &mut PgConnection, cfg: &Config, fleet: &Fleet) {
    let vendor = fleet.adapter.vendor();
    let results = fetch_all(
        &fleet.adapter,
        fleet.devices.clone(),
        FetchKind::Realtime,
        cfg.fetch_workers,
    );

    for (device, outcome) in results {
        let mut tracker = StageTracker::new(&device.device_sn);
        tracker.advance(Stage::Fetching);

        let payload = match outcome {
            Ok(p) if p.is_empty() => {
                tracker.skip("no current data");
                continue;
            }
            Ok(p) => p,
            Err(e) => {
                tracker.fail(&e.to_string());
                continue;
            }
        };

        let output = process_payload(vendor, &device.device_sn, &payload, &mut tracker);

        tracker.advance(Stage::Writing);
        let errors = violation_rows(&fleet.cred, &device.device_sn, &output.violations);
        if let Err(e) = ingest::write_violations(conn, &errors) {
            warn!("{}: {}", device.device_sn, e);
        }
        match ingest::write_realtime(conn, &fleet.cred.customer_id, &output.readings) {
            Ok(written) => {
                debug!("{}: {} real-time row(s) written", device.device_sn, written);
                tracker.done();
            }
            Err(e) => tracker.fail(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stages_only_move_forward() {
        let mut t = StageTracker::new("SN1");
        assert_eq!(t.stage(), Stage::Pending);
        t.advance(Stage::Fetching);
        t.advance(Stage::Flattening);
        t.advance(Stage::Normalizing);
        t.advance(Stage::Validating);
        t.advance(Stage::Writing);
        t.done();
        assert_eq!(t.stage(), Stage::Done);
        assert!(t.stage().is_terminal());

        // Terminal stages refuse further movement.
        t.advance(Stage::Fetching);
        assert_eq!(t.stage(), Stage::Done);
    }

    #[test]
    fn backward_transition_is_rejected() {
        let mut t = StageTracker::new("SN1");
        t.advance(Stage::Validating);
        t.advance(Stage::Flattening);
        assert_eq!(t.stage(), Stage::Validating);
    }

    #[test]
    fn skip_and_fail_are_terminal() {
        let mut t = StageTracker::new("SN1");
        t.advance(Stage::Fetching);
        t.skip("no data");
        assert_eq!(t.stage(), Stage::Skipped);

        let mut t = StageTracker::new("SN2");
        t.fail("boom");
        assert_eq!(t.stage(), Stage::Failed);
    }

    #[test]
    fn pipeline_end_to_end_without_database() {
        // SolisCloud-shaped day payload: one duplicate, one out-of-range
        // value, one sample with a broken timestamp, one signal-free sample.
        let payload = RawPayload {
            rows: json!([
                {"dataTimestamp": "1718000000000", "uPv1": "350.5", "iPv1": 8.1, "pac": 4.0},
                {"dataTimestamp": "1718000000000", "uPv1": "999.0"},
                {"dataTimestamp": "1718000300000", "uPv1": 1000.01, "pac": 4.1},
                {"dataTimestamp": "not a time", "pac": 4.2},
                {"dataTimestamp": "1718000600000", "currentState": "3"}
            ]),
            day_energy_kwh: Some(12.5),
        };
        let mut tracker = StageTracker::new("SN1");
        tracker.advance(Stage::Fetching);
        let out = process_payload(Vendor::Soliscloud, "SN1", &payload, &mut tracker);

        assert_eq!(out.flatten.duplicates, 1);
        assert_eq!(out.normalize.dropped_bad_timestamp, 1);
        // The state-only sample survives through the day-energy fallback.
        assert_eq!(out.readings.len(), 3);

        let first = &out.readings[0];
        assert_eq!(first.timestamp.timestamp(), 1_718_000_000);
        assert_eq!(first.channels.pv01_voltage, Some(350.5));
        assert_eq!(first.channels.energy_today, Some(12.5));
        assert_eq!(first.channels.state.as_deref(), Some("unknown"));

        // Out-of-range pv voltage nulled, rest of the sample kept.
        let second = &out.readings[1];
        assert_eq!(second.channels.pv01_voltage, None);
        assert_eq!(second.channels.total_power, Some(4.1));

        let third = &out.readings[2];
        assert_eq!(third.channels.state.as_deref(), Some("3"));
        assert_eq!(third.channels.energy_today, Some(12.5));

        // One timestamp violation plus one range violation.
        assert_eq!(out.violations.len(), 2);
        assert_eq!(tracker.stage(), Stage::Validating);
    }

    #[test]
    fn day_energy_never_leaks_onto_other_days() {
        // Multi-day title-keyed payload: only the first day's rows carry the
        // adapter-stamped day energy, and the payload level carries none.
        // Rows from the day without energy must stay NULL.
        let payload = RawPayload {
            rows: json!([
                {"timestamp": "2024-06-10 06:00:00", "PV1 Input voltage(V)": 350.0, "energy_today": 9.4},
                {"timestamp": "2024-06-11 06:00:00", "PV1 Input voltage(V)": 351.0},
            ]),
            day_energy_kwh: None,
        };
        let mut tracker = StageTracker::new("SN1");
        tracker.advance(Stage::Fetching);
        let out = process_payload(Vendor::Shinemonitor, "SN1", &payload, &mut tracker);

        assert_eq!(out.readings.len(), 2);
        assert_eq!(out.readings[0].channels.energy_today, Some(9.4));
        assert_eq!(out.readings[1].channels.energy_today, None);
    }

    #[test]
    fn three_days_of_samples_with_one_duplicate_and_one_bad_current() {
        // 3 days x 288 five-minute samples, one duplicated timestamp and one
        // out-of-range current: 863 readings survive, exactly one violation.
        let mut rows = Vec::new();
        let base = 1_718_000_000_i64;
        for day in 0..3 {
            for slot in 0..288 {
                // The very last sample repeats the first timestamp.
                let ts = if day == 2 && slot == 287 {
                    base
                } else {
                    base + day * 86_400 + slot * 300
                };
                let current = if day == 1 && slot == 100 { 51.0 } else { 8.0 };
                rows.push(json!({
                    "dataTimestamp": ts * 1000,
                    "uPv1": 350.0,
                    "iPv1": current,
                }));
            }
        }

        let payload = RawPayload {
            rows: json!(rows),
            day_energy_kwh: None,
        };
        let mut tracker = StageTracker::new("SN1");
        tracker.advance(Stage::Fetching);
        let out = process_payload(Vendor::Soliscloud, "SN1", &payload, &mut tracker);

        assert_eq!(out.flatten.duplicates, 1);
        assert_eq!(out.readings.len(), 863);
        assert_eq!(out.violations.len(), 1);
        assert_eq!(out.violations[0].field, "pv01_current");
        // The offending sample survives with the current nulled.
        let nulled = out
            .readings
            .iter()
            .filter(|r| r.channels.pv01_current.is_none())
            .count();
        assert_eq!(nulled, 1);
    }

    #[test]
    fn signal_free_realtime_sample_is_dropped() {
        // The day-energy fallback gives the state-only sample a numeric
        // channel, so it survives; without it the sample is dropped.
        let payload = RawPayload {
            rows: json!([{"dataTimestamp": "1718000600000", "currentState": "3"}]),
            day_energy_kwh: None,
        };
        let mut tracker = StageTracker::new("SN1");
        tracker.advance(Stage::Fetching);
        let out = process_payload(Vendor::Soliscloud, "SN1", &payload, &mut tracker);
        assert!(out.readings.is_empty());
        assert_eq!(out.normalize.dropped_empty, 1);
    }
}
