//! Vendor field name resolution.
//!
//! Each vendor names the same physical channel differently: ShineMonitor
//! uses human-readable column titles with units ("PV1 Input voltage(V)"),
//! Solarman uses snake_case codes (`pv1_voltage`), SolisCloud uses compact
//! electrical codes (`uPv1`, `iAc2`, `pac`). The mapper resolves all of them
//! onto the canonical channel set; unknown fields are counted, never fatal.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::models::reading::{ChannelSet, MappedReading, Vendor, PV_CHANNEL_MAX};
use crate::services::flatten::{raw_timestamp_of, TIMESTAMP_KEYS};

/// Minimum similarity for a fuzzy title match.
const TITLE_MATCH_THRESHOLD: f64 = 0.8;

#[derive(Debug, Default, PartialEq)]
pub struct MapStats {
    pub mapped: usize,
    pub unmapped: usize,
}

enum Target {
    Numeric(String),
    State,
}

pub fn map_row(vendor: Vendor, row: &Map<String, Value>) -> (MappedReading, MapStats) {
    let mut reading = MappedReading {
        raw_timestamp: raw_timestamp_of(row).cloned(),
        channels: ChannelSet::default(),
    };
    let mut stats = MapStats::default();

    for (key, value) in row {
        if TIMESTAMP_KEYS.contains(&key.as_str()) {
            continue;
        }
        let target = match vendor {
            Vendor::Shinemonitor => match_shinemonitor(key),
            Vendor::Solarman => match_solarman(key),
            Vendor::Soliscloud => match_soliscloud(key),
        };
        match target {
            Some(Target::Numeric(channel)) => match numeric_value(value) {
                Some(v) if reading.channels.set_numeric(&channel, v) => stats.mapped += 1,
                _ => stats.unmapped += 1,
            },
            Some(Target::State) => match state_value(value) {
                Some(s) => {
                    reading.channels.state = Some(s);
                    stats.mapped += 1;
                }
                None => stats.unmapped += 1,
            },
            None => stats.unmapped += 1,
        }
    }

    (reading, stats)
}

fn numeric_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn state_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pv_channel(index: u32, kind: &str) -> Option<Target> {
    if (1..=PV_CHANNEL_MAX).contains(&index) {
        Some(Target::Numeric(format!("pv{:02}_{}", index, kind)))
    } else {
        None
    }
}

// --- ShineMonitor: fuzzy title matching ---------------------------------

/// Known column titles in normalized form. Titles carry unit suffixes and
/// localization noise in the wild, hence the similarity matching below.
fn shinemonitor_titles() -> &'static Vec<(String, Target)> {
    static TITLES: OnceLock<Vec<(String, Target)>> = OnceLock::new();
    TITLES.get_or_init(|| {
        let mut t: Vec<(String, Target)> = Vec::new();
        for i in 1..=PV_CHANNEL_MAX {
            t.push((
                format!("pv{} input voltage", i),
                Target::Numeric(format!("pv{:02}_voltage", i)),
            ));
            t.push((
                format!("pv{} input current", i),
                Target::Numeric(format!("pv{:02}_current", i)),
            ));
        }
        for phase in ["r", "s", "t"] {
            t.push((
                format!("{} phase grid voltage", phase),
                Target::Numeric(format!("{}_voltage", phase)),
            ));
            t.push((
                format!("{} phase grid current", phase),
                Target::Numeric(format!("{}_current", phase)),
            ));
        }
        for line in ["rs", "st", "tr"] {
            t.push((
                format!("{} line voltage", line),
                Target::Numeric(format!("{}_voltage", line)),
            ));
        }
        t.push(("grid frequency".into(), Target::Numeric("frequency".into())));
        t.push(("grid connected power".into(), Target::Numeric("total_power".into())));
        t.push(("active power".into(), Target::Numeric("total_power".into())));
        t.push(("reactive power".into(), Target::Numeric("reactive_power".into())));
        t.push(("energy today".into(), Target::Numeric("energy_today".into())));
        t.push(("daily energy".into(), Target::Numeric("energy_today".into())));
        t.push(("performance ratio".into(), Target::Numeric("pr".into())));
        t.push(("cuf".into(), Target::Numeric("cuf".into())));
        t.push(("status".into(), Target::State));
        t.push(("operating mode".into(), Target::State));
        t.push(("operation mode".into(), Target::State));
        t
    })
}

fn match_shinemonitor(key: &str) -> Option<Target> {
    let nk = normalize_title(key);
    if nk.is_empty() {
        return None;
    }

    let mut best: Option<(f64, &Target)> = None;
    for (title, target) in shinemonitor_titles() {
        let score = title_score(&nk, title);
        if best.map_or(true, |(b, _)| score > b) {
            best = Some((score, target));
        }
    }
    match best {
        Some((score, target)) if score >= TITLE_MATCH_THRESHOLD => Some(clone_target(target)),
        _ => None,
    }
}

fn clone_target(t: &Target) -> Target {
    match t {
        Target::Numeric(c) => Target::Numeric(c.clone()),
        Target::State => Target::State,
    }
}

/// Exact match beats everything; containment (title with a unit suffix)
/// beats plain similarity; otherwise Sorensen-Dice over character bigrams.
fn title_score(key: &str, title: &str) -> f64 {
    if key == title {
        return 1.0;
    }
    let dice = dice_similarity(key, title);
    if key.contains(title) || title.contains(key) {
        dice.max(0.85)
    } else {
        dice
    }
}

fn dice_similarity(a: &str, b: &str) -> f64 {
    let ab = bigrams(a);
    let bb = bigrams(b);
    if ab.is_empty() || bb.is_empty() {
        return if a == b { 1.0 } else { 0.0 };
    }
    let mut remaining = bb.clone();
    let mut hits = 0usize;
    for g in &ab {
        if let Some(pos) = remaining.iter().position(|r| r == g) {
            remaining.swap_remove(pos);
            hits += 1;
        }
    }
    2.0 * hits as f64 / (ab.len() + bb.len()) as f64
}

fn bigrams(s: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Lowercase, strip unit suffixes and punctuation down to single spaces.
fn normalize_title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

// --- Solarman: snake_case codes ------------------------------------------

fn match_solarman(key: &str) -> Option<Target> {
    static PV_RE: OnceLock<Regex> = OnceLock::new();
    static PHASE_RE: OnceLock<Regex> = OnceLock::new();
    let pv_re = PV_RE.get_or_init(|| Regex::new(r"^pv(\d+)_(voltage|current)$").unwrap());
    let phase_re =
        PHASE_RE.get_or_init(|| Regex::new(r"^(r|s|t|rs|st|tr)_(voltage|current)$").unwrap());

    let key = key.to_ascii_lowercase();
    if let Some(c) = pv_re.captures(&key) {
        let index: u32 = c[1].parse().ok()?;
        return pv_channel(index, &c[2]);
    }
    if phase_re.is_match(&key) {
        return Some(Target::Numeric(key));
    }
    match key.as_str() {
        "e_day" | "e_today" | "energy_today" => Some(Target::Numeric("energy_today".into())),
        "power" | "total_power" | "active_power" => Some(Target::Numeric("total_power".into())),
        "reactive_power" => Some(Target::Numeric("reactive_power".into())),
        "frequency" | "fac" | "grid_frequency" => Some(Target::Numeric("frequency".into())),
        "pr" | "performance_ratio" => Some(Target::Numeric("pr".into())),
        "cuf" => Some(Target::Numeric("cuf".into())),
        "status" | "state" | "inverter_status" => Some(Target::State),
        _ => None,
    }
}

// --- SolisCloud: compact electrical codes ---------------------------------

fn match_soliscloud(key: &str) -> Option<Target> {
    static CODE_RE: OnceLock<Regex> = OnceLock::new();
    let code_re = CODE_RE.get_or_init(|| Regex::new(r"^([ui])(Pv|Ac)(\d+)$").unwrap());

    if let Some(c) = code_re.captures(key) {
        let kind = if &c[1] == "u" { "voltage" } else { "current" };
        let index: u32 = c[3].parse().ok()?;
        return match &c[2] {
            "Pv" => pv_channel(index, kind),
            "Ac" => {
                let phase = match index {
                    1 => "r",
                    2 => "s",
                    3 => "t",
                    _ => return None,
                };
                Some(Target::Numeric(format!("{}_{}", phase, kind)))
            }
            _ => None,
        };
    }
    match key {
        "pac" => Some(Target::Numeric("total_power".into())),
        "qac" => Some(Target::Numeric("reactive_power".into())),
        "fac" => Some(Target::Numeric("frequency".into())),
        "eToday" => Some(Target::Numeric("energy_today".into())),
        "uAb" => Some(Target::Numeric("rs_voltage".into())),
        "uBc" => Some(Target::Numeric("st_voltage".into())),
        "uCa" => Some(Target::Numeric("tr_voltage".into())),
        "state" | "currentState" => Some(Target::State),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn soliscloud_compact_codes() {
        let r = row(&[
            ("uPv1", json!("350.5")),
            ("iPv1", json!(8.2)),
            ("uAc2", json!(231.0)),
            ("pac", json!(4.2)),
            ("eToday", json!(12.5)),
            ("dataTimestamp", json!("1718000000000")),
        ]);
        let (m, stats) = map_row(Vendor::Soliscloud, &r);
        assert_eq!(m.channels.pv01_voltage, Some(350.5));
        assert_eq!(m.channels.pv01_current, Some(8.2));
        assert_eq!(m.channels.s_voltage, Some(231.0));
        assert_eq!(m.channels.total_power, Some(4.2));
        assert_eq!(m.channels.energy_today, Some(12.5));
        assert_eq!(m.raw_timestamp, Some(json!("1718000000000")));
        assert_eq!(stats.unmapped, 0);
    }

    #[test]
    fn soliscloud_channel_above_ceiling_is_dropped() {
        let r = row(&[("uPv13", json!(100.0)), ("uPv12", json!(99.0))]);
        let (m, stats) = map_row(Vendor::Soliscloud, &r);
        assert_eq!(m.channels.pv12_voltage, Some(99.0));
        assert_eq!(stats.unmapped, 1);
        assert_eq!(stats.mapped, 1);
    }

    #[test]
    fn solarman_codes_renumber() {
        let r = row(&[
            ("pv1_voltage", json!("351.0")),
            ("pv2_current", json!(7.7)),
            ("e_day", json!(10.0)),
            ("power", json!(5000.0)),
            ("status", json!("Normal")),
            ("collectTime", json!(1718000000_i64)),
        ]);
        let (m, stats) = map_row(Vendor::Solarman, &r);
        assert_eq!(m.channels.pv01_voltage, Some(351.0));
        assert_eq!(m.channels.pv02_current, Some(7.7));
        assert_eq!(m.channels.energy_today, Some(10.0));
        assert_eq!(m.channels.total_power, Some(5000.0));
        assert_eq!(m.channels.state.as_deref(), Some("Normal"));
        assert_eq!(stats.unmapped, 0);
    }

    #[test]
    fn shinemonitor_titles_with_unit_suffixes() {
        let r = row(&[
            ("PV1 Input voltage(V)", json!("352.1")),
            ("PV11 Input voltage(V)", json!("12.0")),
            ("R phase grid voltage(V)", json!(230.2)),
            ("RS line voltage(V)", json!(400.1)),
            ("Grid frequency(Hz)", json!(50.02)),
            ("Grid-connected power(W)", json!(4100.0)),
            ("Energy today(kWh)", json!(9.4)),
            ("Status", json!("On-grid")),
            ("timestamp", json!("2024-06-10 06:13:20")),
        ]);
        let (m, stats) = map_row(Vendor::Shinemonitor, &r);
        assert_eq!(m.channels.pv01_voltage, Some(352.1));
        assert_eq!(m.channels.pv11_voltage, Some(12.0));
        assert_eq!(m.channels.r_voltage, Some(230.2));
        assert_eq!(m.channels.rs_voltage, Some(400.1));
        assert_eq!(m.channels.frequency, Some(50.02));
        assert_eq!(m.channels.total_power, Some(4100.0));
        assert_eq!(m.channels.energy_today, Some(9.4));
        assert_eq!(m.channels.state.as_deref(), Some("On-grid"));
        assert_eq!(stats.unmapped, 0);
    }

    #[test]
    fn unknown_fields_are_counted_not_fatal() {
        let r = row(&[
            ("mystery_channel", json!(1.0)),
            ("uPv1", json!(340.0)),
        ]);
        let (m, stats) = map_row(Vendor::Soliscloud, &r);
        assert_eq!(m.channels.pv01_voltage, Some(340.0));
        assert_eq!(stats.unmapped, 1);
    }

    #[test]
    fn reactive_and_active_power_do_not_cross_match() {
        let r = row(&[
            ("Reactive power(Var)", json!(-120.0)),
            ("Active power(W)", json!(4000.0)),
        ]);
        let (m, _) = map_row(Vendor::Shinemonitor, &r);
        assert_eq!(m.channels.reactive_power, Some(-120.0));
        assert_eq!(m.channels.total_power, Some(4000.0));
    }

    #[test]
    fn dice_similarity_bounds() {
        assert_eq!(dice_similarity("abc", "abc"), 1.0);
        assert_eq!(dice_similarity("abc", "xyz"), 0.0);
        let s = dice_similarity("grid frequency", "grid frequency hz");
        assert!(s > 0.8 && s < 1.0);
    }
}
