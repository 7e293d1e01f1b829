//! Reference data: customers, plants, devices and API credentials.
//!
//! Vendor-reported plants and devices are registered with insert-if-absent
//! semantics so discovery runs are idempotent. Credentials live in the
//! `api_credentials` table; an optional CSV seed file can populate it on
//! startup (plain comma-separated, no quoting, one credential per line).

use diesel::prelude::*;
use log::{info, warn};

use crate::db::models::{Credential, NewCredential, NewCustomer, NewDevice, NewPlant};
use crate::models::reading::{DeviceRef, PlantRef};
use crate::schema;
use crate::utils::parse_install_date;

/// Load every credential. A failure here is fatal for the run; there is
/// nothing to ingest without credentials.
pub fn load_credentials(conn: &mut PgConnection) -> Result<Vec<Credential>, String> {
    use schema::api_credentials::dsl::*;
    api_credentials
        .select(Credential::as_select())
        .order(user_id.asc())
        .load(conn)
        .map_err(|e| format!("loading credentials: {}", e))
}

/// Seed credentials from a CSV file, skipping rows that already exist.
/// Expected columns: user_id,customer_id,api_provider,username,password,
/// api_key,api_secret (last two may be empty).
pub fn seed_credentials_from_csv(conn: &mut PgConnection, path: &str) -> Result<usize, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("reading credential file {}: {}", path, e))?;

    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (lineno == 0 && line.starts_with("user_id")) {
            continue;
        }
        match parse_credential_line(line) {
            Some(row) => rows.push(row),
            None => warn!("{}:{}: malformed credential line, skipping", path, lineno + 1),
        }
    }

    // Customers referenced by the feed must exist before the FK is written.
    let customers: Vec<NewCustomer> = {
        let mut seen = std::collections::BTreeSet::new();
        rows.iter()
            .filter(|r| seen.insert(r.customer_id.clone()))
            .map(|r| NewCustomer {
                customer_id: r.customer_id.clone(),
                customer_name: None,
            })
            .collect()
    };
    diesel::insert_into(schema::customers::table)
        .values(&customers)
        .on_conflict_do_nothing()
        .execute(conn)
        .map_err(|e| format!("seeding customers: {}", e))?;

    let inserted = diesel::insert_into(schema::api_credentials::table)
        .values(&rows)
        .on_conflict_do_nothing()
        .execute(conn)
        .map_err(|e| format!("seeding credentials: {}", e))?;

    info!("credential seed: {} rows in file, {} newly inserted", rows.len(), inserted);
    Ok(inserted)
}

fn parse_credential_line(line: &str) -> Option<NewCredential> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 5 || parts[..5].iter().any(|p| p.is_empty()) {
        return None;
    }
    let optional = |i: usize| -> Option<String> {
        parts
            .get(i)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    Some(NewCredential {
        user_id: parts[0].to_string(),
        customer_id: parts[1].to_string(),
        api_provider: parts[2].to_string(),
        username: parts[3].to_string(),
        password: parts[4].to_string(),
        api_key: optional(5),
        api_secret: optional(6),
    })
}

pub fn ensure_customer(conn: &mut PgConnection, customer: &str) -> Result<(), String> {
    diesel::insert_into(schema::customers::table)
        .values(&NewCustomer {
            customer_id: customer.to_string(),
            customer_name: None,
        })
        .on_conflict_do_nothing()
        .execute(conn)
        .map_err(|e| format!("registering customer {}: {}", customer, e))?;
    Ok(())
}

pub fn sync_plant(conn: &mut PgConnection, customer: &str, plant: &PlantRef) -> Result<(), String> {
    let row = NewPlant {
        plant_id: plant.plant_id.clone(),
        customer_id: customer.to_string(),
        plant_name: plant.name.clone(),
        capacity_kw: plant.capacity_kw,
        install_date: plant.install_date.as_ref().and_then(parse_install_date),
    };
    diesel::insert_into(schema::plants::table)
        .values(&row)
        .on_conflict_do_nothing()
        .execute(conn)
        .map_err(|e| format!("registering plant {}: {}", plant.plant_id, e))?;
    Ok(())
}

pub fn sync_device(conn: &mut PgConnection, plant_id: &str, device: &DeviceRef) -> Result<(), String> {
    let row = NewDevice {
        device_sn: device.device_sn.clone(),
        plant_id: plant_id.to_string(),
        inverter_model: device.inverter_model.clone(),
        panel_model: device.panel_model.clone(),
        pv_count: device.pv_count,
        string_count: device.string_count,
        first_install_date: None,
    };
    diesel::insert_into(schema::devices::table)
        .values(&row)
        .on_conflict_do_nothing()
        .execute(conn)
        .map_err(|e| format!("registering device {}: {}", device.device_sn, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_line_full() {
        let c = parse_credential_line("u1,acme,soliscloud,user@x.com,pw,KEY,SECRET").unwrap();
        assert_eq!(c.user_id, "u1");
        assert_eq!(c.customer_id, "acme");
        assert_eq!(c.api_provider, "soliscloud");
        assert_eq!(c.api_key.as_deref(), Some("KEY"));
        assert_eq!(c.api_secret.as_deref(), Some("SECRET"));
    }

    #[test]
    fn credential_line_without_key_pair() {
        let c = parse_credential_line("u2,acme,shinemonitor,user,pw").unwrap();
        assert_eq!(c.api_key, None);
        assert_eq!(c.api_secret, None);
    }

    #[test]
    fn malformed_credential_lines_are_rejected() {
        assert!(parse_credential_line("u1,acme,shinemonitor").is_none());
        assert!(parse_credential_line("u1,,shinemonitor,user,pw").is_none());
        assert!(parse_credential_line("").is_none());
    }
}
