//! Batched persistence of validated readings.
//!
//! Historical readings go to the shared `device_data_historical` hypertable
//! through the static diesel DSL. Real-time readings go to a per-customer
//! table created on demand; since diesel's DSL cannot target a runtime table
//! name, those inserts are raw parameterized statements against a
//! sanitized, fixed-shape table. Either way the natural key is
//! `(device_sn, timestamp)` and conflicts are silently skipped, making
//! re-ingestion idempotent.

use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Float8, Nullable, Text, Timestamptz};
use log::{error, info};

use crate::db::models::{NewDeviceReading, NewValidationError};
use crate::models::reading::{CanonicalReading, NUMERIC_CHANNELS};
use crate::schema;
use crate::utils::realtime_table_name;

pub const BATCH_SIZE: usize = 200;

/// Insert historical readings in fixed-size batches. A failed batch is
/// logged and abandoned; remaining batches still run. Returns rows written.
pub fn write_historical(
    conn: &mut PgConnection,
    readings: &[CanonicalReading],
) -> Result<usize, String> {
    use schema::device_data_historical::dsl as ddh;

    let mut written = 0usize;
    let mut failed_batches = 0usize;

    for batch in readings.chunks(BATCH_SIZE) {
        let rows: Vec<NewDeviceReading> = batch.iter().map(NewDeviceReading::from).collect();
        match diesel::insert_into(ddh::device_data_historical)
            .values(&rows)
            .on_conflict((ddh::device_sn, ddh::timestamp))
            .do_nothing()
            .execute(conn)
        {
            Ok(n) => written += n,
            Err(e) => {
                failed_batches += 1;
                error!("historical batch of {} rows failed: {}", rows.len(), e);
            }
        }
    }

    if failed_batches > 0 {
        info!(
            "historical write finished with {} failed batches, {} rows written",
            failed_batches, written
        );
    }
    Ok(written)
}

/// Create the per-customer real-time table if it does not exist yet and
/// return its (sanitized) name.
pub fn ensure_realtime_table(
    conn: &mut PgConnection,
    customer_id: &str,
) -> Result<String, String> {
    let table = realtime_table_name(customer_id).map_err(|e| e.to_string())?;

    sql_query(realtime_table_ddl(&table))
        .execute(conn)
        .map_err(|e| format!("creating {}: {}", table, e))?;

    // Idempotent on tables that are already hypertables.
    sql_query(format!(
        "SELECT create_hypertable('{}', 'timestamp', if_not_exists => TRUE)",
        table
    ))
    .execute(conn)
    .map_err(|e| format!("creating hypertable for {}: {}", table, e))?;

    Ok(table)
}

/// Insert real-time readings into a customer's table, one transaction per
/// batch. A failed batch rolls back and is abandoned; later batches proceed.
pub fn write_realtime(
    conn: &mut PgConnection,
    customer_id: &str,
    readings: &[CanonicalReading],
) -> Result<usize, String> {
    let table = ensure_realtime_table(conn, customer_id)?;
    let sql = insert_sql(&table);

    let mut written = 0usize;
    let mut failed_batches = 0usize;

    for batch in readings.chunks(BATCH_SIZE) {
        let result = conn.transaction::<usize, diesel::result::Error, _>(|conn| {
            let mut n = 0usize;
            for reading in batch {
                n += insert_realtime_row(conn, &sql, reading)?;
            }
            Ok(n)
        });
        match result {
            Ok(n) => written += n,
            Err(e) => {
                failed_batches += 1;
                error!(
                    "real-time batch of {} rows into {} failed: {}",
                    batch.len(),
                    table,
                    e
                );
            }
        }
    }

    if failed_batches > 0 {
        info!(
            "real-time write to {} finished with {} failed batches, {} rows written",
            table, failed_batches, written
        );
    }
    Ok(written)
}

fn insert_realtime_row(
    conn: &mut PgConnection,
    sql: &str,
    reading: &CanonicalReading,
) -> Result<usize, diesel::result::Error> {
    let n = reading.channels.numeric_fields();
    sql_query(sql)
        .bind::<Text, _>(&reading.device_sn)
        .bind::<Timestamptz, _>(reading.timestamp)
        .bind::<Nullable<Float8>, _>(n[0].1)
        .bind::<Nullable<Float8>, _>(n[1].1)
        .bind::<Nullable<Float8>, _>(n[2].1)
        .bind::<Nullable<Float8>, _>(n[3].1)
        .bind::<Nullable<Float8>, _>(n[4].1)
        .bind::<Nullable<Float8>, _>(n[5].1)
        .bind::<Nullable<Float8>, _>(n[6].1)
        .bind::<Nullable<Float8>, _>(n[7].1)
        .bind::<Nullable<Float8>, _>(n[8].1)
        .bind::<Nullable<Float8>, _>(n[9].1)
        .bind::<Nullable<Float8>, _>(n[10].1)
        .bind::<Nullable<Float8>, _>(n[11].1)
        .bind::<Nullable<Float8>, _>(n[12].1)
        .bind::<Nullable<Float8>, _>(n[13].1)
        .bind::<Nullable<Float8>, _>(n[14].1)
        .bind::<Nullable<Float8>, _>(n[15].1)
        .bind::<Nullable<Float8>, _>(n[16].1)
        .bind::<Nullable<Float8>, _>(n[17].1)
        .bind::<Nullable<Float8>, _>(n[18].1)
        .bind::<Nullable<Float8>, _>(n[19].1)
        .bind::<Nullable<Float8>, _>(n[20].1)
        .bind::<Nullable<Float8>, _>(n[21].1)
        .bind::<Nullable<Float8>, _>(n[22].1)
        .bind::<Nullable<Float8>, _>(n[23].1)
        .bind::<Nullable<Float8>, _>(n[24].1)
        .bind::<Nullable<Float8>, _>(n[25].1)
        .bind::<Nullable<Float8>, _>(n[26].1)
        .bind::<Nullable<Float8>, _>(n[27].1)
        .bind::<Nullable<Float8>, _>(n[28].1)
        .bind::<Nullable<Float8>, _>(n[29].1)
        .bind::<Nullable<Float8>, _>(n[30].1)
        .bind::<Nullable<Float8>, _>(n[31].1)
        .bind::<Nullable<Float8>, _>(n[32].1)
        .bind::<Nullable<Float8>, _>(n[33].1)
        .bind::<Nullable<Float8>, _>(n[34].1)
        .bind::<Nullable<Float8>, _>(n[35].1)
        .bind::<Nullable<Float8>, _>(n[36].1)
        .bind::<Nullable<Float8>, _>(n[37].1)
        .bind::<Nullable<Float8>, _>(n[38].1)
        .bind::<Nullable<Text>, _>(reading.channels.state.as_deref())
        .execute(conn)
}

/// Parameterized insert for a per-customer table. Only values are bound;
/// the table name comes from `realtime_table_name` and is restricted to
/// `[a-z0-9_]`.
fn insert_sql(table: &str) -> String {
    let columns: Vec<&str> = NUMERIC_CHANNELS.to_vec();
    let placeholders: Vec<String> = (3..3 + columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} (device_sn, \"timestamp\", {}, state) \
         VALUES ($1, $2, {}, ${}) \
         ON CONFLICT (device_sn, \"timestamp\") DO NOTHING",
        table,
        columns.join(", "),
        placeholders.join(", "),
        3 + columns.len(),
    )
}

fn realtime_table_ddl(table: &str) -> String {
    let column_defs: Vec<String> = NUMERIC_CHANNELS
        .iter()
        .map(|c| format!("{} DOUBLE PRECISION", c))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         device_sn TEXT NOT NULL, \
         \"timestamp\" TIMESTAMPTZ NOT NULL, \
         {}, \
         state TEXT, \
         created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
         PRIMARY KEY (device_sn, \"timestamp\"))",
        table,
        column_defs.join(", "),
    )
}

pub fn write_violations(
    conn: &mut PgConnection,
    violations: &[NewValidationError],
) -> Result<usize, String> {
    if violations.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(schema::validation_errors::table)
        .values(violations)
        .execute(conn)
        .map_err(|e| format!("writing validation errors: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sql_binds_forty_two_values() {
        let sql = insert_sql("customer_acme_device_data");
        assert!(sql.starts_with("INSERT INTO customer_acme_device_data "));
        assert!(sql.contains("$42"));
        assert!(!sql.contains("$43"));
        assert!(sql.ends_with("ON CONFLICT (device_sn, \"timestamp\") DO NOTHING"));
        assert_eq!(sql.matches(", state)").count(), 1);
    }

    #[test]
    fn ddl_covers_every_channel() {
        let ddl = realtime_table_ddl("customer_acme_device_data");
        for channel in NUMERIC_CHANNELS {
            assert!(ddl.contains(&format!("{} DOUBLE PRECISION", channel)), "{}", channel);
        }
        assert!(ddl.contains("PRIMARY KEY (device_sn, \"timestamp\")"));
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS"));
    }

    #[test]
    fn batch_size_is_two_hundred() {
        assert_eq!(BATCH_SIZE, 200);
    }
}
