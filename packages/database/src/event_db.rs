//! `DuckDB` event storage.
//!
//! One `DuckDB` file holds any number of event tables plus an internal
//! `_fetch_history` table recording every completed import.

use std::collections::BTreeMap;
use std::path::Path;

use duckdb::Connection;
use eventsync_source_models::EventRow;

use crate::{DbError, EventSink, FetchRecord, TableSchema, validate_table_name};

/// Number of rows per INSERT statement (`DuckDB` handles large batches well).
const CHUNK_SIZE: usize = 2_000;

/// Bound parameters per row (one per [`TableSchema::events`] column).
const PARAMS_PER_ROW: usize = 5;

/// [`EventSink`] backed by a `DuckDB` connection.
#[derive(Debug)]
pub struct DuckDbSink {
    conn: Connection,
}

impl DuckDbSink {
    /// Opens (or creates) the `DuckDB` file at `path` and ensures the
    /// internal schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the directory, connection or schema cannot be
    /// created.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            crate::paths::ensure_dir(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "SET threads = 4;
             SET memory_limit = '512MB';",
        )?;

        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema cannot be created.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _fetch_history (
                table_name TEXT NOT NULL,
                from_date DATE NOT NULL,
                to_date DATE NOT NULL,
                row_count BIGINT NOT NULL,
                fetched_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Returns the number of rows stored in `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the name is invalid, the table is missing or
    /// the query fails.
    pub fn row_count(&self, name: &str) -> Result<u64, DbError> {
        validate_table_name(name)?;
        if !self.table_exists(name)? {
            return Err(DbError::TableNotFound {
                name: name.to_string(),
            });
        }
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {name}"), [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Lists user tables (internal `_`-prefixed tables are hidden) with
    /// their row counts, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if a query fails.
    pub fn list_tables(&self) -> Result<Vec<(String, u64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT table_name FROM information_schema.tables
             WHERE table_schema = 'main' AND table_name NOT LIKE '\\_%' ESCAPE '\\'
             ORDER BY table_name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        names
            .into_iter()
            .map(|name| {
                let count = self.row_count(&name)?;
                Ok((name, count))
            })
            .collect()
    }

    /// Drops `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TableNotFound`] if the table does not exist, or
    /// another [`DbError`] if the drop fails.
    pub fn drop_table(&mut self, name: &str) -> Result<(), DbError> {
        validate_table_name(name)?;
        if !self.table_exists(name)? {
            return Err(DbError::TableNotFound {
                name: name.to_string(),
            });
        }
        self.conn.execute_batch(&format!("DROP TABLE {name}"))?;
        self.conn.execute(
            "DELETE FROM _fetch_history WHERE lower(table_name) = lower(?)",
            [name],
        )?;
        log::info!("Dropped table {name}");
        Ok(())
    }

    /// Returns every import recorded for `name`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub fn fetch_history(&self, name: &str) -> Result<Vec<(String, String, u64)>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT from_date::TEXT, to_date::TEXT, row_count
             FROM _fetch_history WHERE lower(table_name) = lower(?) ORDER BY fetched_at",
        )?;
        let rows = stmt
            .query_map([name], |row| {
                let count: i64 = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    u64::try_from(count).unwrap_or(0),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl EventSink for DuckDbSink {
    /// Identifiers are case-insensitive in `DuckDB`, so `Events` and
    /// `events` name the same table.
    fn table_exists(&self, name: &str) -> Result<bool, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM information_schema.tables
             WHERE table_schema = 'main' AND lower(table_name) = lower(?)",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_table(&mut self, name: &str, schema: &TableSchema) -> Result<(), DbError> {
        validate_table_name(name)?;
        if self.table_exists(name)? {
            return Err(DbError::TableExists {
                name: name.to_string(),
            });
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE {name} ({})",
            schema.column_definitions()
        ))?;
        log::debug!("Created table {name}");
        Ok(())
    }

    /// Uses multi-row INSERT with `ON CONFLICT DO NOTHING`, so rows already
    /// stored under the same `insert_id` are skipped.
    fn append_batch(&mut self, name: &str, rows: &[EventRow]) -> Result<u64, DbError> {
        validate_table_name(name)?;
        if rows.is_empty() {
            return Ok(0);
        }

        // Deduplicate within the batch: keep the last occurrence of each insert_id
        let mut last_seen: BTreeMap<&str, usize> = BTreeMap::new();
        for (i, row) in rows.iter().enumerate() {
            last_seen.insert(&row.insert_id, i);
        }
        let deduped: Vec<&EventRow> = rows
            .iter()
            .enumerate()
            .filter(|(i, row)| last_seen.get(row.insert_id.as_str()) == Some(i))
            .map(|(_, row)| row)
            .collect();

        if deduped.len() < rows.len() {
            log::debug!(
                "Deduplicated {name} batch: {} -> {} rows",
                rows.len(),
                deduped.len(),
            );
        }

        let tx = self.conn.transaction()?;
        let mut total_inserted = 0u64;

        for chunk in deduped.chunks(CHUNK_SIZE) {
            let placeholders = vec!["(?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO {name} (insert_id, event_name, event_time, distinct_id, properties)
                 VALUES {placeholders}
                 ON CONFLICT (insert_id) DO NOTHING"
            );

            let mut stmt = tx.prepare(&sql)?;
            let mut param_idx = 1usize;

            for row in chunk {
                stmt.raw_bind_parameter(param_idx, &row.insert_id)?;
                stmt.raw_bind_parameter(param_idx + 1, &row.event_name)?;
                stmt.raw_bind_parameter(
                    param_idx + 2,
                    row.event_time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                )?;
                stmt.raw_bind_parameter(param_idx + 3, row.distinct_id.as_deref())?;
                stmt.raw_bind_parameter(
                    param_idx + 4,
                    serde_json::Value::Object(row.properties.clone()).to_string(),
                )?;
                param_idx += PARAMS_PER_ROW;
            }

            let inserted = stmt.raw_execute()?;
            total_inserted += u64::try_from(inserted).unwrap_or(0);
        }

        tx.commit()?;
        Ok(total_inserted)
    }

    fn record_fetch(&mut self, record: &FetchRecord) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO _fetch_history (table_name, from_date, to_date, row_count, fetched_at)
             VALUES (?, ?, ?, ?, ?)",
            duckdb::params![
                record.table,
                record.from_date.format("%Y-%m-%d").to_string(),
                record.to_date.format("%Y-%m-%d").to_string(),
                i64::try_from(record.row_count).unwrap_or(i64::MAX),
                record.fetched_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate, Utc};
    use serde_json::{Map, json};

    use super::*;

    fn row(insert_id: &str, seconds: i64) -> EventRow {
        let mut properties = Map::new();
        properties.insert("plan".to_string(), json!("pro"));
        EventRow {
            insert_id: insert_id.to_string(),
            event_name: "Signup".to_string(),
            event_time: DateTime::<Utc>::from_timestamp(seconds, 0).unwrap(),
            distinct_id: Some("user-1".to_string()),
            properties,
        }
    }

    #[test]
    fn creates_table_once() {
        let mut sink = DuckDbSink::open_in_memory().unwrap();
        assert!(!sink.table_exists("events").unwrap());

        sink.create_table("events", &TableSchema::events()).unwrap();
        assert!(sink.table_exists("events").unwrap());

        let err = sink
            .create_table("events", &TableSchema::events())
            .unwrap_err();
        assert!(matches!(err, DbError::TableExists { .. }));
    }

    #[test]
    fn appends_and_skips_duplicate_insert_ids() {
        let mut sink = DuckDbSink::open_in_memory().unwrap();
        sink.create_table("events", &TableSchema::events()).unwrap();

        let inserted = sink
            .append_batch(
                "events",
                &[row("a", 1_704_067_200), row("b", 1_704_067_260), row("a", 1_704_067_200)],
            )
            .unwrap();
        assert_eq!(inserted, 2);

        let inserted = sink
            .append_batch("events", &[row("b", 1_704_067_260), row("c", 1_704_067_320)])
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(sink.row_count("events").unwrap(), 3);
    }

    #[test]
    fn lists_user_tables_only() {
        let mut sink = DuckDbSink::open_in_memory().unwrap();
        sink.create_table("signups", &TableSchema::events()).unwrap();
        sink.create_table("logins", &TableSchema::events()).unwrap();
        sink.append_batch("logins", &[row("x", 1_704_067_200)])
            .unwrap();

        let tables = sink.list_tables().unwrap();
        assert_eq!(
            tables,
            vec![("logins".to_string(), 1), ("signups".to_string(), 0)]
        );
    }

    #[test]
    fn drop_removes_table_and_history() {
        let mut sink = DuckDbSink::open_in_memory().unwrap();
        sink.create_table("events", &TableSchema::events()).unwrap();
        sink.record_fetch(&FetchRecord {
            table: "events".to_string(),
            from_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            row_count: 10,
            fetched_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(
            sink.fetch_history("events").unwrap(),
            vec![("2024-01-01".to_string(), "2024-01-31".to_string(), 10)]
        );

        sink.drop_table("events").unwrap();
        assert!(!sink.table_exists("events").unwrap());
        assert!(sink.fetch_history("events").unwrap().is_empty());
        assert!(matches!(
            sink.drop_table("events"),
            Err(DbError::TableNotFound { .. })
        ));
    }

    #[test]
    fn table_lookup_ignores_case() {
        let mut sink = DuckDbSink::open_in_memory().unwrap();
        sink.create_table("Events", &TableSchema::events()).unwrap();

        assert!(sink.table_exists("events").unwrap());
        assert!(sink.table_exists("EVENTS").unwrap());
        assert!(matches!(
            sink.create_table("events", &TableSchema::events()),
            Err(DbError::TableExists { .. })
        ));
        sink.append_batch("events", &[row("a", 1_704_067_200)])
            .unwrap();
        assert_eq!(sink.row_count("EVENTS").unwrap(), 1);
    }

    #[test]
    fn rejects_invalid_table_names() {
        let mut sink = DuckDbSink::open_in_memory().unwrap();
        assert!(matches!(
            sink.create_table("bad name", &TableSchema::events()),
            Err(DbError::InvalidTableName { .. })
        ));
    }
}
