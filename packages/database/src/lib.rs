#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Local event store.
//!
//! The ingest pipeline writes through the [`EventSink`] trait. Two sinks
//! are provided: [`event_db::DuckDbSink`] (the embedded analytical store)
//! and [`memory::MemorySink`] (tests and embedding callers).
//!
//! Sinks are single-writer: the pipeline moves the sink onto its writer
//! thread for the whole run and hands it back afterwards.

pub mod event_db;
pub mod memory;
pub mod paths;

use chrono::{DateTime, NaiveDate, Utc};
use eventsync_source_models::EventRow;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error (creating the data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The table was expected to be absent.
    #[error("Table '{name}' already exists")]
    TableExists {
        /// Table name.
        name: String,
    },

    /// The table was expected to exist.
    #[error("Table '{name}' does not exist")]
    TableNotFound {
        /// Table name.
        name: String,
    },

    /// The table name cannot be used as a SQL identifier.
    #[error("Invalid table name '{name}': {reason}")]
    InvalidTableName {
        /// Rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Writing failed for a reason the sink describes itself.
    #[error("Write failed: {message}")]
    Write {
        /// Description of what went wrong.
        message: String,
    },
}

/// SQL type of a [`Column`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Variable-length text.
    Text,
    /// Timestamp stored in UTC.
    Timestamp,
}

impl ColumnType {
    const fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Timestamp => "TIMESTAMP",
        }
    }
}

/// A single column of a [`TableSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: &'static str,
    /// Column type.
    pub column_type: ColumnType,
    /// Whether `NULL` is allowed.
    pub nullable: bool,
}

/// Layout of a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Columns in insertion order.
    pub columns: Vec<Column>,
    /// Column holding the stable content key.
    pub primary_key: &'static str,
}

impl TableSchema {
    /// Schema of an event table, matching [`EventRow`].
    #[must_use]
    pub fn events() -> Self {
        let column = |name, column_type, nullable| Column {
            name,
            column_type,
            nullable,
        };
        Self {
            columns: vec![
                column("insert_id", ColumnType::Text, false),
                column("event_name", ColumnType::Text, false),
                column("event_time", ColumnType::Timestamp, false),
                column("distinct_id", ColumnType::Text, true),
                column("properties", ColumnType::Text, false),
            ],
            primary_key: "insert_id",
        }
    }

    /// Renders the column list for a `CREATE TABLE` statement.
    #[must_use]
    pub fn column_definitions(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", c.name, c.column_type.sql());
                if !c.nullable {
                    def.push_str(" NOT NULL");
                }
                if c.name == self.primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                def
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One completed import, recorded next to the imported data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    /// Destination table.
    pub table: String,
    /// First day of the requested range.
    pub from_date: NaiveDate,
    /// Last day of the requested range.
    pub to_date: NaiveDate,
    /// Rows written by this import.
    pub row_count: u64,
    /// When the import finished.
    pub fetched_at: DateTime<Utc>,
}

/// Destination for imported rows.
///
/// Implementations are only ever used from one thread at a time.
pub trait EventSink: Send {
    /// Returns `true` if `name` exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the lookup fails.
    fn table_exists(&self, name: &str) -> Result<bool, DbError>;

    /// Creates `name` with `schema`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::TableExists`] if the table is already present,
    /// or another [`DbError`] if creation fails.
    fn create_table(&mut self, name: &str, schema: &TableSchema) -> Result<(), DbError>;

    /// Appends `rows` to `name` in one batch. Rows whose `insert_id` is
    /// already stored are skipped.
    ///
    /// Returns the number of rows actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the write fails.
    fn append_batch(&mut self, name: &str, rows: &[EventRow]) -> Result<u64, DbError>;

    /// Records a completed import. The default implementation does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the record cannot be stored.
    fn record_fetch(&mut self, _record: &FetchRecord) -> Result<(), DbError> {
        Ok(())
    }
}

/// Checks that `name` is usable as an unquoted SQL identifier for a user
/// table: an ASCII letter followed by letters, digits or underscores.
///
/// Names starting with `_` are reserved for internal tables.
///
/// # Errors
///
/// Returns [`DbError::InvalidTableName`] describing the first problem.
pub fn validate_table_name(name: &str) -> Result<(), DbError> {
    let invalid = |reason| {
        Err(DbError::InvalidTableName {
            name: name.to_string(),
            reason,
        })
    };

    let Some(first) = name.chars().next() else {
        return invalid("name is empty");
    };
    if first == '_' {
        return invalid("names starting with '_' are reserved");
    }
    if !first.is_ascii_alphabetic() {
        return invalid("name must start with a letter");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("only letters, digits and '_' are allowed");
    }
    if name.len() > 63 {
        return invalid("name is longer than 63 characters");
    }
    Ok(())
}
