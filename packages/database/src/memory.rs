//! In-memory [`EventSink`].
//!
//! Clones share one underlying store, so a caller can hand one clone to
//! the pipeline and inspect the other afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use eventsync_source_models::EventRow;

use crate::{DbError, EventSink, FetchRecord, TableSchema, validate_table_name};

#[derive(Default)]
struct MemoryTable {
    rows: Vec<EventRow>,
    keys: BTreeSet<String>,
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    create_calls: usize,
    append_calls: usize,
    failing_appends: usize,
    history: Vec<FetchRecord>,
}

/// [`EventSink`] that keeps rows in memory, with the same de-duplication
/// semantics as the `DuckDB` sink.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` calls to [`EventSink::append_batch`] fail
    /// without writing anything.
    pub fn fail_next_appends(&self, count: usize) {
        self.lock().failing_appends = count;
    }

    /// Returns a copy of every row stored in `name`, in insertion order.
    #[must_use]
    pub fn rows(&self, name: &str) -> Vec<EventRow> {
        self.lock()
            .tables
            .get(&table_key(name))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Returns the number of rows stored in `name`.
    #[must_use]
    pub fn row_count(&self, name: &str) -> usize {
        self.lock()
            .tables
            .get(&table_key(name))
            .map_or(0, |t| t.rows.len())
    }

    /// Number of successful [`EventSink::create_table`] calls.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    /// Number of [`EventSink::append_batch`] calls, including failed ones.
    #[must_use]
    pub fn append_calls(&self) -> usize {
        self.lock().append_calls
    }

    /// Imports recorded through [`EventSink::record_fetch`].
    #[must_use]
    pub fn history(&self) -> Vec<FetchRecord> {
        self.lock().history.clone()
    }
}

/// Table names compare case-insensitively, as they do in `DuckDB`.
fn table_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl EventSink for MemorySink {
    fn table_exists(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.lock().tables.contains_key(&table_key(name)))
    }

    fn create_table(&mut self, name: &str, _schema: &TableSchema) -> Result<(), DbError> {
        validate_table_name(name)?;
        let mut state = self.lock();
        let key = table_key(name);
        if state.tables.contains_key(&key) {
            return Err(DbError::TableExists {
                name: name.to_string(),
            });
        }
        state.tables.insert(key, MemoryTable::default());
        state.create_calls += 1;
        Ok(())
    }

    fn append_batch(&mut self, name: &str, rows: &[EventRow]) -> Result<u64, DbError> {
        let mut state = self.lock();
        state.append_calls += 1;

        if state.failing_appends > 0 {
            state.failing_appends -= 1;
            return Err(DbError::Write {
                message: format!("injected failure appending to {name}"),
            });
        }

        let table = state
            .tables
            .get_mut(&table_key(name))
            .ok_or_else(|| DbError::TableNotFound {
                name: name.to_string(),
            })?;

        let mut inserted = 0u64;
        for row in rows {
            if table.keys.insert(row.insert_id.clone()) {
                table.rows.push(row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn record_fetch(&mut self, record: &FetchRecord) -> Result<(), DbError> {
        self.lock().history.push(record.clone());
        Ok(())
    }
}
