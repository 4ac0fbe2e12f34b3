#![allow(clippy::module_name_repetitions)]
//! Canonical file paths for the `DuckDB` data directory.
//!
//! The default database lives under the project root's `data/`
//! directory; `EVENTSYNC_DB` overrides it.

use std::path::{Path, PathBuf};

/// Environment variable overriding [`default_db_path`].
pub const DB_PATH_ENV: &str = "EVENTSYNC_DB";

/// Returns the workspace root directory.
///
/// Resolved at compile time from `CARGO_MANIFEST_DIR`; falls back to the
/// current directory if the manifest sits less than two levels deep.
#[must_use]
pub fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Returns the `data/` directory path.
#[must_use]
pub fn data_dir() -> PathBuf {
    project_root().join("data")
}

/// Returns the database path: `EVENTSYNC_DB` if set, otherwise
/// `data/eventsync.duckdb`.
#[must_use]
pub fn default_db_path() -> PathBuf {
    std::env::var_os(DB_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map_or_else(|| data_dir().join("eventsync.duckdb"), PathBuf::from)
}

/// Resolves an explicit `--db` argument, falling back to
/// [`default_db_path`].
#[must_use]
pub fn resolve_db_path(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(default_db_path, Path::to_path_buf)
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.as_os_str().is_empty() && !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins() {
        let explicit = Path::new("/tmp/custom.duckdb");
        assert_eq!(resolve_db_path(Some(explicit)), explicit);
    }

    #[test]
    fn data_dir_is_under_project_root() {
        assert!(data_dir().starts_with(project_root()));
        assert!(data_dir().ends_with("data"));
    }
}
