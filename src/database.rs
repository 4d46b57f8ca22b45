//! # Installed-Package Database
//!
//! Persistent record of what is installed, where, and with which declared
//! dependencies. The on-disk format is a JSON array of rows in a single
//! file under the prefix; a corrupt file is demoted to a warning and an
//! empty database so a damaged installation stays usable.

use chrono::Utc;
use fs_err as fs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::util::atomic_write;

/// File name of the database, relative to the prefix.
pub const DB_FILE: &str = "tsi-installed.json";

/// Database error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to write database {path}: {msg}")]
    Write { path: PathBuf, msg: String },

    #[error("Failed to serialize database: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One installed package. `name` is the primary key: only one version of a
/// given name is installed at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub install_path: PathBuf,
    /// Epoch seconds.
    pub installed_at: i64,
    /// Dependency list as declared by the recipe at install time.
    pub dependencies: Vec<String>,
}

/// The installed-package database bound to its backing file.
#[derive(Debug)]
pub struct InstalledDb {
    path: PathBuf,
    rows: Vec<InstalledPackage>,
}

impl InstalledDb {
    /// Load the database that lives under `prefix`, creating an empty one
    /// in memory when the file is absent or unreadable.
    pub fn open(prefix: &Path) -> Self {
        Self::load(prefix.join(DB_FILE))
    }

    pub fn load(path: PathBuf) -> Self {
        let rows = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Vec<InstalledPackage>>(&text) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(
                        "Installed-package database {} is corrupt ({}); starting fresh",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(
                    "Cannot read installed-package database {}: {}; starting fresh",
                    path.display(),
                    e
                );
                Vec::new()
            }
        };

        debug!(
            "Installed-package database {} holds {} row(s)",
            path.display(),
            rows.len()
        );
        InstalledDb { path, rows }
    }

    pub fn save(&self) -> Result<(), DatabaseError> {
        let text = serde_json::to_string_pretty(&self.rows)?;
        atomic_write(&self.path, text.as_bytes()).map_err(|e| DatabaseError::Write {
            path: self.path.clone(),
            msg: e.to_string(),
        })
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.rows.iter().any(|r| r.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.rows.iter().find(|r| r.name == name)
    }

    /// Insert a row, replacing any existing row with the same name.
    pub fn add(&mut self, name: &str, version: &str, install_path: &Path, deps: Vec<String>) {
        self.rows.retain(|r| r.name != name);
        self.rows.push(InstalledPackage {
            name: name.to_string(),
            version: version.to_string(),
            install_path: install_path.to_path_buf(),
            installed_at: Utc::now().timestamp(),
            dependencies: deps,
        });
    }

    /// Delete the row for `name`, returning it when present.
    pub fn remove(&mut self, name: &str) -> Option<InstalledPackage> {
        let idx = self.rows.iter().position(|r| r.name == name)?;
        Some(self.rows.remove(idx))
    }

    pub fn packages(&self) -> &[InstalledPackage] {
        &self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let mut db = InstalledDb::open(dir.path());
        db.add(
            "zlib",
            "1.3.1",
            Path::new("/opt/t"),
            vec!["m4".to_string()],
        );
        db.add("bash", "5.2", Path::new("/opt/t"), Vec::new());
        db.save().unwrap();

        let reloaded = InstalledDb::open(dir.path());
        assert_eq!(reloaded.packages(), db.packages());
        assert!(reloaded.is_installed("zlib"));
        assert_eq!(reloaded.get("bash").unwrap().version, "5.2");
    }

    #[test]
    fn test_add_replaces_by_name() {
        let dir = tempdir().unwrap();
        let mut db = InstalledDb::open(dir.path());
        db.add("tool", "1.0", Path::new("/opt/t"), Vec::new());
        db.add("tool", "2.0", Path::new("/opt/t"), Vec::new());

        assert_eq!(db.packages().len(), 1);
        assert_eq!(db.get("tool").unwrap().version, "2.0");
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let mut db = InstalledDb::open(dir.path());
        db.add("tool", "1.0", Path::new("/opt/t"), Vec::new());

        assert!(db.remove("tool").is_some());
        assert!(db.remove("tool").is_none());
        assert!(!db.is_installed("tool"));
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(DB_FILE), "{{ not json").unwrap();

        let db = InstalledDb::open(dir.path());
        assert!(db.packages().is_empty());
        // saving recovers the file
        db.save().unwrap();
        let reloaded = InstalledDb::open(dir.path());
        assert!(reloaded.packages().is_empty());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let db = InstalledDb::open(dir.path());
        assert!(db.packages().is_empty());
    }
}
