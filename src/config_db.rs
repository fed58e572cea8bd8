use std::path::{Path, PathBuf};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::{Error, Result},
    walker::{DEFAULT_EXTENSIONS, ScanMethod},
};

/// Directory path -> role ("include" or "exclude").
const DIRECTORIES: TableDefinition<&str, &str> =
    TableDefinition::new("directories");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

const INCLUDE: &str = "include";
const EXCLUDE: &str = "exclude";

pub mod keys {
    pub const SCAN_METHOD: &str = "scan_method";
    pub const DEEP_SCAN: &str = "deep_scan";
    pub const EXTENSIONS: &str = "extensions";
    pub const MAX_WORKERS: &str = "max_workers";

    pub const ALL: &[&str] = &[SCAN_METHOD, DEEP_SCAN, EXTENSIONS, MAX_WORKERS];
}

/// Whether a registered directory is scanned or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRole {
    Include,
    Exclude,
}

impl DirRole {
    pub fn as_str(self) -> &'static str {
        match self {
            DirRole::Include => INCLUDE,
            DirRole::Exclude => EXCLUDE,
        }
    }
}

/// Persistent scan configuration: include/exclude directories and settings.
pub struct ConfigDb {
    db: Database,
}

impl ConfigDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DIRECTORIES)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Directories --

    pub fn set_directory(&self, path: &str, role: DirRole) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DIRECTORIES)?;
            table.insert(path, role.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn remove_directory(&self, path: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DIRECTORIES)?;
            table.remove(path)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// All registered directories with their role, sorted by path.
    pub fn list_directories(&self) -> Result<Vec<(String, DirRole)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DIRECTORIES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let role = if v.value() == EXCLUDE {
                DirRole::Exclude
            } else {
                DirRole::Include
            };
            result.push((k.value().to_string(), role));
        }
        Ok(result)
    }

    pub fn directories(&self, role: DirRole) -> Result<Vec<PathBuf>> {
        Ok(self
            .list_directories()?
            .into_iter()
            .filter(|(_, r)| *r == role)
            .map(|(path, _)| PathBuf::from(path))
            .collect())
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }
}

impl std::fmt::Debug for ConfigDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDb").finish_non_exhaustive()
    }
}

/// A validated scan configuration assembled from [`ConfigDb`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub include: Vec<PathBuf>,
    pub exclude: Vec<PathBuf>,
    pub method: ScanMethod,
    /// Compute per-image fingerprints when saving the path index.
    pub deep_scan: bool,
    pub extensions: Vec<String>,
    pub max_workers: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            method: ScanMethod::Default,
            deep_scan: false,
            extensions: DEFAULT_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            max_workers: None,
        }
    }
}

impl ScanConfig {
    /// Read and validate the stored configuration.
    ///
    /// Malformed settings are reported as [`Error::Config`]; an empty
    /// include list is left for the scanner to reject.
    pub fn from_db(db: &ConfigDb) -> Result<Self> {
        let defaults = Self::default();

        let method = match db.get_setting(keys::SCAN_METHOD)? {
            Some(value) => value.parse()?,
            None => defaults.method,
        };
        let deep_scan = match db.get_setting(keys::DEEP_SCAN)? {
            Some(value) => parse_bool(keys::DEEP_SCAN, &value)?,
            None => defaults.deep_scan,
        };
        let extensions = match db.get_setting(keys::EXTENSIONS)? {
            Some(value) => parse_extensions(&value)?,
            None => defaults.extensions,
        };
        let max_workers = match db.get_setting(keys::MAX_WORKERS)? {
            Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
                Error::Config(format!(
                    "max_workers must be a positive integer, got '{value}'"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            include: db.directories(DirRole::Include)?,
            exclude: db.directories(DirRole::Exclude)?,
            method,
            deep_scan,
            extensions,
            max_workers,
        })
    }
}

/// Validate a `key=value` pair before it is persisted.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    match key {
        keys::SCAN_METHOD => value.parse::<ScanMethod>().map(|_| ()),
        keys::DEEP_SCAN => parse_bool(key, value).map(|_| ()),
        keys::EXTENSIONS => parse_extensions(value).map(|_| ()),
        keys::MAX_WORKERS => match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(()),
            _ => Err(Error::Config(format!(
                "max_workers must be a positive integer, got '{value}'"
            ))),
        },
        other => Err(Error::Config(format!(
            "unknown setting '{other}' (expected one of: {})",
            keys::ALL.join(", ")
        ))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{key} must be true or false, got '{value}'"
        ))),
    }
}

fn parse_extensions(value: &str) -> Result<Vec<String>> {
    let exts: Vec<String> = value
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    if exts.is_empty() {
        return Err(Error::Config(
            "extensions must list at least one file extension".into(),
        ));
    }
    Ok(exts)
}
