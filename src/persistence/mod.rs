//! Persistence Module
//!
//! Handles storage of the risk state snapshot and the append-only trade history.
//!
//! Implements:
//! - `StateStore` repository trait (load / save of a serialized snapshot)
//! - `JsonFileStore`: atomic write (tmp file, fsync, rename)
//! - `MemoryStore`: in-process store for tests and dry runs
//! - `CsvTradeLog`: one `TradeRecord` per row, header written once

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use csv::WriterBuilder;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::TradeRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("state snapshot is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Repository for the serialized risk state
pub trait StateStore: Send + Sync {
    /// Raw snapshot contents, `None` when nothing has been saved yet
    fn load_raw(&self) -> Result<Option<String>, StoreError>;

    /// Replace the stored snapshot
    fn save_raw(&self, contents: &str) -> Result<(), StoreError>;
}

/// Typed helpers over any `StateStore`
pub fn load_json<T: DeserializeOwned>(store: &dyn StateStore) -> Result<Option<T>, StoreError> {
    match store.load_raw()? {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(e.to_string())),
    }
}

pub fn save_json<T: Serialize>(store: &dyn StateStore, value: &T) -> Result<(), StoreError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    store.save_raw(&json)
}

/// JSON snapshot on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn load_raw(&self) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&self.path)
            .map(Some)
            .map_err(|e| StoreError::io(&self.path, e))
    }

    fn save_raw(&self, contents: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "💾 [STORE] Snapshot written");
        Ok(())
    }
}

/// Snapshot held in memory only
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: RwLock::new(Some(contents.into())),
        }
    }
}

impl StateStore for MemoryStore {
    fn load_raw(&self) -> Result<Option<String>, StoreError> {
        match self.contents.read() {
            Ok(guard) => Ok(guard.clone()),
            Err(poisoned) => Ok(poisoned.into_inner().clone()),
        }
    }

    fn save_raw(&self, contents: &str) -> Result<(), StoreError> {
        let mut guard = match self.contents.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(contents.to_string());
        Ok(())
    }
}

/// Append-only CSV trade history
pub struct CsvTradeLog {
    path: PathBuf,
    writer: Mutex<csv::Writer<fs::File>>,
}

impl std::fmt::Debug for CsvTradeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvTradeLog")
            .field("path", &self.path)
            .finish()
    }
}

impl CsvTradeLog {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create trade log directory")?;
            }
        }
        let writer = Self::create_writer(&path)?;
        info!(path = %path.display(), "📒 [HISTORY] Trade log opened");
        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// Create CSV writer, headers only when the file is new or empty
    fn create_writer(path: &Path) -> anyhow::Result<csv::Writer<fs::File>> {
        use anyhow::Context;

        let file_has_data = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open trade log")?;

        Ok(WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &TradeRecord) -> anyhow::Result<()> {
        use anyhow::{anyhow, Context};

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("trade log writer poisoned"))?;
        writer
            .serialize(record)
            .context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade log")?;
        Ok(())
    }
}
