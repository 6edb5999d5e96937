//! Durable registry lookup cache.
//!
//! This module provides the append-only JSONL store that makes lookup
//! results resumable across restarts and safe to share between shard
//! processes. The log file is the source of truth; an in-memory index
//! rebuilt at startup serves reads without any I/O.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use log::{info, warn};
use thiserror::Error;

use crate::models::{CacheEntry, RdapResult};

/// Errors that can occur during cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache index poisoned")]
    Poisoned,
}

/// Append-only lookup result cache keyed by IP address.
///
/// Writes are single-line appends flushed before `put` returns, so
/// concurrent shards appending to the same path interleave at line
/// granularity without corrupting each other. Reload replays the log in
/// order and keeps the last entry per IP.
pub struct RdapCache {
    path: PathBuf,
    index: RwLock<HashMap<String, RdapResult>>,
    writer: Mutex<Option<File>>,
}

impl RdapCache {
    /// Open a cache at the given log path, replaying any existing log
    /// into the in-memory index. The file is created on first `put`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let index = Self::load(&path)?;
        if !index.is_empty() {
            info!("loaded {} cached lookups from {}", index.len(), path.display());
        }
        Ok(Self {
            path,
            index: RwLock::new(index),
            writer: Mutex::new(None),
        })
    }

    /// Replay the append-only log, last entry per IP wins. Malformed
    /// lines (e.g. a partial trailing line from a crashed run) are
    /// skipped with a warning, never fatal.
    fn load(path: &Path) -> Result<HashMap<String, RdapResult>, CacheError> {
        let mut index = HashMap::new();
        if !path.exists() {
            return Ok(index);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CacheEntry>(&line) {
                Ok(entry) => {
                    index.insert(entry.ip, entry.data);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                "skipped {} malformed line(s) while reloading {}",
                skipped,
                path.display()
            );
        }
        Ok(index)
    }

    /// Return a previously cached result without any network access
    pub fn get(&self, ip: &str) -> Option<RdapResult> {
        self.index.read().ok()?.get(ip).cloned()
    }

    /// Number of distinct IPs in the index
    pub fn len(&self) -> usize {
        self.index.read().map(|index| index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Durably record a lookup result: one self-contained line appended
    /// to the log and flushed before the in-memory index is updated.
    pub fn put(&self, ip: &str, result: RdapResult) -> Result<(), CacheError> {
        let entry = CacheEntry::new(ip, result.clone());
        let line = serde_json::to_string(&entry)?;

        {
            let mut writer = self.writer.lock().map_err(|_| CacheError::Poisoned)?;
            if writer.is_none() {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                *writer = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
            }
            let file = writer.as_mut().ok_or(CacheError::Poisoned)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }

        self.index
            .write()
            .map_err(|_| CacheError::Poisoned)?
            .insert(ip.to_string(), result);
        Ok(())
    }
}
