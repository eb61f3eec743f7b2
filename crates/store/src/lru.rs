//! Recency tracking for eviction
//!
//! One append-only JSON-lines journal records every touch of a uid record
//! (`U:` keys) or blob (`H:` keys); uid and blob entries share a single
//! timeline because evicting a uid record should also make its blobs
//! eligible. A direct last-usage index filters stale journal entries
//! during a sweep: an entry whose sequence number no longer matches the
//! latest touch for its key is skipped without side effects.
//!
//! Restores may defer the re-touch of a uid's blob references to sweep
//! time via [`LruIndex::defer`]; draining the deferred queue needs
//! manifest access and lives in the compaction layer.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiln_core::{CancelToken, ContentHash, Uid};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{io_at, Error, Result};

/// Journal key for a uid record.
#[must_use]
pub fn uid_key(uid: &Uid) -> String {
    format!("U:{uid}")
}

/// Journal key for a blob.
#[must_use]
pub fn hash_key(hash: &ContentHash) -> String {
    format!("H:{hash}")
}

/// The two key namespaces sharing the LRU timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind<'a> {
    Uid(&'a str),
    Hash(&'a str),
}

/// Splits a journal key into its namespace and raw value.
#[must_use]
pub fn parse_key(key: &str) -> Option<KeyKind<'_>> {
    key.strip_prefix("U:")
        .map(KeyKind::Uid)
        .or_else(|| key.strip_prefix("H:").map(KeyKind::Hash))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    key: String,
    ts: i64,
    seq: u64,
    size: u64,
}

/// Latest recorded usage of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub ts: DateTime<Utc>,
    pub seq: u64,
    /// On-disk footprint of the key's file at touch time.
    pub size: u64,
}

/// What the eraser wants done with a visited entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SieveDecision {
    Keep,
    Erase,
    /// Halt the sweep immediately; everything newer survives.
    Stop,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SieveSummary {
    pub visited: u64,
    pub stale_skipped: u64,
    pub erased: u64,
    pub stopped_early: bool,
}

pub struct LruIndex {
    path: PathBuf,
    /// Journal entries in append order, including stale duplicates.
    entries: Vec<JournalEntry>,
    last: HashMap<String, Usage>,
    next_seq: u64,
    total_size: u64,
    deferred: Vec<Uid>,
    writer: BufWriter<File>,
}

impl LruIndex {
    /// Loads the journal at `path`, creating it if absent.
    ///
    /// Unparsable lines (from a crashed writer) are skipped with a
    /// warning; the next sweep's rewrite drops them permanently.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();
        let mut last: HashMap<String, Usage> = HashMap::new();
        let mut next_seq = 0u64;

        match File::open(&path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line.map_err(io_at("read usage journal", &path))?;
                    if line.is_empty() {
                        continue;
                    }
                    let entry: JournalEntry = match serde_json::from_str(&line) {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!(error = %e, "skipping corrupt usage journal line");
                            continue;
                        }
                    };
                    next_seq = next_seq.max(entry.seq + 1);
                    last.insert(
                        entry.key.clone(),
                        Usage {
                            ts: DateTime::from_timestamp(entry.ts, 0).unwrap_or(DateTime::UNIX_EPOCH),
                            seq: entry.seq,
                            size: entry.size,
                        },
                    );
                    entries.push(entry);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_at("open usage journal", &path)(e)),
        }

        let total_size = last.values().map(|u| u.size).sum();
        let writer = Self::open_writer(&path)?;
        debug!(
            path = %path.display(),
            live = last.len(),
            lines = entries.len(),
            total_size,
            "loaded usage journal"
        );

        Ok(Self {
            path,
            entries,
            last,
            next_seq,
            total_size,
            deferred: Vec::new(),
            writer,
        })
    }

    fn open_writer(path: &Path) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_at("open usage journal", path))?;
        Ok(BufWriter::new(file))
    }

    /// Records a use of `key` with its current on-disk footprint.
    pub fn touch(&mut self, key: &str, size: u64) -> Result<()> {
        let now = Utc::now();
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = JournalEntry {
            key: key.to_string(),
            ts: now.timestamp(),
            seq,
            size,
        };
        let line = serde_json::to_string(&entry).map_err(|e| Error::serialization(e.to_string()))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .map_err(io_at("append to usage journal", &self.path))?;

        if let Some(prev) = self.last.insert(key.to_string(), Usage { ts: now, seq, size }) {
            self.total_size -= prev.size;
        }
        self.total_size += size;
        self.entries.push(entry);
        Ok(())
    }

    /// Re-records a use of a key already in the index, keeping its size.
    ///
    /// Returns whether the key was known; unknown keys are left alone.
    pub fn retouch(&mut self, key: &str) -> Result<bool> {
        match self.last.get(key) {
            Some(usage) => {
                let size = usage.size;
                self.touch(key, size)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Queues a uid whose blob references should be re-touched at the
    /// start of the next sweep.
    pub fn defer(&mut self, uid: &Uid) {
        self.deferred.push(uid.clone());
    }

    /// Takes the queued deferred re-touches.
    pub fn take_deferred(&mut self) -> Vec<Uid> {
        mem::take(&mut self.deferred)
    }

    #[must_use]
    pub fn last_usage(&self, key: &str) -> Option<Usage> {
        self.last.get(key).copied()
    }

    /// Sum of the recorded sizes of all live keys.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of live keys.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.last.len()
    }

    /// Iterates live keys with their latest usage, in no particular order.
    pub fn live(&self) -> impl Iterator<Item = (&str, Usage)> {
        self.last.iter().map(|(k, u)| (k.as_str(), *u))
    }

    /// Drops a key from the index without visiting the journal.
    ///
    /// Returns the recorded size, if the key was live. The journal line
    /// stays until the next [`rewrite`](Self::rewrite).
    pub fn forget(&mut self, key: &str) -> Option<u64> {
        let usage = self.last.remove(key)?;
        self.total_size -= usage.size;
        Some(usage.size)
    }

    /// Sweeps the journal oldest-first.
    ///
    /// Each live entry still matching the last-usage index is handed to
    /// `eraser(last_used, key, size)`; stale duplicates are skipped
    /// without side effects. The eraser performs any deletion itself and
    /// returns whether to keep the entry, erase it from the index, or
    /// stop the sweep. The journal is rewritten to the surviving entries
    /// even when the sweep stops early or fails.
    pub fn sieve<F>(&mut self, cancel: &CancelToken, mut eraser: F) -> Result<SieveSummary>
    where
        F: FnMut(DateTime<Utc>, &str, u64) -> Result<SieveDecision>,
    {
        let entries = mem::take(&mut self.entries);
        let mut summary = SieveSummary::default();
        let mut outcome: Result<()> = Ok(());

        for entry in &entries {
            if let Err(e) = cancel.check() {
                outcome = Err(e.into());
                break;
            }
            let Some(current) = self.last.get(&entry.key) else {
                summary.stale_skipped += 1;
                continue;
            };
            if current.seq != entry.seq {
                summary.stale_skipped += 1;
                continue;
            }
            summary.visited += 1;
            match eraser(current.ts, &entry.key, current.size) {
                Ok(SieveDecision::Keep) => {}
                Ok(SieveDecision::Erase) => {
                    if let Some(usage) = self.last.remove(&entry.key) {
                        self.total_size -= usage.size;
                    }
                    summary.erased += 1;
                }
                Ok(SieveDecision::Stop) => {
                    summary.stopped_early = true;
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = self.rewrite() {
            if outcome.is_ok() {
                outcome = Err(e);
            } else {
                warn!(error = %e, "usage journal rewrite failed after sweep error");
            }
        }
        outcome?;
        Ok(summary)
    }

    /// Atomically rewrites the journal to the live entries only.
    pub fn rewrite(&mut self) -> Result<()> {
        let mut live: Vec<JournalEntry> = self
            .last
            .iter()
            .map(|(key, usage)| JournalEntry {
                key: key.clone(),
                ts: usage.ts.timestamp(),
                seq: usage.seq,
                size: usage.size,
            })
            .collect();
        live.sort_by_key(|e| e.seq);

        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::configuration("usage journal path has no parent directory"))?;
        let mut tmp =
            NamedTempFile::new_in(parent).map_err(io_at("create temp journal in", parent))?;
        for entry in &live {
            let line =
                serde_json::to_string(entry).map_err(|e| Error::serialization(e.to_string()))?;
            tmp.write_all(line.as_bytes())
                .and_then(|()| tmp.write_all(b"\n"))
                .map_err(io_at("write temp journal", &self.path))?;
        }
        tmp.persist(&self.path).map_err(|e| {
            Error::io(
                format!("failed to persist usage journal {}", self.path.display()),
                e.error,
            )
        })?;

        self.writer = Self::open_writer(&self.path)?;
        debug!(live = live.len(), "rewrote usage journal");
        self.entries = live;
        Ok(())
    }
}
