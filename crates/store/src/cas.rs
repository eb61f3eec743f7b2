//! Content-addressed blob storage
//!
//! Blobs live under a two-level hex-bucketed layout,
//! `<root>/<hex0>/<hex1>/<full-hash>`, where the bucket levels are the
//! first two characters of the hash. The layout is part of the on-disk
//! format shared with other processes, so it must not change. Writes go
//! through a temp file in the store root and an atomic rename, which makes
//! the directory safe for concurrent multi-process use; rename races
//! resolve by overwrite, never by error.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kiln_core::hashio::{self, HashingWriter};
use kiln_core::{CancelToken, Codec, ContentHash};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{io_at, Error, Result};

/// Where a put landed.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub hash: ContentHash,
    /// Stored (possibly encoded) size in bytes.
    pub size: u64,
    pub path: PathBuf,
    /// Permission bits of the source file.
    pub source_mode: u32,
}

/// Result of a blob garbage-collection sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GcSummary {
    pub scanned: u64,
    pub deleted: u64,
    pub freed_bytes: u64,
}

/// The local content-addressed blob store.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (creating if needed) a blob store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_at("create blob store root", &root))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.as_hex();
        self.root.join(&hex[0..1]).join(&hex[1..2]).join(hex)
    }

    #[must_use]
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.blob_path(hash).is_file()
    }

    /// Stored size of a blob.
    pub fn size_of(&self, hash: &ContentHash) -> Result<u64> {
        let path = self.blob_path(hash);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_in_cache(hash.as_hex()))
            }
            Err(e) => Err(io_at("stat blob", &path)(e)),
        }
    }

    /// Streams `source` into the store through `codec`, returning where it
    /// landed.
    ///
    /// The content hash covers the stored bytes, i.e. the encoded form.
    /// Re-putting identical content is a cheap no-op.
    pub fn put_file(&self, source: &Path, codec: Codec) -> Result<StoredBlob> {
        let source_meta = match fs::metadata(source) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::file_not_found(source));
            }
            Err(e) => return Err(io_at("stat source", source)(e)),
        };
        let source_mode = source_meta.permissions().mode() & 0o777;

        let file = File::open(source).map_err(io_at("open source", source))?;
        let mut reader = BufReader::new(file);

        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(io_at("create temp file in", &self.root))?;
        let mut writer = HashingWriter::new(&mut tmp);
        hashio::copy_encoded(&mut reader, &mut writer, codec)
            .map_err(io_at("write blob for", source))?;
        let (_, hash, size) = writer.finish();

        let dest = self.blob_path(&hash);
        if dest.is_file() {
            debug!(hash = %hash, "blob already stored");
            return Ok(StoredBlob {
                hash,
                size,
                path: dest,
                source_mode,
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_at("create blob bucket", parent))?;
        }
        let stored_mode = match codec {
            // Uncompressed blobs keep the source permissions so restores of
            // the same mode can hardlink instead of copying.
            Codec::None => source_mode,
            Codec::Zstd => 0o644,
        };
        tmp.persist(&dest)
            .map_err(|e| Error::io(format!("failed to persist blob {}", dest.display()), e.error))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(stored_mode))
            .map_err(io_at("set blob permissions on", &dest))?;

        debug!(hash = %hash, size, codec = codec.as_str(), "stored blob");
        Ok(StoredBlob {
            hash,
            size,
            path: dest,
            source_mode,
        })
    }

    /// Materializes a blob at `dest`, decoding with `codec` and applying
    /// `mode` (defaulting to the stored permissions).
    ///
    /// When the blob is uncompressed and its stored permissions already
    /// match the requested mode, the file is hardlinked instead of copied.
    /// Returns the number of bytes materialized.
    pub fn extract_file(
        &self,
        hash: &ContentHash,
        dest: &Path,
        codec: Codec,
        mode: Option<u32>,
    ) -> Result<u64> {
        let src = self.blob_path(hash);
        let src_meta = match fs::metadata(&src) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_in_cache(hash.as_hex()));
            }
            Err(e) => return Err(io_at("stat blob", &src)(e)),
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_at("create output directory", parent))?;
        }
        match fs::remove_file(dest) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_at("replace existing output", dest)(e)),
        }

        let stored_mode = src_meta.permissions().mode() & 0o777;
        let want_mode = mode.map_or(stored_mode, |m| m & 0o777);

        if codec == Codec::None && want_mode == stored_mode {
            match fs::hard_link(&src, dest) {
                Ok(()) => return Ok(src_meta.len()),
                // Cross-device links and exotic filesystems fall back to a
                // plain copy.
                Err(e) => debug!(hash = %hash, error = %e, "hardlink failed, copying"),
            }
        }

        let file = File::open(&src).map_err(io_at("open blob", &src))?;
        let mut reader = BufReader::new(file);
        let mut out = File::create(dest).map_err(io_at("create output", dest))?;
        hashio::copy_decoded(&mut reader, &mut out, codec)
            .map_err(io_at("materialize blob to", dest))?;
        fs::set_permissions(dest, fs::Permissions::from_mode(want_mode))
            .map_err(io_at("set output permissions on", dest))?;

        let written = fs::metadata(dest).map_err(io_at("stat output", dest))?.len();
        Ok(written)
    }

    /// Removes a blob, returning the bytes freed. Absent blobs free zero.
    pub fn delete(&self, hash: &ContentHash) -> Result<u64> {
        let path = self.blob_path(hash);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_at("stat blob", &path)(e)),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_at("delete blob", &path)(e)),
        }
    }

    /// Re-hashes a stored blob and checks it still matches its key.
    pub fn verify(&self, hash: &ContentHash) -> Result<bool> {
        let path = self.blob_path(hash);
        if !path.is_file() {
            return Err(Error::not_in_cache(hash.as_hex()));
        }
        let (actual, _) = hashio::hash_file(&path).map_err(io_at("hash blob", &path))?;
        Ok(&actual == hash)
    }

    /// Deletes every stored blob whose hash is not in `retained`.
    ///
    /// Single-threaded-context only: callers must guarantee no concurrent
    /// puts, or a blob committed mid-sweep may be collected.
    pub fn gc(&self, retained: &HashSet<ContentHash>, cancel: &CancelToken) -> Result<GcSummary> {
        let mut summary = GcSummary::default();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            cancel.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable blob store entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Ok(hash) = ContentHash::from_hex(name) else {
                debug!(name, "ignoring foreign file in blob store");
                continue;
            };
            summary.scanned += 1;
            if retained.contains(&hash) {
                continue;
            }
            summary.freed_bytes += self.delete(&hash)?;
            summary.deleted += 1;
        }
        debug!(
            scanned = summary.scanned,
            deleted = summary.deleted,
            freed_bytes = summary.freed_bytes,
            "blob gc finished"
        );
        Ok(summary)
    }
}
