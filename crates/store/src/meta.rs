//! The uid-keyed manifest store
//!
//! A second hex-bucketed store, `<root>/<c0>/<c1>/<uid>`, keyed by the
//! opaque uid rather than content. It holds the small JSON manifests that
//! make a uid's outputs restorable; publishing here is the last step of a
//! put, so a visible uid always has its blobs already committed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use kiln_core::{OutputManifest, Uid};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{io_at, Error, Result};

pub struct UidStore {
    root: PathBuf,
}

impl UidStore {
    /// Opens (creating if needed) a manifest store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_at("create uid store root", &root))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, uid: &Uid) -> PathBuf {
        let key = uid.as_str();
        self.root.join(&key[0..1]).join(&key[1..2]).join(key)
    }

    #[must_use]
    pub fn contains(&self, uid: &Uid) -> bool {
        self.record_path(uid).is_file()
    }

    /// Size of the stored manifest record.
    pub fn size_of(&self, uid: &Uid) -> Result<u64> {
        let path = self.record_path(uid);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_in_cache(uid.as_str()))
            }
            Err(e) => Err(io_at("stat manifest", &path)(e)),
        }
    }

    /// Publishes the manifest for `uid`, returning the record size in
    /// bytes. Overwrites any previous manifest atomically.
    pub fn put(&self, uid: &Uid, manifest: &OutputManifest) -> Result<u64> {
        let data = manifest
            .to_json()
            .map_err(|e| Error::serialization(e.to_string()))?;

        let dest = self.record_path(uid);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_at("create uid bucket", parent))?;
        }

        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(io_at("create temp file in", &self.root))?;
        tmp.write_all(&data).map_err(io_at("write manifest for", &dest))?;
        tmp.persist(&dest).map_err(|e| {
            Error::io(format!("failed to persist manifest {}", dest.display()), e.error)
        })?;

        debug!(uid = %uid, files = manifest.len(), bytes = data.len(), "published manifest");
        Ok(data.len() as u64)
    }

    /// Loads the manifest for `uid`.
    ///
    /// Missing records are a `NotInCache` miss; unparsable records are
    /// reported as corrupt.
    pub fn get(&self, uid: &Uid) -> Result<OutputManifest> {
        let path = self.record_path(uid);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_in_cache(uid.as_str()));
            }
            Err(e) => return Err(io_at("read manifest", &path)(e)),
        };
        OutputManifest::from_json(&data).map_err(|e| Error::corrupt(uid.as_str(), e.to_string()))
    }

    /// Removes the manifest for `uid`, returning the bytes freed.
    pub fn delete(&self, uid: &Uid) -> Result<u64> {
        let path = self.record_path(uid);
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_at("stat manifest", &path)(e)),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_at("delete manifest", &path)(e)),
        }
    }

    /// Lists every stored uid. Used by integrity checks, not hot paths.
    pub fn list(&self) -> Result<Vec<Uid>> {
        let mut uids = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable uid store entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            match Uid::new(name) {
                Ok(uid) => uids.push(uid),
                Err(_) => debug!(name, "ignoring foreign file in uid store"),
            }
        }
        uids.sort();
        Ok(uids)
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::{Codec, ContentHash, FileEntry};

    use super::*;

    fn manifest_with(path: &str, data: &[u8]) -> OutputManifest {
        let mut m = OutputManifest::new();
        m.insert(
            path,
            FileEntry {
                hash: ContentHash::from_data(data),
                size: data.len() as u64,
                mode: 0o644,
                codec: Codec::None,
            },
        );
        m
    }

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = UidStore::open(tmp.path().join("uid")).unwrap();
        let uid = Uid::new("u1-example").unwrap();
        let manifest = manifest_with("a.txt", b"hello");

        let bytes = store.put(&uid, &manifest).unwrap();
        assert!(bytes > 0);
        assert!(store.contains(&uid));
        assert_eq!(store.get(&uid).unwrap(), manifest);
    }

    #[test]
    fn test_get_missing_is_a_miss() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = UidStore::open(tmp.path().join("uid")).unwrap();
        let err = store.get(&Uid::new("absent").unwrap()).unwrap_err();
        assert!(err.is_miss());
    }

    #[test]
    fn test_overwrite_replaces_previous_manifest() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = UidStore::open(tmp.path().join("uid")).unwrap();
        let uid = Uid::new("u1").unwrap();

        store.put(&uid, &manifest_with("a.txt", b"one")).unwrap();
        store.put(&uid, &manifest_with("b.txt", b"two")).unwrap();

        let manifest = store.get(&uid).unwrap();
        assert!(manifest.get("a.txt").is_none());
        assert!(manifest.get("b.txt").is_some());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = UidStore::open(tmp.path().join("uid")).unwrap();
        let uid = Uid::new("u1").unwrap();

        store.put(&uid, &manifest_with("a.txt", b"data")).unwrap();
        assert!(store.delete(&uid).unwrap() > 0);
        assert!(!store.contains(&uid));
        assert_eq!(store.delete(&uid).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_manifest_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = UidStore::open(tmp.path().join("uid")).unwrap();
        let uid = Uid::new("u1").unwrap();
        store.put(&uid, &manifest_with("a.txt", b"data")).unwrap();

        let path = store.root().join("u").join("1").join("u1");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(store.get(&uid), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_list_finds_stored_uids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = UidStore::open(tmp.path().join("uid")).unwrap();
        for key in ["alpha", "beta", "al-2"] {
            let uid = Uid::new(key).unwrap();
            store.put(&uid, &manifest_with("f", b"x")).unwrap();
        }

        let listed = store.list().unwrap();
        let names: Vec<&str> = listed.iter().map(Uid::as_str).collect();
        assert_eq!(names, vec!["al-2", "alpha", "beta"]);
    }
}
