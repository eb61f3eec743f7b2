//! Machinery shared by the remote tier implementations
//!
//! Every remote tier ships the same payloads: files encoded with their
//! codec and hashed in encoded form, plus a manifest JSON mapping relative
//! paths to `{hash, size, mode, codec}`. [`TierCommon`] carries the
//! cross-cutting tier state: counters, the admission filter, and the
//! disabled flag that implements fail-fast-once.

use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use kiln_core::hashio::{self, HashingWriter};
use kiln_core::{Codec, ContentHash, FileEntry, OutputManifest, TierCounters, TierProbe, Uid};
use tracing::warn;

use crate::config::{AdmissionConfig, RemoteConfig};
use crate::error::{RemoteError, Result};

pub(crate) struct EncodedFile {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
    pub mode: u32,
}

/// Encodes one source file into its wire form.
pub(crate) fn encode_file(root: &Path, rel: &str, codec: Codec) -> Result<EncodedFile> {
    let path = root.join(rel);
    let mode = fs::metadata(&path)
        .map_err(|e| RemoteError::io(format!("stat source {}", path.display()), e))?
        .permissions()
        .mode()
        & 0o777;

    let file =
        File::open(&path).map_err(|e| RemoteError::io(format!("open source {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    let mut writer = HashingWriter::new(Vec::new());
    hashio::copy_encoded(&mut reader, &mut writer, codec)
        .map_err(|e| RemoteError::io(format!("encode source {}", path.display()), e))?;
    let (bytes, hash, _) = writer.finish();

    Ok(EncodedFile { hash, bytes, mode })
}

/// Encodes every output file, returning the manifest and the deduplicated
/// blob payloads to upload.
pub(crate) fn collect_outputs(
    root: &Path,
    files: &[String],
    codec: Codec,
) -> Result<(OutputManifest, Vec<(ContentHash, Vec<u8>)>)> {
    let mut manifest = OutputManifest::new();
    let mut blobs: Vec<(ContentHash, Vec<u8>)> = Vec::new();
    for rel in files {
        let EncodedFile { hash, bytes, mode } = encode_file(root, rel, codec)?;
        manifest.insert(
            rel.clone(),
            FileEntry {
                hash: hash.clone(),
                size: bytes.len() as u64,
                mode,
                codec,
            },
        );
        if !blobs.iter().any(|(h, _)| h == &hash) {
            blobs.push((hash, bytes));
        }
    }
    Ok((manifest, blobs))
}

/// Materializes downloaded blob bytes at `dest`, decoding and applying the
/// recorded permissions. Returns the number of bytes written.
pub(crate) fn decode_to_file(bytes: &[u8], dest: &Path, codec: Codec, mode: u32) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            RemoteError::io(format!("create output directory {}", parent.display()), e)
        })?;
    }
    let mut out = File::create(dest)
        .map_err(|e| RemoteError::io(format!("create output {}", dest.display()), e))?;
    let mut reader = bytes;
    hashio::copy_decoded(&mut reader, &mut out, codec)
        .map_err(|e| RemoteError::io(format!("materialize output {}", dest.display()), e))?;
    fs::set_permissions(dest, fs::Permissions::from_mode(mode & 0o777))
        .map_err(|e| RemoteError::io(format!("set output permissions on {}", dest.display()), e))?;

    let written = fs::metadata(dest)
        .map_err(|e| RemoteError::io(format!("stat output {}", dest.display()), e))?
        .len();
    Ok(written)
}

pub(crate) fn parse_manifest(uid: &Uid, bytes: &[u8]) -> Result<OutputManifest> {
    OutputManifest::from_json(bytes)
        .map_err(|e| RemoteError::invalid_metadata(uid.as_str(), e.to_string()))
}

pub(crate) fn manifest_bytes(manifest: &OutputManifest) -> Result<Vec<u8>> {
    manifest
        .to_json()
        .map_err(|e| RemoteError::serialization(e.to_string()))
}

/// Cross-cutting state every remote tier carries.
///
/// The disabled flag implements fail-fast-once: the first fatal error
/// disables the tier, and a disabled tier answers every further call as a
/// cheap miss for the rest of the process.
pub(crate) struct TierCommon {
    pub name: &'static str,
    pub readonly: bool,
    pub admission: AdmissionConfig,
    pub counters: TierCounters,
    disabled: AtomicBool,
}

impl TierCommon {
    pub(crate) fn new(name: &'static str, config: &RemoteConfig) -> Self {
        Self {
            name,
            readonly: config.readonly,
            admission: config.admission.clone(),
            counters: TierCounters::new(),
            disabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Lifts a remote error to the tier boundary, disabling the tier on
    /// fatal remote failures.
    ///
    /// Cancellation passes through untouched and local I/O trouble keeps
    /// the tier enabled; everything else marks it disabled.
    pub(crate) fn fail(&self, operation: &str, err: RemoteError) -> kiln_core::Error {
        match err {
            RemoteError::Cancelled(c) => kiln_core::Error::Cancelled(c),
            RemoteError::Io { .. } => {
                kiln_core::Error::tier(self.name, operation, err.to_string())
            }
            other => {
                if !self.disabled.swap(true, Ordering::Relaxed) {
                    warn!(
                        tier = self.name,
                        operation,
                        error = %other,
                        "disabling remote tier for the rest of the run"
                    );
                }
                kiln_core::Error::tier(self.name, operation, other.to_string())
            }
        }
    }

    pub(crate) fn fits(&self, probe: &TierProbe<'_>) -> bool {
        !self.readonly && !self.is_disabled() && self.admission.admits(probe)
    }

    pub(crate) fn snapshot(&self) -> kiln_core::TierStatsSnapshot {
        self.counters.snapshot(self.name, self.is_disabled())
    }
}
