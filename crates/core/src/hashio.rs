//! Streaming hash and codec plumbing shared by the cache tiers
//!
//! Blobs are hashed as they are written so large outputs never need to be
//! buffered in memory. The hash always covers the stored bytes: for an
//! encoded blob that is the encoded form.

use crate::codec::Codec;
use crate::id::ContentHash;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

const ZSTD_LEVEL: i32 = 3;
const READ_BUF: usize = 64 * 1024;

/// Writer adapter that feeds everything written through SHA-256
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Finish hashing, returning the inner writer, the hash, and the byte count
    pub fn finish(self) -> (W, ContentHash, u64) {
        (
            self.inner,
            ContentHash::from_digest(self.hasher),
            self.written,
        )
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer`, encoding with `codec`
///
/// # Errors
///
/// Returns any I/O error from either side of the copy.
pub fn copy_encoded(
    reader: &mut impl Read,
    writer: &mut impl Write,
    codec: Codec,
) -> io::Result<()> {
    match codec {
        Codec::None => {
            io::copy(reader, writer)?;
            Ok(())
        }
        Codec::Zstd => zstd::stream::copy_encode(reader, writer, ZSTD_LEVEL),
    }
}

/// Copy `reader` into `writer`, decoding with `codec`
///
/// # Errors
///
/// Returns any I/O error from either side of the copy, including corrupt
/// compressed input.
pub fn copy_decoded(
    reader: &mut impl Read,
    writer: &mut impl Write,
    codec: Codec,
) -> io::Result<()> {
    match codec {
        Codec::None => {
            io::copy(reader, writer)?;
            Ok(())
        }
        Codec::Zstd => zstd::stream::copy_decode(reader, writer),
    }
}

/// Hash a file's bytes without modifying it
///
/// # Errors
///
/// Returns any I/O error from reading the file.
pub fn hash_file(path: &Path) -> io::Result<(ContentHash, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((ContentHash::from_digest(hasher), total))
}
