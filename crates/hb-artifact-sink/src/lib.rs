//! hb-artifact-sink: streaming artifact writer with post-download hash
//! verification.
//!
//! Mirrors the embedded device's flash-write path (fixed-size page
//! buffer, write-as-you-go into the spare slot) without assuming a real
//! flash part is present: callers provide a [`FlashSlot`] implementation,
//! and [`FileFlashSlot`] gives a plain-file backed one for hosted builds
//! and tests.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use md5::{Digest as Md5Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

/// Page size used to batch writes to the underlying [`FlashSlot`].
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("artifact size {size} exceeds slot capacity {capacity}")]
    CapacityExceeded { size: u64, capacity: u64 },
    #[error("flash slot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{algorithm} hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        algorithm: &'static str,
        expected: String,
        actual: String,
    },
}

/// Declared hashes for the artifact being downloaded, as carried by the
/// deployment response. Verified in `sha256 > sha1 > md5` precedence:
/// the strongest available hash is checked and weaker ones are ignored.
#[derive(Debug, Clone, Default)]
pub struct ExpectedHashes {
    pub sha256: Option<String>,
    pub sha1: Option<String>,
    pub md5: Option<String>,
}

/// A writable destination for downloaded firmware, analogous to the
/// device's spare (inactive) flash bank.
pub trait FlashSlot: Send {
    /// Write `data` at `offset` bytes from the start of the slot.
    fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError>;

    /// Ensure all previously written pages are durable.
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// A [`FlashSlot`] backed by a plain file, for hosted builds and tests.
pub struct FileFlashSlot {
    file: std::fs::File,
}

impl FileFlashSlot {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;
        Ok(FileFlashSlot { file })
    }
}

impl FlashSlot for FileFlashSlot {
    fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl FlashSlot for Box<dyn FlashSlot> {
    fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<(), SinkError> {
        (**self).write_page(offset, data)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Streaming writer that buffers downloaded bytes into fixed-size pages,
/// hashes the stream incrementally, and verifies against the strongest
/// declared hash once the download completes.
pub struct ArtifactSink<S: FlashSlot> {
    slot: S,
    capacity: u64,
    written: u64,
    page_buf: Vec<u8>,
    offset: u64,
    sha256: Sha256,
    sha1: Sha1,
    md5: Md5,
}

impl<S: FlashSlot> ArtifactSink<S> {
    /// Begin a new artifact write. `declared_size` is the artifact size
    /// from the deployment metadata and is checked against `capacity`
    /// before any bytes are accepted.
    pub fn new(slot: S, capacity: u64, declared_size: u64) -> Result<Self, SinkError> {
        if declared_size > capacity {
            return Err(SinkError::CapacityExceeded {
                size: declared_size,
                capacity,
            });
        }
        Ok(ArtifactSink {
            slot,
            capacity,
            written: 0,
            page_buf: Vec::with_capacity(PAGE_SIZE),
            offset: 0,
            sha256: Sha256::new(),
            sha1: Sha1::new(),
            md5: Md5::new(),
        })
    }

    /// Feed the next chunk of a streaming HTTP download body.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.written += chunk.len() as u64;
        if self.written > self.capacity {
            return Err(SinkError::CapacityExceeded {
                size: self.written,
                capacity: self.capacity,
            });
        }

        sha2::Digest::update(&mut self.sha256, chunk);
        sha1::Digest::update(&mut self.sha1, chunk);
        Md5Digest::update(&mut self.md5, chunk);

        self.page_buf.extend_from_slice(chunk);
        while self.page_buf.len() >= PAGE_SIZE {
            let page: Vec<u8> = self.page_buf.drain(..PAGE_SIZE).collect();
            self.slot.write_page(self.offset, &page)?;
            self.offset += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Flush the remaining partial page, sync the slot, and verify the
    /// completed artifact against `expected`.
    pub fn finish(mut self, expected: &ExpectedHashes) -> Result<(), SinkError> {
        if !self.page_buf.is_empty() {
            let page = std::mem::take(&mut self.page_buf);
            self.slot.write_page(self.offset, &page)?;
        }
        self.slot.flush()?;
        verify_precedence(expected, self.sha256, self.sha1, self.md5)
    }
}

fn verify_precedence(
    expected: &ExpectedHashes,
    sha256: Sha256,
    sha1: Sha1,
    md5: Md5,
) -> Result<(), SinkError> {
    if let Some(want) = &expected.sha256 {
        let got = hex::encode(sha2::Digest::finalize(sha256));
        return check_hash("sha256", want, &got);
    }
    if let Some(want) = &expected.sha1 {
        let got = hex::encode(sha1::Digest::finalize(sha1));
        return check_hash("sha1", want, &got);
    }
    if let Some(want) = &expected.md5 {
        let got = hex::encode(Md5Digest::finalize(md5));
        return check_hash("md5", want, &got);
    }
    // Server supplied no hash at all; hashes are advisory, so a download
    // with nothing to verify against still succeeds.
    Ok(())
}

fn check_hash(algorithm: &'static str, expected: &str, actual: &str) -> Result<(), SinkError> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(SinkError::HashMismatch {
            algorithm,
            expected: expected.to_owned(),
            actual: actual.to_owned(),
        })
    }
}

/// Read back the full contents of a [`FileFlashSlot`]'s backing file, for
/// test assertions.
pub fn read_file_slot(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}
