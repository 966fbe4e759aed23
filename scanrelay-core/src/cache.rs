//! Spillover cache: append-only, size-bounded on-disk queue of serialized messages.
//!
//! Each record is the payload followed by its length (4 bytes LE), so the newest record
//! can be read and truncated from the tail without an index.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::protocol::Message;
use crate::wire::{self, LEN_SIZE};

pub const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Bounded on-disk message queue. Once the file exceeds `max_size` the cache is full and
/// refuses writes until `clear` is called.
#[derive(Debug)]
pub struct SpilloverCache {
    path: PathBuf,
    max_size: u64,
    size: u64,
    full: bool,
    writer: Option<File>,
}

impl SpilloverCache {
    /// Open (or create) the cache file at `path`, open for writing unless already full.
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(&path, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let size = file.metadata().map_err(|e| io_err(&path, e))?.len();
        let mut cache = Self {
            path,
            max_size,
            size,
            full: size > max_size,
            writer: Some(file),
        };
        if cache.full {
            cache.writer = None;
        }
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Reopen for writing. No-op when full or already open.
    pub fn open_for_writing(&mut self) {
        if self.full || self.writer.is_some() {
            return;
        }
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => self.writer = Some(file),
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "cannot reopen cache"),
        }
    }

    /// Flush and close the write handle so reads do not race with buffered writes.
    pub fn close_for_writing(&mut self) {
        if let Some(mut file) = self.writer.take() {
            if let Err(e) = file.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "cache flush failed");
            }
        }
    }

    /// Append one serialized message followed by its length. Returns false (and writes
    /// nothing) when the cache is closed or full, or the payload exceeds the frame limit.
    /// Crossing `max_size` marks the cache full.
    pub fn append(&mut self, payload: &[u8]) -> bool {
        if self.full {
            return false;
        }
        if payload.len() > wire::MAX_FRAME_LEN as usize {
            tracing::warn!(len = payload.len(), "record exceeds frame limit, not cached");
            return false;
        }
        let Some(file) = self.writer.as_mut() else {
            return false;
        };
        let mut record = Vec::with_capacity(payload.len() + LEN_SIZE);
        record.extend_from_slice(payload);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        if let Err(e) = file.write_all(&record) {
            tracing::warn!(path = %self.path.display(), error = %e, "cache write failed");
            return false;
        }
        self.size += record.len() as u64;
        if self.size > self.max_size {
            tracing::warn!(
                path = %self.path.display(),
                size = self.size,
                max = self.max_size,
                "spillover cache full"
            );
            self.full = true;
            self.close_for_writing();
        }
        true
    }

    /// Serialize and append a message.
    pub fn append_message(&mut self, msg: &Message) -> bool {
        match wire::serialize(msg) {
            Ok(payload) => self.append(&payload),
            Err(e) => {
                tracing::warn!(error = %e, "cannot serialize message for cache");
                false
            }
        }
    }

    /// Pop up to `n` records, newest first, truncating them from the file. Records that
    /// fail to deserialize are dropped. Returned messages are flagged `cached`.
    pub fn read_latest(&mut self, n: usize) -> Result<Vec<Message>, CacheError> {
        if self.writer.is_some() {
            self.close_for_writing();
            let out = self.pop_records(n);
            self.open_for_writing();
            return out;
        }
        self.pop_records(n)
    }

    fn pop_records(&mut self, n: usize) -> Result<Vec<Message>, CacheError> {
        let mut out = Vec::new();
        if n == 0 || self.size == 0 {
            return Ok(out);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        let mut end = file.metadata().map_err(|e| io_err(&self.path, e))?.len();

        while out.len() < n && end > 0 {
            if end < LEN_SIZE as u64 {
                tracing::warn!(path = %self.path.display(), "truncated cache tail, discarding");
                end = 0;
                break;
            }
            let mut len_buf = [0u8; LEN_SIZE];
            file.seek(SeekFrom::Start(end - LEN_SIZE as u64))
                .map_err(|e| io_err(&self.path, e))?;
            file.read_exact(&mut len_buf)
                .map_err(|e| io_err(&self.path, e))?;
            let len = u64::from(u32::from_le_bytes(len_buf));
            let record_len = len + LEN_SIZE as u64;
            if record_len > end {
                tracing::warn!(path = %self.path.display(), "corrupt cache record length, discarding remainder");
                end = 0;
                break;
            }
            let start = end - record_len;
            let mut payload = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(start))
                .map_err(|e| io_err(&self.path, e))?;
            file.read_exact(&mut payload)
                .map_err(|e| io_err(&self.path, e))?;
            end = start;
            match wire::deserialize(&payload) {
                Ok(mut msg) => {
                    msg.cached = true;
                    out.push(msg);
                }
                Err(e) => tracing::debug!(error = %e, "dropping undecodable cache record"),
            }
        }

        file.set_len(end).map_err(|e| io_err(&self.path, e))?;
        self.size = end;
        Ok(out)
    }

    /// Discard all contents and reset the full flag. The write state is kept: a closed
    /// (or full) cache needs `open_for_writing` before it accepts records again.
    pub fn clear(&mut self) -> Result<(), CacheError> {
        let reopen = self.writer.is_some();
        self.writer = None;
        File::create(&self.path).map_err(|e| io_err(&self.path, e))?;
        self.size = 0;
        self.full = false;
        if reopen {
            self.open_for_writing();
        }
        Ok(())
    }

    /// Re-read the file size from disk and update the full flag. Returns the size.
    pub fn refresh_size(&mut self) -> u64 {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                self.size = meta.len();
                if self.size > self.max_size && !self.full {
                    tracing::warn!(path = %self.path.display(), size = self.size, "spillover cache full");
                    self.full = true;
                    self.close_for_writing();
                }
            }
            Err(e) => tracing::debug!(path = %self.path.display(), error = %e, "cannot stat cache"),
        }
        self.size
    }
}

fn io_err(path: &Path, source: io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}
