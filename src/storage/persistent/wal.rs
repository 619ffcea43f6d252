//! Write-Ahead Log (WAL) for crash recovery.
//!
//! Every physical transaction is appended as a single frame before it becomes
//! visible, so a crash either keeps the whole transaction or loses all of it.
//! On open, a torn or corrupt tail is cut off at the last intact frame. A
//! failed append is cut off the same way before the next one starts.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec frame]
//! [ENTRY 2: codec frame]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::storage::traits::Mutation;

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing within one WAL generation.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: WalEntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Schema upgrade: version raised and partitions created.
    Upgrade { version: u32, partitions: Vec<String> },
    /// One transaction on one partition.
    Commit {
        partition: String,
        mutations: Vec<Mutation>,
    },
    /// Everything before this marker is contained in a segment.
    Checkpoint { up_to_sequence: u64 },
}

struct WalState {
    /// `None` after a failed append could not be cleaned up.
    writer: Option<BufWriter<File>>,
    sequence: u64,
    /// File length after the last intact frame.
    len: u64,
    #[cfg(test)]
    fail_next: bool,
}

impl WalState {
    fn writer(&mut self) -> IoResult<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(ErrorKind::BrokenPipe, "WAL unusable after a failed append; reopen the store")
        })
    }
}

/// Append-only log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Opens or creates a WAL file, discarding any torn tail.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        let sequence = if len >= codec::HEADER_LEN {
            let (sequence, valid_end) = Self::scan(path)?;
            if valid_end < len {
                warn!(
                    path = %path.display(),
                    discarded_bytes = len - valid_end,
                    "truncating torn WAL tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            sequence
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: Some(BufWriter::new(file)),
                sequence,
                len,
                #[cfg(test)]
                fail_next: false,
            }),
            sync_on_write,
        })
    }

    fn lock(&self) -> MutexGuard<'_, WalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// On error nothing of the entry remains in the log, and the sequence is
    /// not consumed.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut state = self.lock();
        let candidate = state.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        if let Err(e) = Self::write_frame(&mut state, &encoded, self.sync_on_write) {
            if let Err(repair) = self.discard_partial(&mut state) {
                error!(
                    path = %self.path.display(),
                    error = %repair,
                    "could not discard a failed WAL append; log closed"
                );
            }
            return Err(e);
        }

        state.len += encoded.len() as u64;
        state.sequence = candidate;
        Ok(candidate)
    }

    fn write_frame(state: &mut WalState, frame: &[u8], sync: bool) -> IoResult<()> {
        #[cfg(test)]
        if std::mem::take(&mut state.fail_next) {
            // Half the frame reaches the file, a few more bytes stay buffered.
            let half = frame.len() / 2;
            let writer = state.writer()?;
            writer.write_all(&frame[..half])?;
            writer.flush()?;
            writer.write_all(&frame[half..half + 4])?;
            return Err(std::io::Error::other("injected write failure"));
        }

        let writer = state.writer()?;
        writer.write_all(frame)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Drops buffered bytes of a failed append and truncates whatever of it
    /// reached the file. Leaves the writer closed if that is not possible.
    fn discard_partial(&self, state: &mut WalState) -> IoResult<()> {
        if let Some(writer) = state.writer.take() {
            // The buffer holds only bytes of the failed frame.
            let (_file, _unwritten) = writer.into_parts();
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(state.len)?;
        file.sync_data()?;
        state.writer = Some(BufWriter::new(OpenOptions::new().append(true).open(&self.path)?));
        warn!(path = %self.path.display(), len = state.len, "discarded failed WAL append");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_append(&self) {
        self.lock().fail_next = true;
    }

    /// Iterates over all intact entries.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    pub fn current_sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Resets the log to an empty file.
    ///
    /// Only call this after a segment containing every entry has been
    /// finalized.
    pub fn truncate(&self) -> IoResult<()> {
        let mut state = self.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }

        let mut file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        codec::write_header(&mut file)?;
        file.sync_all()?;

        state.writer = Some(BufWriter::new(OpenOptions::new().append(true).open(&self.path)?));
        state.sequence = 0;
        state.len = codec::HEADER_LEN;
        Ok(())
    }

    /// Returns the last intact sequence and the byte offset right after it.
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_sequence = 0;
        let mut valid_end = iter.position()?;

        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    last_sequence = entry.sequence;
                    valid_end = iter.position()?;
                }
                Some(Err(e)) => {
                    warn!(
                        sequence = last_sequence + 1,
                        error = %e,
                        "WAL corruption detected; replaying up to the last intact entry"
                    );
                    break;
                }
                None => break,
            }
        }

        Ok((last_sequence, valid_end))
    }
}

/// Iterator over WAL entries. A frame cut short ends the iteration.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
