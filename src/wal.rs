//! Write-ahead journal of saved changes.
//!
//! Every successful `save` appends one entry holding the net mutations of
//! the batch. The entry is fsynced before the save reports success. On open
//! the journal is replayed on top of the last snapshot, and a checkpoint
//! folds it into a new snapshot and clears it.

use crate::error::{Result, StoreError};
use crate::types::{Entity, EntityId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for journal file.
const WAL_MAGIC: &[u8; 4] = b"LSJ\0";

/// Current journal format version.
const WAL_VERSION: u8 = 1;

/// Header size (magic + version).
const WAL_HEADER_SIZE: u64 = 5;

/// Entry header size (payload length + checksum of the length).
const ENTRY_HEADER_SIZE: u64 = 8;

/// Upper bound for a single entry.
const MAX_ENTRY_SIZE: usize = 256 * 1024 * 1024;

/// Step of [`WriteAheadLog::append`] at which an injected failure fires.
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailPoint {
    /// Entry is buffered but not yet written to the file.
    BeforeFlush,
    /// Entry is written to the file but not synced.
    BeforeSync,
}

/// Net change to one entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Entity was created or changed; this is its full new state.
    Upsert(Entity),
    /// Entity was removed.
    Delete(EntityId),
}

impl Mutation {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Mutation::Upsert(entity) => entity.id,
            Mutation::Delete(id) => *id,
        }
    }
}

/// One saved batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic across checkpoints.
    pub seq: u64,
    /// Id counter after the batch, so ids are never reused after reopen.
    pub next_id: u64,
    pub timestamp: Timestamp,
    pub mutations: Vec<Mutation>,
}

/// Append-only journal file.
pub struct WriteAheadLog {
    /// Path to the journal file.
    path: PathBuf,
    /// Next sequence number to assign.
    next_seq: Mutex<u64>,
    /// Write handle.
    writer: Mutex<BufWriter<File>>,
    #[cfg(test)]
    fail_point: Mutex<Option<FailPoint>>,
}

impl WriteAheadLog {
    /// Open or create a journal, returning the entries it already holds.
    ///
    /// A torn entry at the tail (crash during append) is dropped and the
    /// file truncated to the last complete entry. An entry is torn only when
    /// its header is incomplete, or when a valid header is followed by a
    /// short payload. A checksum mismatch in a header or payload is
    /// corruption and fails the open.
    pub fn open(path: impl AsRef<Path>, min_next_seq: u64) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let entries = if path.exists() {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);

            let mut magic = [0u8; 4];
            reader.read_exact(&mut magic)?;
            if &magic != WAL_MAGIC {
                return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
            }

            let mut version = [0u8; 1];
            reader.read_exact(&mut version)?;
            if version[0] != WAL_VERSION {
                return Err(StoreError::InvalidFormat(format!(
                    "Unsupported journal version: {}",
                    version[0]
                )));
            }

            let mut entries = Vec::new();
            let mut valid_len = WAL_HEADER_SIZE;
            while let Some((entry, size)) = Self::read_entry(&mut reader)? {
                entries.push(entry);
                valid_len += size;
            }

            let file_len = std::fs::metadata(&path)?.len();
            if file_len > valid_len {
                warn!(
                    path = %path.display(),
                    dropped_bytes = file_len - valid_len,
                    "discarding torn journal tail"
                );
                OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
            }

            entries
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            file.write_all(WAL_MAGIC)?;
            file.write_all(&[WAL_VERSION])?;
            file.sync_all()?;

            Vec::new()
        };

        let next_seq = entries
            .iter()
            .map(|e| e.seq + 1)
            .max()
            .unwrap_or(1)
            .max(min_next_seq);

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        Ok((
            Self {
                path,
                next_seq: Mutex::new(next_seq),
                writer: Mutex::new(writer),
                #[cfg(test)]
                fail_point: Mutex::new(None),
            },
            entries,
        ))
    }

    /// Append and fsync a batch. Returns the entry's sequence number.
    ///
    /// On failure nothing of the entry remains: buffered bytes are dropped
    /// and the file is cut back to its length before the append.
    pub fn append(&self, next_id: u64, mutations: Vec<Mutation>) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        let entry = JournalEntry {
            seq,
            next_id,
            timestamp: Timestamp::now(),
            mutations,
        };

        let mut writer = self.writer.lock();
        let start_len = writer.get_ref().metadata()?.len();

        if let Err(e) = self.write_durable(&mut writer, &entry) {
            if let Err(reset) = self.discard_partial(&mut writer, start_len) {
                warn!(
                    path = %self.path.display(),
                    error = %reset,
                    "failed to discard partial journal entry"
                );
            }
            return Err(e);
        }

        // Only advance once the entry is durable.
        *next_seq += 1;
        Ok(seq)
    }

    fn write_durable(&self, writer: &mut BufWriter<File>, entry: &JournalEntry) -> Result<()> {
        Self::write_entry(writer, entry)?;
        #[cfg(test)]
        self.check_fail_point(FailPoint::BeforeFlush)?;
        writer.flush()?;
        #[cfg(test)]
        self.check_fail_point(FailPoint::BeforeSync)?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replace the writer without flushing it and truncate the file back to
    /// `len`.
    fn discard_partial(&self, writer: &mut BufWriter<File>, len: u64) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(len)?;
        file.sync_all()?;

        // into_parts hands back the unwritten buffer instead of flushing it
        let stale = std::mem::replace(writer, BufWriter::new(file));
        let (_file, _unwritten) = stale.into_parts();
        Ok(())
    }

    /// Make the next append fail at `point`.
    #[cfg(test)]
    pub(crate) fn fail_next_append(&self, point: FailPoint) {
        *self.fail_point.lock() = Some(point);
    }

    #[cfg(test)]
    fn check_fail_point(&self, point: FailPoint) -> Result<()> {
        let mut armed = self.fail_point.lock();
        match *armed {
            Some(p) if p == point => {
                *armed = None;
                Err(StoreError::Io(std::io::Error::new(
                    ErrorKind::Other,
                    format!("injected journal failure {point:?}"),
                )))
            }
            _ => Ok(()),
        }
    }

    /// Sequence number of the last appended entry (0 if none).
    pub fn last_seq(&self) -> u64 {
        *self.next_seq.lock() - 1
    }

    /// Truncate to an empty journal after a checkpoint. Sequence numbers
    /// keep increasing.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len_bytes = (encoded.len() as u32).to_le_bytes();
        writer.write_all(&len_bytes)?;
        writer.write_all(&crc32fast::hash(&len_bytes).to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read one entry and its on-disk size. `None` at end of file or at a
    /// torn tail.
    fn read_entry(reader: &mut impl Read) -> Result<Option<(JournalEntry, u64)>> {
        let mut header = [0u8; ENTRY_HEADER_SIZE as usize];
        if !Self::read_or_eof(reader, &mut header)? {
            return Ok(None);
        }
        let len_bytes = [header[0], header[1], header[2], header[3]];
        let stored = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if crc32fast::hash(&len_bytes) != stored {
            return Err(StoreError::Corruption(
                "journal entry header checksum mismatch".into(),
            ));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(StoreError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        if !Self::read_or_eof(reader, &mut encoded)? {
            return Ok(None);
        }

        let mut checksum_bytes = [0u8; 4];
        if !Self::read_or_eof(reader, &mut checksum_bytes)? {
            return Ok(None);
        }

        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, ENTRY_HEADER_SIZE + len as u64 + 4)))
    }

    fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
        match reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
