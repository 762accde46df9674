//! Checkpoint snapshot of committed entities.

use crate::error::{Result, StoreError};
use crate::types::Entity;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for snapshot file.
const SNAPSHOT_MAGIC: &[u8; 4] = b"LSS\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Bytes around the payload: magic, version, length and checksum.
const SNAPSHOT_FRAMING: u64 = 4 + 1 + 8 + 4;

/// Committed state as of a journal sequence number.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Journal entries up to and including this sequence are folded in.
    pub journal_seq: u64,
    /// Id counter at checkpoint time.
    pub next_id: u64,
    pub entities: Vec<Entity>,
}

impl Snapshot {
    /// Load a snapshot, `None` if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > file_len.saturating_sub(SNAPSHOT_FRAMING) {
            return Err(StoreError::Corruption(format!(
                "snapshot length {len} exceeds file size {file_len}"
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }

    /// Write atomically: a temp file is synced and renamed over the target.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");

        let encoded = rmp_serde::to_vec(self)?;
        let checksum = crc32fast::hash(&encoded);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&[SNAPSHOT_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
