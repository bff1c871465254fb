#![warn(rust_2021_compatibility, unreachable_pub)]

//! Persisted state file (§6): one file per process, keyed by stable
//! *persist name*, storing the last-acked bookmark per source, the
//! disk-queue head marker per destination, and dynamic window
//! allocations across restarts and reconfiguration. Validated on open
//! by a header magic + version; a version mismatch refuses to load
//! rather than guess at a layout.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

const MAGIC: u32 = 0x4446_5053; // b"DFPS" read as a little-endian u32
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;

/// Errors opening or updating a persisted-state file.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Underlying I/O failure.
    #[error("persist file I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file's magic bytes do not match this format.
    #[error("persist file has an unrecognised header")]
    BadMagic,
    /// The file's format version is newer or older than supported;
    /// loading is refused rather than risk misreading the layout.
    #[error("persist file version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version recorded in the file.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },
}

fn replay_records(mut bytes: &[u8]) -> HashMap<String, Bytes> {
    let mut index = HashMap::new();
    loop {
        if bytes.len() < 4 {
            break;
        }
        let key_len = u32::from_le_bytes(bytes[0..4].try_into().expect("checked len")) as usize;
        if bytes.len() < 4 + key_len + 4 {
            break;
        }
        let key = match std::str::from_utf8(&bytes[4..4 + key_len]) {
            Ok(k) => k.to_string(),
            Err(_) => break,
        };
        let value_len_offset = 4 + key_len;
        let value_len = u32::from_le_bytes(
            bytes[value_len_offset..value_len_offset + 4]
                .try_into()
                .expect("checked len"),
        ) as usize;
        let value_offset = value_len_offset + 4;
        if bytes.len() < value_offset + value_len {
            break;
        }
        let value = Bytes::copy_from_slice(&bytes[value_offset..value_offset + value_len]);
        let _ = index.insert(key, value);
        bytes = &bytes[value_offset + value_len..];
    }
    index
}

/// A single mmapped, append-only keyed blob store.
pub struct PersistFile {
    path: PathBuf,
    append: Mutex<File>,
    index: RwLock<HashMap<String, Bytes>>,
}

impl PersistFile {
    /// Opens (creating if absent) the persisted-state file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let path = path.into();
        if !path.exists() {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            f.write_all(&MAGIC.to_le_bytes())?;
            f.write_all(&VERSION.to_le_bytes())?;
            f.sync_all()?;
        }

        let mut header_file = File::open(&path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        header_file.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header[0..4].try_into().expect("checked len"));
        let version = u32::from_le_bytes(header[4..8].try_into().expect("checked len"));
        if magic != MAGIC {
            return Err(PersistError::BadMagic);
        }
        if version != VERSION {
            return Err(PersistError::VersionMismatch {
                found: version,
                expected: VERSION,
            });
        }

        let file_len = header_file.metadata()?.len();
        let index = if file_len > HEADER_LEN {
            // Safety of `Mmap::map` rests on the file not being
            // concurrently truncated by another process while mapped;
            // this file is private to one df_engine instance.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&header_file)? };
            replay_records(&mmap[HEADER_LEN as usize..])
        } else {
            HashMap::new()
        };

        let append = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            append: Mutex::new(append),
            index: RwLock::new(index),
        })
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.index.read().get(key).cloned()
    }

    /// Writes (and durably syncs) a new value for `key`. Later calls
    /// for the same key win on the next `open`'s replay.
    pub fn set(&self, key: &str, value: impl Into<Bytes>) -> Result<(), PersistError> {
        let value = value.into();
        let mut record = Vec::with_capacity(4 + key.len() + 4 + value.len());
        record.extend_from_slice(&(key.len() as u32).to_le_bytes());
        record.extend_from_slice(key.as_bytes());
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(&value);

        let mut append = self.append.lock();
        append.write_all(&record)?;
        append.sync_data()?;
        drop(append);

        let _ = self.index.write().insert(key.to_string(), value);
        Ok(())
    }

    /// Number of distinct keys currently recorded.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Whether no keys have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.persist");
        let pf = PersistFile::open(&path).unwrap();
        pf.set("source.a.bookmark", Bytes::from_static(b"\x00\x00\x00\x2a"))
            .unwrap();
        assert_eq!(
            pf.get("source.a.bookmark"),
            Some(Bytes::from_static(b"\x00\x00\x00\x2a"))
        );
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.persist");
        {
            let pf = PersistFile::open(&path).unwrap();
            pf.set("d1.head", Bytes::from_static(b"\x05")).unwrap();
        }
        let reopened = PersistFile::open(&path).unwrap();
        assert_eq!(reopened.get("d1.head"), Some(Bytes::from_static(b"\x05")));
    }

    #[test]
    fn later_write_wins_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.persist");
        {
            let pf = PersistFile::open(&path).unwrap();
            pf.set("k", Bytes::from_static(b"v1")).unwrap();
            pf.set("k", Bytes::from_static(b"v2")).unwrap();
        }
        let reopened = PersistFile::open(&path).unwrap();
        assert_eq!(reopened.get("k"), Some(Bytes::from_static(b"v2")));
    }

    #[test]
    fn rejects_mismatched_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.persist");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&MAGIC.to_le_bytes()).unwrap();
            f.write_all(&999u32.to_le_bytes()).unwrap();
        }
        assert!(matches!(
            PersistFile::open(&path),
            Err(PersistError::VersionMismatch { found: 999, expected: VERSION })
        ));
    }
}
