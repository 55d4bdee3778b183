//! Single-file key-value store built from an append-only batch log
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("IAVL_LOG")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - reserved: 48 bytes
//!
//! [RECORDS: variable]
//!   - payload_len: 4 bytes (u32 LE)
//!   - checksum: 32 bytes (BLAKE3 of payload)
//!   - payload: zstd(bincode(WriteBatch))
//! ```
//!
//! Every write batch becomes exactly one record. On open the log is
//! replayed into an in-memory ordered map; a record cut short at the end of
//! the file (a crash mid-append) is discarded and the file truncated back to
//! the last complete record.

use super::mem_db::{apply_batch, scan_map};
use super::{KvStore, WriteBatch};
use crate::{Error, Result, FORMAT_VERSION, MAGIC};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const HEADER_SIZE: u64 = 64;
const RECORD_HEADER_SIZE: usize = 4 + 32;
const ZSTD_LEVEL: i32 = 3;

/// Log file handle and append position
struct LogFile {
    file: File,
    write_offset: u64,
}

/// A durable [`KvStore`] backed by a single append-only file
pub struct FileDb {
    /// Path to the database file
    path: PathBuf,
    /// The log file and its append position
    log: Mutex<LogFile>,
    /// Current contents, rebuilt from the log on open
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// fsync after every batch
    sync_writes: bool,
}

impl FileDb {
    /// Create a new, empty database file (truncating any existing file)
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = write_new_log(&path, None)?;

        Ok(FileDb {
            path,
            log: Mutex::new(LogFile {
                file,
                write_offset: HEADER_SIZE,
            }),
            entries: RwLock::new(BTreeMap::new()),
            sync_writes: true,
        })
    }

    /// Open an existing database file, replaying its log
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.len() < HEADER_SIZE as usize {
            return Err(Error::InvalidFile("File shorter than header".into()));
        }
        if &data[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }
        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&data[8..12]);
        let version = u32::from_le_bytes(version_bytes);
        if version != FORMAT_VERSION {
            return Err(Error::FormatVersionMismatch {
                expected: FORMAT_VERSION,
                found: version,
            });
        }

        let mut entries = BTreeMap::new();
        let (valid_end, records) = replay(&data, &mut entries)?;

        if valid_end < data.len() as u64 {
            warn!(
                path = %path.display(),
                discarded = data.len() as u64 - valid_end,
                "discarding torn record at end of log"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), records, keys = entries.len(), "opened file store");

        Ok(FileDb {
            path,
            log: Mutex::new(LogFile {
                file,
                write_offset: valid_end,
            }),
            entries: RwLock::new(entries),
            sync_writes: true,
        })
    }

    /// Open or create a database file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Choose whether every batch is fsynced before `write` returns
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    /// Rewrite the log as a single record holding the live entries
    pub fn compact(&self) -> Result<()> {
        let entries = self.entries.read();
        let mut log = self.log.lock();

        let mut snapshot = WriteBatch::new();
        for (key, value) in entries.iter() {
            snapshot.put(key.clone(), value.clone());
        }

        let tmp_path = self.path.with_extension("compact");
        let mut file = write_new_log(&tmp_path, Some(&snapshot))?;
        std::fs::rename(&tmp_path, &self.path)?;

        let write_offset = file.seek(SeekFrom::End(0))?;
        debug!(path = %self.path.display(), keys = entries.len(), write_offset, "compacted file store");
        *log = LogFile { file, write_offset };
        Ok(())
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Size of the log file in bytes
    pub fn file_size(&self) -> u64 {
        self.log.lock().write_offset
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write a fresh header (and optionally one record) to `path`, returning the open file
fn write_new_log(path: &Path, batch: Option<&WriteBatch>) -> Result<File> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(MAGIC);
    header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    // flags: 0
    file.write_all(&header)?;

    if let Some(batch) = batch {
        file.write_all(&encode_record(batch)?)?;
    }
    file.sync_all()?;
    Ok(file)
}

fn encode_record(batch: &WriteBatch) -> Result<Vec<u8>> {
    let raw = bincode::serialize(batch)?;
    let payload = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidOperation("write batch too large for one record".into()))?;

    let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(blake3::hash(&payload).as_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Replay every complete record into `entries`.
///
/// Returns the offset just past the last good record and the record count.
/// A bad record that is the last thing in the file is a torn append; a bad
/// record followed by more data is corruption.
fn replay(data: &[u8], entries: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(u64, usize)> {
    let mut offset = HEADER_SIZE as usize;
    let mut records = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() < RECORD_HEADER_SIZE {
            break;
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&rest[0..4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let end = RECORD_HEADER_SIZE + len;
        if rest.len() < end {
            break;
        }

        let payload = &rest[RECORD_HEADER_SIZE..end];
        if blake3::hash(payload).as_bytes() != &rest[4..RECORD_HEADER_SIZE] {
            if rest.len() == end {
                break;
            }
            return Err(Error::Corruption(format!(
                "checksum mismatch in log record at offset {}",
                offset
            )));
        }

        let raw = zstd::decode_all(payload)?;
        let batch: WriteBatch = bincode::deserialize(&raw)?;
        apply_batch(entries, batch);

        offset += end;
        records += 1;
    }

    Ok((offset as u64, records))
}

impl KvStore for FileDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(scan_map(&self.entries.read(), start, end))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let record = encode_record(&batch)?;

        // Hold the map lock across the append so readers never observe a
        // batch that is not yet in the log.
        let mut entries = self.entries.write();
        {
            let mut log = self.log.lock();
            let offset = log.write_offset;
            log.file.seek(SeekFrom::Start(offset))?;
            log.file.write_all(&record)?;
            if self.sync_writes {
                log.file.sync_data()?;
            }
            log.write_offset = offset + record.len() as u64;
        }
        apply_batch(&mut entries, batch);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.log.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileDb {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.log.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.iavl");

        // Create
        {
            let db = FileDb::create(&path).unwrap();
            assert!(db.is_empty());
        }

        // Reopen
        {
            let db = FileDb::open(&path).unwrap();
            assert!(db.is_empty());
        }
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.iavl");

        {
            let db = FileDb::create(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(b"a".to_vec(), b"1".to_vec());
            batch.put(b"b".to_vec(), b"2".to_vec());
            db.write(batch).unwrap();
            db.delete(b"a").unwrap();
        }

        {
            let db = FileDb::open(&path).unwrap();
            assert_eq!(db.get(b"a").unwrap(), None);
            assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
        }
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.iavl");

        let good_len = {
            let db = FileDb::create(&path).unwrap();
            db.set(b"kept", b"1").unwrap();
            db.file_size()
        };

        // Simulate a crash halfway through appending the next batch
        let mut batch = WriteBatch::new();
        batch.put(b"lost".to_vec(), b"2".to_vec());
        let record = encode_record(&batch).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&record[..record.len() / 2]).unwrap();
        }

        let db = FileDb::open(&path).unwrap();
        assert_eq!(db.get(b"kept").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"lost").unwrap(), None);
        assert_eq!(db.file_size(), good_len);

        // The store stays writable after recovery
        db.set(b"next", b"3").unwrap();
        drop(db);
        let db = FileDb::open(&path).unwrap();
        assert_eq!(db.get(b"next").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_invalid_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bogus.iavl");
        std::fs::write(&path, [0u8; 64]).unwrap();
        assert!(matches!(FileDb::open(&path), Err(Error::InvalidFile(_))));
    }

    #[test]
    fn test_compact_keeps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.iavl");

        let db = FileDb::create(&path).unwrap().with_sync_writes(false);
        for i in 0..50u32 {
            db.set(b"counter", &i.to_be_bytes()).unwrap();
        }
        let before = db.file_size();
        db.compact().unwrap();
        assert!(db.file_size() < before);

        db.set(b"after", b"x").unwrap();
        drop(db);

        let db = FileDb::open(&path).unwrap();
        assert_eq!(db.get(b"counter").unwrap(), Some(49u32.to_be_bytes().to_vec()));
        assert_eq!(db.get(b"after").unwrap(), Some(b"x".to_vec()));
        assert_eq!(db.len(), 2);
    }
}
