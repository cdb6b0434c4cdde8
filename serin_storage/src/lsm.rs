//! Log-Structured Merge-Tree level 0 backing store.
//! Writes land in a skiplist memtable and are flushed to immutable SSTables
//! once the memtable grows past a threshold. Deletes are recorded as
//! tombstones so they shadow older tables. There is no compaction yet.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crc32c::crc32c;
use parking_lot::Mutex;
use serde::Deserialize;
use skiplist::SkipMap;
use tracing::{debug, warn};

use crate::engine::{Result, Storage, StorageError};

/// SSTable file footer magic value for format validation.
const FOOTER_MAGIC: u32 = 0x534B_5950; // "SKYP"

/// index_offset (8) + magic (4)
const FOOTER_LEN: u64 = 12;

/// flags (1) + key_len (4) + val_len (4) + crc (4)
const ENTRY_HEADER_LEN: usize = 13;

const FLAG_TOMBSTONE: u8 = 0x01;

/// Default memtable flush threshold (bytes).
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

/// On-disk store configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LsmConfig {
    /// Directory holding the `.sst` files.
    pub dir: PathBuf,
    /// Memtable size in bytes that triggers a flush.
    pub flush_threshold: usize,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("./data"), flush_threshold: DEFAULT_FLUSH_THRESHOLD }
    }
}

impl LsmConfig {
    /// Load configuration from a YAML file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| StorageError::Other(Box::new(e)))
    }
}

/// Outcome of looking a key up in one level of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// This level knows nothing about the key.
    Absent,
    /// The key was deleted at this level.
    Deleted,
    /// Live value.
    Value(Bytes),
}

/// In-memory write buffer. `None` values are tombstones.
pub struct MemTable {
    inner: SkipMap<Vec<u8>, Option<Bytes>>,
    /// Approximate size in bytes, used to decide when to flush.
    size_bytes: usize,
}

impl MemTable {
    /// Create a new, empty MemTable.
    pub fn new() -> Self {
        Self { inner: SkipMap::new(), size_bytes: 0 }
    }

    /// Insert or update a key/value pair.
    pub fn insert(&mut self, key: Vec<u8>, value: Bytes) {
        self.size_bytes += key.len() + value.len();
        self.inner.insert(key, Some(value));
    }

    /// Record a deletion.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.size_bytes += key.len();
        self.inner.insert(key, None);
    }

    /// Look a key up in memory only.
    pub fn get(&self, key: &[u8]) -> Lookup {
        match self.inner.get(key) {
            Some(Some(value)) => Lookup::Value(value.clone()),
            Some(None) => Lookup::Deleted,
            None => Lookup::Absent,
        }
    }

    /// Sorted iteration, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<Bytes>)> + '_ {
        self.inner.iter()
    }

    /// Number of buffered keys.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.size_bytes
    }

    fn clear(&mut self) {
        self.inner.clear();
        self.size_bytes = 0;
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_checksum(flags: u8, key: &[u8], value: &[u8]) -> u32 {
    let mut buf = Vec::with_capacity(1 + key.len() + value.len());
    buf.push(flags);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    crc32c(&buf)
}

/// Writes a memtable out as an immutable Sorted String Table.
pub struct SsTableWriter {
    path: PathBuf,
}

impl SsTableWriter {
    /// Flush a memtable into a brand-new SSTable file. The memtable is *not* cleared.
    ///
    /// Entry format: `[flags: u8][key_len: u32][val_len: u32][crc32c: u32][key][val]`,
    /// followed by the index `(key_len, key, offset)*` and the footer
    /// `[index_offset: u64][magic: u32]`. All integers little-endian.
    pub fn flush_to_path(mem: &MemTable, dir: &Path, file_id: u64) -> Result<Self> {
        let path = dir.join(format!("{:020}.sst", file_id));
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;

        let mut index: Vec<(&[u8], u64)> = Vec::with_capacity(mem.len());
        for (key, value) in mem.iter() {
            let offset = file.stream_position()?;
            let (flags, val): (u8, &[u8]) = match value {
                Some(v) => (0, v.as_ref()),
                None => (FLAG_TOMBSTONE, &[]),
            };
            file.write_all(&[flags])?;
            file.write_all(&(key.len() as u32).to_le_bytes())?;
            file.write_all(&(val.len() as u32).to_le_bytes())?;
            file.write_all(&entry_checksum(flags, key, val).to_le_bytes())?;
            file.write_all(key)?;
            file.write_all(val)?;
            index.push((key.as_slice(), offset));
        }

        let index_offset = file.stream_position()?;
        for (key, offset) in &index {
            file.write_all(&(key.len() as u32).to_le_bytes())?;
            file.write_all(key)?;
            file.write_all(&offset.to_le_bytes())?;
        }

        file.write_all(&index_offset.to_le_bytes())?;
        file.write_all(&FOOTER_MAGIC.to_le_bytes())?;
        file.sync_data()?;
        Ok(Self { path })
    }

    /// Return the path of the written SSTable.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reader for an SSTable with its whole index held in memory.
pub struct SsTableReader {
    path: PathBuf,
    file: File,
    index: HashMap<Vec<u8>, u64>,
}

impl SsTableReader {
    /// Open an existing SSTable and read its footer + index into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < FOOTER_LEN {
            return Err(corrupted(path, "file too small"));
        }
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        let index_offset = read_u64(&mut file)?;
        let magic = read_u32(&mut file)?;
        if magic != FOOTER_MAGIC {
            return Err(corrupted(path, "bad footer magic"));
        }
        let index_end = file_len - FOOTER_LEN;
        if index_offset > index_end {
            return Err(corrupted(path, "index offset past footer"));
        }

        let mut index = HashMap::new();
        file.seek(SeekFrom::Start(index_offset))?;
        while file.stream_position()? < index_end {
            let key_len = read_u32(&mut file)? as usize;
            let mut key = vec![0u8; key_len];
            file.read_exact(&mut key)?;
            let offset = read_u64(&mut file)?;
            index.insert(key, offset);
        }
        Ok(Self { path: path.to_path_buf(), file, index })
    }

    /// Look a key up in this table, validating the entry checksum.
    pub fn get(&mut self, key: &[u8]) -> Result<Lookup> {
        let Some(&offset) = self.index.get(key) else {
            return Ok(Lookup::Absent);
        };
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; ENTRY_HEADER_LEN];
        self.file.read_exact(&mut header)?;
        let flags = header[0];
        let key_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let val_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
        let crc = u32::from_le_bytes([header[9], header[10], header[11], header[12]]);

        let mut stored_key = vec![0u8; key_len];
        self.file.read_exact(&mut stored_key)?;
        let mut value = vec![0u8; val_len];
        self.file.read_exact(&mut value)?;

        if stored_key != key {
            return Err(corrupted(&self.path, "index points at wrong key"));
        }
        if entry_checksum(flags, &stored_key, &value) != crc {
            return Err(corrupted(&self.path, "entry checksum mismatch"));
        }
        if flags & FLAG_TOMBSTONE != 0 {
            return Ok(Lookup::Deleted);
        }
        Ok(Lookup::Value(Bytes::from(value)))
    }

    /// Number of keys indexed by this table.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the table indexes no keys.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn corrupted(path: &Path, reason: &str) -> StorageError {
    StorageError::Corrupted { file: path.display().to_string(), reason: reason.to_string() }
}

fn read_u32(file: &mut File) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut File) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// A single-writer LSM tree covering level 0 with size-based flushes.
pub struct LsmTree {
    mem: MemTable,
    /// Ordered newest-to-oldest so recent tables shadow older entries.
    sstables: Vec<SsTableReader>,
    dir: PathBuf,
    next_file_id: u64,
    flush_threshold: usize,
}

impl LsmTree {
    /// Open the tree rooted at `config.dir`, loading any existing SSTables.
    /// Tables that fail to open are skipped with a warning.
    pub fn open_or_create(config: &LsmConfig) -> Result<Self> {
        let dir = config.dir.clone();
        std::fs::create_dir_all(&dir)?;
        let mut tables: Vec<(u64, PathBuf)> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "sst").unwrap_or(false))
            .filter_map(|p| {
                let id = p.file_stem()?.to_str()?.parse::<u64>().ok()?;
                Some((id, p))
            })
            .collect();
        tables.sort_by_key(|(id, _)| std::cmp::Reverse(*id));

        let next_file_id = tables.first().map(|(id, _)| id + 1).unwrap_or(0);
        let mut sstables = Vec::with_capacity(tables.len());
        for (_, path) in tables {
            match SsTableReader::open(&path) {
                Ok(reader) => sstables.push(reader),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable sstable"),
            }
        }
        debug!(dir = %dir.display(), tables = sstables.len(), "opened lsm tree");
        Ok(Self { mem: MemTable::new(), sstables, dir, next_file_id, flush_threshold: config.flush_threshold })
    }

    /// Insert or update a key/value pair.
    pub fn put(&mut self, key: Vec<u8>, value: Bytes) -> Result<()> {
        self.mem.insert(key, value);
        self.maybe_flush()
    }

    /// Record a deletion tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
        self.mem.delete(key);
        self.maybe_flush()
    }

    /// Retrieve the live value for a key, searching newest data first.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.mem.get(key) {
            Lookup::Value(v) => return Ok(Some(v)),
            Lookup::Deleted => return Ok(None),
            Lookup::Absent => {}
        }
        for table in &mut self.sstables {
            match table.get(key)? {
                Lookup::Value(v) => return Ok(Some(v)),
                Lookup::Deleted => return Ok(None),
                Lookup::Absent => {}
            }
        }
        Ok(None)
    }

    /// Flush the memtable to a new level-0 SSTable on disk.
    pub fn flush(&mut self) -> Result<()> {
        if self.mem.is_empty() {
            return Ok(());
        }
        let writer = SsTableWriter::flush_to_path(&self.mem, &self.dir, self.next_file_id)?;
        debug!(path = %writer.path().display(), keys = self.mem.len(), "flushed memtable");
        self.next_file_id += 1;
        self.mem.clear();
        let reader = SsTableReader::open(writer.path())?;
        self.sstables.insert(0, reader);
        Ok(())
    }

    /// Number of SSTables currently loaded.
    pub fn table_count(&self) -> usize {
        self.sstables.len()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.mem.size() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush memtable on drop");
        }
    }
}

/// [`Storage`] backed by an [`LsmTree`].
pub struct LsmStorage {
    tree: Mutex<LsmTree>,
}

impl LsmStorage {
    /// Open (or create) the store described by `config`.
    pub fn open(config: &LsmConfig) -> Result<Self> {
        Ok(Self { tree: Mutex::new(LsmTree::open_or_create(config)?) })
    }

    /// Force the memtable to disk.
    pub fn flush(&self) -> Result<()> {
        self.tree.lock().flush()
    }
}

impl Storage for LsmStorage {
    fn get(&self, key: &[u8]) -> Result<Bytes> {
        self.tree.lock().get(key)?.ok_or(StorageError::KeyNotFound)
    }

    fn put(&self, key: &[u8], value: Bytes) -> Result<()> {
        self.tree.lock().put(key.to_vec(), value)
    }

    fn del(&self, key: &[u8]) -> Result<()> {
        self.tree.lock().delete(key.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, flush_threshold: usize) -> LsmConfig {
        LsmConfig { dir: dir.path().to_path_buf(), flush_threshold }
    }

    #[test]
    fn memtable_basic() {
        let mut mem = MemTable::new();
        mem.insert(b"key1".to_vec(), Bytes::from_static(b"val1"));
        mem.delete(b"key2".to_vec());
        assert_eq!(mem.get(b"key1"), Lookup::Value(Bytes::from_static(b"val1")));
        assert_eq!(mem.get(b"key2"), Lookup::Deleted);
        assert_eq!(mem.get(b"key3"), Lookup::Absent);
    }

    #[test]
    fn sstable_lookup() {
        let dir = TempDir::new().unwrap();
        let mut mem = MemTable::new();
        mem.insert(b"a".to_vec(), Bytes::from_static(b"1"));
        mem.delete(b"b".to_vec());
        let writer = SsTableWriter::flush_to_path(&mem, dir.path(), 0).unwrap();
        let mut reader = SsTableReader::open(writer.path()).unwrap();
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.get(b"a").unwrap(), Lookup::Value(Bytes::from_static(b"1")));
        assert_eq!(reader.get(b"b").unwrap(), Lookup::Deleted);
        assert_eq!(reader.get(b"c").unwrap(), Lookup::Absent);
    }

    #[test]
    fn checksum_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let mut mem = MemTable::new();
        mem.insert(b"a".to_vec(), Bytes::from_static(b"payload"));
        let writer = SsTableWriter::flush_to_path(&mem, dir.path(), 0).unwrap();

        // Flip a byte inside the value of the first (only) entry.
        let mut raw = std::fs::read(writer.path()).unwrap();
        raw[ENTRY_HEADER_LEN + 1] ^= 0xFF;
        std::fs::write(writer.path(), &raw).unwrap();

        let mut reader = SsTableReader::open(writer.path()).unwrap();
        assert!(matches!(reader.get(b"a"), Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn tombstone_shadows_flushed_value() {
        let tmp = TempDir::new().unwrap();
        let mut tree = LsmTree::open_or_create(&config(&tmp, 1 << 20)).unwrap();
        tree.put(b"hello".to_vec(), Bytes::from_static(b"world")).unwrap();
        tree.flush().unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), Some(Bytes::from_static(b"world")));
        tree.delete(b"hello".to_vec()).unwrap();
        assert_eq!(tree.get(b"hello").unwrap(), None);
        tree.flush().unwrap();
        assert_eq!(tree.table_count(), 2);
        assert_eq!(tree.get(b"hello").unwrap(), None);
    }

    #[test]
    fn threshold_triggers_flush() {
        let tmp = TempDir::new().unwrap();
        let mut tree = LsmTree::open_or_create(&config(&tmp, 8)).unwrap();
        tree.put(b"abcd".to_vec(), Bytes::from_static(b"efgh")).unwrap();
        assert_eq!(tree.table_count(), 1);
    }

    #[test]
    fn reopen_sees_flushed_data() {
        let tmp = TempDir::new().unwrap();
        {
            let storage = LsmStorage::open(&config(&tmp, 1 << 20)).unwrap();
            storage.put(b"k", Bytes::from_static(b"v1")).unwrap();
            storage.flush().unwrap();
            storage.put(b"k", Bytes::from_static(b"v2")).unwrap();
            // Drop flushes the second write.
        }
        let storage = LsmStorage::open(&config(&tmp, 1 << 20)).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Bytes::from_static(b"v2"));
        assert!(storage.get(b"missing").unwrap_err().is_not_found());
    }

    #[test]
    fn config_from_yaml_keeps_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lsm.yaml");
        std::fs::write(&path, "dir: /var/lib/serin\n").unwrap();
        let cfg = LsmConfig::load(&path).unwrap();
        assert_eq!(cfg.dir, PathBuf::from("/var/lib/serin"));
        assert_eq!(cfg.flush_threshold, DEFAULT_FLUSH_THRESHOLD);
    }
}
