use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use crc32fast::Hasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};

/// Largest record the replay accepts before declaring the tail torn.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Bytes between fsyncs in `SyncMode::Batch`.
const BATCH_SYNC_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Immediate, // fsync after every record
    Batch,     // fsync every BATCH_SYNC_BYTES
    None,      // leave it to the OS until sync()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Record {
    AddTree(String),
    Set { tree: String, key: String, value: u64 },
    Bulk { tree: String, entries: Vec<(String, u64)> },
    Remove { tree: String, key: String },
}

/// Persistent ordered map of named trees, each mapping string keys to u64 values.
///
/// The file is an append-only log of CRC32-framed records
/// (`[len:u32 LE][crc:u32 LE][bincode record]`) replayed into memory at open.
/// Lookups on a missing tree or key return `None`.
pub struct KvStore {
    path: PathBuf,
    sync_mode: SyncMode,
    inner: RwLock<KvInner>,
}

struct KvInner {
    trees: BTreeMap<String, BTreeMap<String, u64>>,
    file: File,
    position: u64,
    unsynced: u64,
    records: u64,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P, sync_mode: SyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let (trees, position, records) = replay(&mut file, &path)?;
        file.seek(SeekFrom::Start(position))?;

        Ok(KvStore {
            path,
            sync_mode,
            inner: RwLock::new(KvInner {
                trees,
                file,
                position,
                unsynced: 0,
                records,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_tree(&self, tree: &str) -> bool {
        self.inner.read().trees.contains_key(tree)
    }

    pub fn add_tree(&self, tree: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.trees.contains_key(tree) {
            return Ok(());
        }
        inner.append(&Record::AddTree(tree.to_string()), self.sync_mode)?;
        inner.trees.insert(tree.to_string(), BTreeMap::new());
        Ok(())
    }

    pub fn set(&self, tree: &str, key: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.trees.contains_key(tree) {
            return Err(Error::not_found("tree", tree));
        }
        inner.append(
            &Record::Set {
                tree: tree.to_string(),
                key: key.to_string(),
                value,
            },
            self.sync_mode,
        )?;
        if let Some(map) = inner.trees.get_mut(tree) {
            map.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// Insert many pairs as a single record, so either all of them replay or none do.
    pub fn bulk_set<I>(&self, tree: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let entries: Vec<(String, u64)> = entries.into_iter().collect();
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        if !inner.trees.contains_key(tree) {
            return Err(Error::not_found("tree", tree));
        }
        let record = Record::Bulk {
            tree: tree.to_string(),
            entries,
        };
        inner.append(&record, self.sync_mode)?;
        if let (Record::Bulk { entries, .. }, Some(map)) = (record, inner.trees.get_mut(tree)) {
            map.extend(entries);
        }
        Ok(())
    }

    /// Remove `key`; returns the previous value.
    pub fn remove(&self, tree: &str, key: &str) -> Result<Option<u64>> {
        let mut inner = self.inner.write();
        let present = inner
            .trees
            .get(tree)
            .map(|map| map.contains_key(key))
            .unwrap_or(false);
        if !present {
            return Ok(None);
        }
        inner.append(
            &Record::Remove {
                tree: tree.to_string(),
                key: key.to_string(),
            },
            self.sync_mode,
        )?;
        Ok(inner.trees.get_mut(tree).and_then(|map| map.remove(key)))
    }

    pub fn get(&self, tree: &str, key: &str) -> Option<u64> {
        self.inner.read().trees.get(tree)?.get(key).copied()
    }

    pub fn first(&self, tree: &str) -> Option<(String, u64)> {
        let inner = self.inner.read();
        let (key, value) = inner.trees.get(tree)?.iter().next()?;
        Some((key.clone(), *value))
    }

    /// Smallest entry with a key strictly greater than `key`.
    pub fn next(&self, tree: &str, key: &str) -> Option<(String, u64)> {
        let inner = self.inner.read();
        let map = inner.trees.get(tree)?;
        let (key, value) = map
            .range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()?;
        Some((key.clone(), *value))
    }

    pub fn len(&self, tree: &str) -> usize {
        self.inner.read().trees.get(tree).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, tree: &str) -> bool {
        self.len(tree) == 0
    }

    /// Snapshot of every entry of `tree` in key order.
    pub fn entries(&self, tree: &str) -> Vec<(String, u64)> {
        self.inner
            .read()
            .trees
            .get(tree)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default()
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.file.sync_data()?;
        inner.unsynced = 0;
        Ok(())
    }

    /// Number of records in the log versus live entries; used to decide on `compact`.
    pub fn log_stats(&self) -> (u64, usize) {
        let inner = self.inner.read();
        let live = inner.trees.values().map(|m| m.len()).sum();
        (inner.records, live)
    }

    /// Rewrite the log as one bulk record per tree.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let tmp_path = self.path.with_extension("btdb.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            let mut records = 0u64;
            for (tree, map) in &inner.trees {
                write_frame(&mut writer, &Record::AddTree(tree.clone()))?;
                records += 1;
                if !map.is_empty() {
                    let record = Record::Bulk {
                        tree: tree.clone(),
                        entries: map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                    };
                    write_frame(&mut writer, &record)?;
                    records += 1;
                }
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            inner.records = records;
        }
        fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.position = file.seek(SeekFrom::End(0))?;
        inner.file = file;
        inner.unsynced = 0;
        log::debug!("compacted key store {}", self.path.display());
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.sync()
    }
}

impl KvInner {
    fn append(&mut self, record: &Record, sync_mode: SyncMode) -> Result<()> {
        let written = write_frame(&mut self.file, record)?;
        self.position += written;
        self.unsynced += written;
        self.records += 1;

        match sync_mode {
            SyncMode::Immediate => {
                self.file.sync_data()?;
                self.unsynced = 0;
            }
            SyncMode::Batch if self.unsynced >= BATCH_SYNC_BYTES => {
                self.file.sync_data()?;
                self.unsynced = 0;
            }
            _ => {}
        }
        Ok(())
    }
}

fn write_frame<W: Write>(writer: &mut W, record: &Record) -> Result<u64> {
    let data = bincode::serialize(record)?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(8 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&data);
    writer.write_all(&frame)?;
    Ok(frame.len() as u64)
}

type Trees = BTreeMap<String, BTreeMap<String, u64>>;

/// Replay every intact record; a torn or corrupt tail is truncated away.
fn replay(file: &mut File, path: &Path) -> Result<(Trees, u64, u64)> {
    let mut trees: Trees = BTreeMap::new();
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut data)?;

    let mut pos = 0usize;
    let mut records = 0u64;
    while pos < data.len() {
        let Some(record) = decode_frame(&data[pos..]) else {
            break;
        };
        let (record, frame_len) = record;
        apply(&mut trees, record);
        pos += frame_len;
        records += 1;
    }

    if pos < data.len() {
        log::warn!(
            "key store {}: discarding {} bytes of torn tail",
            path.display(),
            data.len() - pos
        );
        file.set_len(pos as u64)?;
    }

    Ok((trees, pos as u64, records))
}

fn decode_frame(buf: &[u8]) -> Option<(Record, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len > MAX_RECORD_LEN || buf.len() < 8 + len {
        return None;
    }
    let payload = &buf[8..8 + len];

    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return None;
    }
    let record = bincode::deserialize(payload).ok()?;
    Some((record, 8 + len))
}

fn apply(trees: &mut Trees, record: Record) {
    match record {
        Record::AddTree(tree) => {
            trees.entry(tree).or_default();
        }
        Record::Set { tree, key, value } => {
            trees.entry(tree).or_default().insert(key, value);
        }
        Record::Bulk { tree, entries } => {
            trees.entry(tree).or_default().extend(entries);
        }
        Record::Remove { tree, key } => {
            if let Some(map) = trees.get_mut(&tree) {
                map.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> KvStore {
        KvStore::open(dir.path().join("t.btdb"), SyncMode::None).unwrap()
    }

    #[test]
    fn missing_tree_and_key_are_empty() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(!store.has_tree("name"));
        assert_eq!(store.get("name", "x"), None);
        assert_eq!(store.first("name"), None);
        assert!(store.set("name", "x", 1).is_err());
    }

    #[test]
    fn first_next_walk_in_key_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.add_tree("desc").unwrap();
        store
            .bulk_set("desc", vec![("food".to_string(), 8), ("and".to_string(), 16), ("likes".to_string(), 32)])
            .unwrap();

        let mut keys = Vec::new();
        let mut cur = store.first("desc");
        while let Some((key, _)) = cur {
            cur = store.next("desc", &key);
            keys.push(key);
        }
        assert_eq!(keys, vec!["and", "food", "likes"]);
    }

    #[test]
    fn reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store.add_tree("pk").unwrap();
            store.set("pk", "10001", 0).unwrap();
            store.set("pk", "10002", 1).unwrap();
            store.remove("pk", "10001").unwrap();
            store.close().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.get("pk", "10001"), None);
        assert_eq!(store.get("pk", "10002"), Some(1));
        assert_eq!(store.len("pk"), 1);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.btdb");
        {
            let store = open(&dir);
            store.add_tree("pk").unwrap();
            store.set("pk", "a", 1).unwrap();
            store.close().unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xFF, 0x00, 0x00]).unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.get("pk", "a"), Some(1));
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn compact_preserves_entries() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir);
            store.add_tree("pk").unwrap();
            for i in 0..50u64 {
                store.set("pk", &format!("k{:03}", i), i).unwrap();
            }
            for i in 0..25u64 {
                store.remove("pk", &format!("k{:03}", i)).unwrap();
            }
            store.compact().unwrap();
            assert_eq!(store.log_stats().0, 2);
            store.set("pk", "zz", 7).unwrap();
            store.close().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.len("pk"), 26);
        assert_eq!(store.first("pk"), Some(("k025".to_string(), 25)));
        assert_eq!(store.get("pk", "zz"), Some(7));
    }
}
