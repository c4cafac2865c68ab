use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use memmap2::{MmapMut, MmapOptions};
use crate::core::error::{Error, Result};

/// Bytes reserved at the start of every file for the persisted append cursor.
pub const HEADER_LEN: u64 = 8;

/// Growth granularity of a mapped file.
pub const INITIAL_CHUNK: u64 = 1024 * 1024;

/// Growable file-backed byte region with an embedded append cursor.
///
/// Layout: `[cursor:u64 LE][data ...]`. All offsets handed out by this type are
/// absolute (measured from byte 0), so the first appended byte lives at `HEADER_LEN`.
/// The cursor is kept in memory and written back to the header on `sync`.
pub struct MmapFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    capacity: u64,
    cursor: u64,
}

impl MmapFile {
    /// Open `path`. With `load` the existing file is mapped and its cursor read back
    /// from the header; otherwise the file is created (or truncated) to one chunk.
    pub fn open<P: AsRef<Path>>(path: P, load: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if load {
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let capacity = file.metadata()?.len();
            if capacity < HEADER_LEN {
                return Err(Error::corrupt(format!(
                    "{}: file shorter than header ({} bytes)",
                    path.display(),
                    capacity
                )));
            }

            let mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };
            let cursor = u64::from_le_bytes(read_array(&mmap, 0));
            if cursor < HEADER_LEN || cursor > capacity {
                return Err(Error::corrupt(format!(
                    "{}: cursor {} outside [{}, {}]",
                    path.display(),
                    cursor,
                    HEADER_LEN,
                    capacity
                )));
            }

            Ok(MmapFile { path, file, mmap, capacity, cursor })
        } else {
            Self::create(path, INITIAL_CHUNK + HEADER_LEN)
        }
    }

    /// Create a file pre-sized to `capacity` bytes (header included).
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let capacity = capacity.max(HEADER_LEN);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;

        let mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&file)? };
        let mut mmap_file = MmapFile {
            path,
            file,
            mmap,
            capacity,
            cursor: HEADER_LEN,
        };
        mmap_file.write_u64_le(0, HEADER_LEN)?;
        Ok(mmap_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    // Reads

    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::corrupt("read range overflows"))?;
        if end > self.capacity {
            return Err(Error::corrupt(format!(
                "{}: read [{}, {}) beyond capacity {}",
                self.path.display(),
                offset,
                end,
                self.capacity
            )));
        }
        Ok(&self.mmap[offset as usize..end as usize])
    }

    pub fn read_u64_le(&self, offset: u64) -> Result<u64> {
        let bytes = self.read_bytes(offset, 8)?;
        Ok(u64::from_le_bytes(read_array(bytes, 0)))
    }

    pub fn read_i64_le(&self, offset: u64) -> Result<i64> {
        Ok(self.read_u64_le(offset)? as i64)
    }

    pub fn read_str(&self, offset: u64, len: u64) -> Result<String> {
        let bytes = self.read_bytes(offset, len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::corrupt(format!("{}: invalid UTF-8 at {}", self.path.display(), offset)))
    }

    // Positional writes (no growth)

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len() as u64;
        if end > self.capacity {
            return Err(Error::corrupt(format!(
                "{}: write [{}, {}) beyond capacity {}",
                self.path.display(),
                offset,
                end,
                self.capacity
            )));
        }
        self.mmap[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u64_le(&mut self, offset: u64, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_i64_le(&mut self, offset: u64, value: i64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn write_str(&mut self, offset: u64, value: &str) -> Result<()> {
        self.write_bytes(offset, value.as_bytes())
    }

    // Appends at the cursor; each returns the offset the data was written at.

    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.cursor;
        self.reserve(bytes.len() as u64)?;
        self.write_bytes(offset, bytes)?;
        self.cursor += bytes.len() as u64;
        Ok(offset)
    }

    pub fn append_u64(&mut self, value: u64) -> Result<u64> {
        self.append_bytes(&value.to_le_bytes())
    }

    pub fn append_i64(&mut self, value: i64) -> Result<u64> {
        self.append_bytes(&value.to_le_bytes())
    }

    pub fn append_str(&mut self, value: &str) -> Result<u64> {
        self.append_bytes(value.as_bytes())
    }

    /// Make room for `extra` bytes past the cursor, growing the file by the smallest
    /// multiple of `INITIAL_CHUNK` that fits.
    pub fn reserve(&mut self, extra: u64) -> Result<()> {
        let needed = self.cursor + extra;
        if needed <= self.capacity {
            return Ok(());
        }
        let shortfall = needed - self.capacity;
        let chunks = shortfall.div_ceil(INITIAL_CHUNK);
        self.grow_to(self.capacity + chunks * INITIAL_CHUNK)
    }

    /// Extend the file to exactly `capacity` bytes and remap. Shrinking is ignored.
    pub fn grow_to(&mut self, capacity: u64) -> Result<()> {
        if capacity <= self.capacity {
            return Ok(());
        }
        self.mmap.flush()?;
        self.file.set_len(capacity)?;
        self.mmap = unsafe { MmapOptions::new().len(capacity as usize).map_mut(&self.file)? };
        self.capacity = capacity;
        Ok(())
    }

    /// Persist the cursor into the header and flush the mapping.
    pub fn sync(&mut self) -> Result<()> {
        let cursor = self.cursor;
        self.write_u64_le(0, cursor)?;
        self.mmap.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

fn read_array(bytes: &[u8], offset: usize) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_file_starts_after_header() {
        let dir = TempDir::new().unwrap();
        let file = MmapFile::open(dir.path().join("a.fwd"), false).unwrap();
        assert_eq!(file.cursor(), HEADER_LEN);
        assert_eq!(file.capacity(), INITIAL_CHUNK + HEADER_LEN);
    }

    #[test]
    fn cursor_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.ext");

        let mut file = MmapFile::open(&path, false).unwrap();
        let off = file.append_u64(42).unwrap();
        let str_off = file.append_str("hello").unwrap();
        file.close().unwrap();

        let file = MmapFile::open(&path, true).unwrap();
        assert_eq!(off, HEADER_LEN);
        assert_eq!(file.cursor(), HEADER_LEN + 8 + 5);
        assert_eq!(file.read_u64_le(off).unwrap(), 42);
        assert_eq!(file.read_str(str_off, 5).unwrap(), "hello");
    }

    #[test]
    fn append_grows_by_whole_chunks() {
        let dir = TempDir::new().unwrap();
        let mut file = MmapFile::open(dir.path().join("big.ivt"), false).unwrap();
        let payload = vec![7u8; (INITIAL_CHUNK + 10) as usize];
        let off = file.append_bytes(&payload).unwrap();

        assert_eq!(file.capacity(), 2 * INITIAL_CHUNK + HEADER_LEN);
        assert_eq!(file.read_bytes(off + INITIAL_CHUNK, 10).unwrap(), &[7u8; 10]);
    }

    #[test]
    fn positional_write_does_not_move_cursor() {
        let dir = TempDir::new().unwrap();
        let mut file = MmapFile::open(dir.path().join("a.fwd"), false).unwrap();
        let off = file.append_i64(-5).unwrap();
        file.write_i64_le(off, 99).unwrap();

        assert_eq!(file.read_i64_le(off).unwrap(), 99);
        assert_eq!(file.cursor(), HEADER_LEN + 8);
        assert!(file.write_u64_le(file.capacity(), 1).is_err());
    }

    #[test]
    fn corrupt_cursor_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.fwd");
        let mut file = MmapFile::open(&path, false).unwrap();
        file.write_u64_le(0, u64::MAX).unwrap();
        drop(file);

        let err = MmapFile::open(&path, true).err().unwrap();
        assert_eq!(err.kind, crate::core::error::ErrorKind::CorruptData);
    }
}
