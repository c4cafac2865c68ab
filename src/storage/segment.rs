use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use memmap2::Mmap;
use parking_lot::{RwLock, RwLockReadGuard};
use crate::core::error::{Error, Result};
use crate::index::term_dict::{DictBytes, TermDict};
use crate::mmap::mmap_file::MmapFile;
use crate::storage::layout::{artifact_path, DICT_EXT, FORWARD_EXT, INVERTED_EXT, STRING_EXT};

/// The shared files behind one persisted partition.
///
/// `fwd` holds every field's forward array, `ext` every string field's values,
/// `ivt` every field's postings, `dict` one FST per inverted field mapping term to
/// postings offset. Only `fwd` is written after sealing (in-place numeric updates),
/// hence the lock.
pub struct SegmentFiles {
    prefix: PathBuf,
    fwd: RwLock<MmapFile>,
    pub ext: MmapFile,
    pub ivt: MmapFile,
    dict_out: Option<BufWriter<File>>,
    dict_len: u64,
    dict: Option<Arc<Mmap>>,
}

impl SegmentFiles {
    /// Fresh, empty artifacts for a partition being built.
    pub fn create(prefix: &Path) -> Result<Self> {
        let dict_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(artifact_path(prefix, DICT_EXT))?;
        Ok(SegmentFiles {
            prefix: prefix.to_path_buf(),
            fwd: RwLock::new(MmapFile::open(artifact_path(prefix, FORWARD_EXT), false)?),
            ext: MmapFile::open(artifact_path(prefix, STRING_EXT), false)?,
            ivt: MmapFile::open(artifact_path(prefix, INVERTED_EXT), false)?,
            dict_out: Some(BufWriter::new(dict_file)),
            dict_len: 0,
            dict: None,
        })
    }

    pub fn load(prefix: &Path) -> Result<Self> {
        Ok(SegmentFiles {
            prefix: prefix.to_path_buf(),
            fwd: RwLock::new(MmapFile::open(artifact_path(prefix, FORWARD_EXT), true)?),
            ext: MmapFile::open(artifact_path(prefix, STRING_EXT), true)?,
            ivt: MmapFile::open(artifact_path(prefix, INVERTED_EXT), true)?,
            dict_out: None,
            dict_len: 0,
            dict: map_dict(&artifact_path(prefix, DICT_EXT))?,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn fwd(&self) -> RwLockReadGuard<'_, MmapFile> {
        self.fwd.read()
    }

    /// Write access to the forward file, for in-place numeric updates.
    pub fn with_fwd_mut<T>(&self, f: impl FnOnce(&mut MmapFile) -> Result<T>) -> Result<T> {
        let mut fwd = self.fwd.write();
        f(&mut fwd)
    }

    /// Exclusive access while the segment is being built.
    pub fn fwd_mut(&mut self) -> &mut MmapFile {
        self.fwd.get_mut()
    }

    /// Postings file and dictionary writer of a segment being built, plus the
    /// offset the next dictionary will start at.
    pub fn postings_and_dict(&mut self) -> Result<(&mut MmapFile, &mut BufWriter<File>, u64)> {
        let out = self
            .dict_out
            .as_mut()
            .ok_or_else(|| Error::internal(format!("segment {} is already sealed", self.prefix.display())))?;
        Ok((&mut self.ivt, out, self.dict_len))
    }

    /// Account for a dictionary of `len` bytes just written through `postings_and_dict`.
    pub fn dict_written(&mut self, len: u64) {
        self.dict_len += len;
    }

    /// The dictionary stored at `[offset, offset + len)` of the `.dict` file.
    pub fn term_dict(&self, offset: u64, len: u64) -> Result<TermDict> {
        let map = self.dict.as_ref().ok_or_else(|| {
            Error::corrupt(format!("segment {} has no term dictionaries", self.prefix.display()))
        })?;
        TermDict::open(DictBytes::new(map.clone(), offset, len)?)
    }

    /// Flush everything. The first sync of a segment being built also closes its
    /// dictionary file and maps it for reading.
    pub fn sync(&mut self) -> Result<()> {
        self.fwd.get_mut().sync()?;
        self.ext.sync()?;
        self.ivt.sync()?;
        if let Some(mut out) = self.dict_out.take() {
            out.flush()?;
            out.get_ref().sync_all()?;
            drop(out);
            self.dict = map_dict(&artifact_path(&self.prefix, DICT_EXT))?;
        }
        Ok(())
    }

    /// Flush forward updates made through `with_fwd_mut`.
    pub fn sync_shared(&self) -> Result<()> {
        self.fwd.write().sync()
    }
}

fn map_dict(path: &Path) -> Result<Option<Arc<Mmap>>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    let map = unsafe { Mmap::map(&file)? };
    Ok(Some(Arc::new(map)))
}
