use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use crate::core::error::Result;

pub const META_EXT: &str = "meta";
pub const FORWARD_EXT: &str = "fwd";
pub const STRING_EXT: &str = "ext";
pub const INVERTED_EXT: &str = "ivt";
pub const DICT_EXT: &str = "dict";
pub const KV_EXT: &str = "btdb";
pub const BITMAP_EXT: &str = "btmp";

/// Artifacts a persisted partition owns, in deletion order.
pub const PARTITION_EXTS: [&str; 5] = [META_EXT, FORWARD_EXT, STRING_EXT, INVERTED_EXT, DICT_EXT];

/// Directory structure of one table:
///
/// ```text
/// <dir>/<table>.meta        table meta (JSON)
/// <dir>/<table>.btmp        deletion bitmap
/// <dir>/<table>.btdb        primary-key store
/// <dir>/<table>_pNNNNNN.*   partition artifacts (meta, fwd, ext, ivt, dict)
/// <dir>/.lock               writer lock
/// ```
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub dir: PathBuf,
    pub name: String,
}

impl TableLayout {
    pub fn new(dir: PathBuf, name: &str) -> Self {
        TableLayout {
            dir,
            name: name.to_string(),
        }
    }

    pub fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, META_EXT))
    }

    pub fn bitmap_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, BITMAP_EXT))
    }

    pub fn pk_store_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.name, KV_EXT))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(".lock")
    }

    pub fn partition_name(&self, counter: u64) -> String {
        format!("{}_p{:06}", self.name, counter)
    }

    /// Path prefix shared by a partition's artifacts; the extension is appended per file.
    pub fn partition_prefix(&self, partition: &str) -> PathBuf {
        self.dir.join(partition)
    }

    /// Partition names found on disk (by any artifact), whether listed in the meta or not.
    pub fn partitions_on_disk(&self) -> Result<Vec<String>> {
        let marker = format!("{}_p", self.name);
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let is_partition = stem
                .strip_prefix(&marker)
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
            if is_partition && !names.iter().any(|n| n == stem) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// `<prefix>.<ext>`
pub fn artifact_path(prefix: &Path, ext: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

/// Delete every artifact of the partition at `prefix`; missing files are fine.
pub fn remove_partition_files(prefix: &Path) -> Result<()> {
    for ext in PARTITION_EXTS {
        let path = artifact_path(prefix, ext);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let tmp = path.with_extension(format!("{}.tmp", ext));
        let _ = fs::remove_file(tmp);
    }
    Ok(())
}

/// Write JSON to a temp file, fsync it, then rename over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("meta.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        // Directory fsync makes the rename durable; not all platforms allow it.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partition_paths_and_discovery() {
        let dir = TempDir::new().unwrap();
        let layout = TableLayout::new(dir.path().to_path_buf(), "t");
        let name = layout.partition_name(3);
        assert_eq!(name, "t_p000003");

        let prefix = layout.partition_prefix(&name);
        fs::write(artifact_path(&prefix, FORWARD_EXT), b"x").unwrap();
        fs::write(artifact_path(&prefix, META_EXT), b"{}").unwrap();
        fs::write(layout.meta_path(), b"{}").unwrap();

        assert_eq!(layout.partitions_on_disk().unwrap(), vec![name.clone()]);
        remove_partition_files(&prefix).unwrap();
        assert!(layout.partitions_on_disk().unwrap().is_empty());
    }

    #[test]
    fn atomic_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.meta");
        write_json_atomic(&path, &vec![1u32, 2, 3]).unwrap();
        let back: Vec<u32> = read_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        assert!(!path.with_extension("meta.tmp").exists());
    }
}
