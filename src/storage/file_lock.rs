use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use crate::core::error::{Error, ErrorKind, Result};

/// Single writer guarantee for a table directory
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Take the exclusive lock at `path`, failing at once if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_EX, LOCK_NB};

            let fd = file.as_raw_fd();
            unsafe {
                if flock(fd, LOCK_EX | LOCK_NB) != 0 {
                    return Err(Error::new(
                        ErrorKind::Io,
                        format!("{} is locked by another process", path.display()),
                    ));
                }
            }
        }

        Ok(FileLock {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            use libc::{flock, LOCK_UN};

            let fd = self.file.as_raw_fd();
            unsafe {
                flock(fd, LOCK_UN);
            }
        }
    }
}
