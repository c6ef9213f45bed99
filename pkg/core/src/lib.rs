use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Transmutes a signed/unsigned integer into its opposite-signedness
/// counterpart while preserving the underlying bit pattern.
///
/// Used by the signed-long codec to move between the biased unsigned
/// representation written to the wire/disk and the `i64` value callers
/// actually want, without relying on a bare `as` cast at every call site.
pub trait FlipSign<T> {
    fn flip(self) -> T;
}

impl FlipSign<u16> for i16 { fn flip(self) -> u16 { self as u16 } }
impl FlipSign<i16> for u16 { fn flip(self) -> i16 { self as i16 } }
impl FlipSign<u32> for i32 { fn flip(self) -> u32 { self as u32 } }
impl FlipSign<i32> for u32 { fn flip(self) -> i32 { self as i32 } }
impl FlipSign<u64> for i64 { fn flip(self) -> u64 { self as u64 } }
impl FlipSign<i64> for u64 { fn flip(self) -> i64 { self as i64 } }

#[derive(thiserror::Error, Debug)]
pub enum DirLockError {
    #[error("directory {0} is already locked by another process")]
    AlreadyLocked(PathBuf),
    #[error("failed to lock directory {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

/// Advisory exclusive lock on a data directory, held for the lifetime of the
/// value. Prevents two processes from pointing their log/store at the same
/// directory at once. Released automatically on drop.
pub struct DirLock {
    path: PathBuf,
    file: File,
}

impl DirLock {
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self, DirLockError> {
        let path = dir.as_ref().to_path_buf();
        let lock_path = path.join("LOCK");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|source| DirLockError::Io { path: path.clone(), source })?;

        file.try_lock_exclusive().map_err(|source| {
            if source.kind() == std::io::ErrorKind::WouldBlock {
                DirLockError::AlreadyLocked(path.clone())
            } else {
                DirLockError::Io { path: path.clone(), source }
            }
        })?;

        Ok(DirLock { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
