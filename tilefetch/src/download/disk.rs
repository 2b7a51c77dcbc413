//! Free disk space queries used by the download preflight.

use std::path::{Path, PathBuf};

use crate::error::{FetchError, FetchResult};

/// Reports free space on the filesystem holding a path.
pub trait DiskSpace: Send + Sync {
    /// Bytes available to an unprivileged writer on the filesystem of `path`.
    fn available_bytes(&self, path: &Path) -> FetchResult<u64>;
}

/// [`DiskSpace`] backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsDiskSpace;

#[cfg(unix)]
impl DiskSpace for StatvfsDiskSpace {
    fn available_bytes(&self, path: &Path) -> FetchResult<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            FetchError::io(
                "could not query free space for",
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL byte"),
            )
        })?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if ret != 0 {
            return Err(FetchError::io(
                "could not query free space for",
                path,
                std::io::Error::last_os_error(),
            ));
        }

        #[allow(clippy::unnecessary_cast)]
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[cfg(not(unix))]
impl DiskSpace for StatvfsDiskSpace {
    fn available_bytes(&self, _path: &Path) -> FetchResult<u64> {
        Ok(u64::MAX)
    }
}

/// [`DiskSpace`] reporting a fixed number of free bytes.
#[derive(Debug, Clone, Copy)]
pub struct FixedDiskSpace(pub u64);

impl DiskSpace for FixedDiskSpace {
    fn available_bytes(&self, _path: &Path) -> FetchResult<u64> {
        Ok(self.0)
    }
}

/// Fail with [`FetchError::InsufficientSpace`] when `required` bytes do not fit.
pub fn ensure_space(disk: &dyn DiskSpace, path: &Path, required: u64) -> FetchResult<()> {
    let available = disk.available_bytes(path)?;
    if available < required {
        return Err(FetchError::InsufficientSpace {
            path: path.to_path_buf(),
            required,
            available,
        });
    }
    Ok(())
}

/// Directory whose filesystem will hold `destination`.
pub(crate) fn space_check_path(destination: &Path) -> PathBuf {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
