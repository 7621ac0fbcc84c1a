//! Disk-space admission for incoming files.
//!
//! Reservations are tracked in a `pre_alloc` counter under one mutex so
//! concurrent sessions cannot jointly overcommit the destination
//! filesystem. A file's reservation is released when it finishes or fails.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Free/total/used bytes for a filesystem.
#[derive(Debug, Clone, Copy)]
struct FsUsage {
    free: u64,
    total: u64,
    used: u64,
}

enum Probe {
    Statvfs,
    #[cfg(test)]
    Fixed(FsUsage),
}

pub struct SpaceAdmitter {
    dir: PathBuf,
    min_free: Option<u64>,
    max_percent: Option<f64>,
    pre_alloc: Mutex<u64>,
    probe: Probe,
}

impl SpaceAdmitter {
    pub fn new(dir: PathBuf, min_free: Option<u64>, max_percent: Option<f64>) -> Self {
        Self {
            dir,
            min_free,
            max_percent,
            pre_alloc: Mutex::new(0),
            probe: Probe::Statvfs,
        }
    }

    #[cfg(test)]
    fn with_fixed_usage(
        usage: FsUsage,
        min_free: Option<u64>,
        max_percent: Option<f64>,
    ) -> Self {
        Self {
            dir: PathBuf::from("/"),
            min_free,
            max_percent,
            pre_alloc: Mutex::new(0),
            probe: Probe::Fixed(usage),
        }
    }

    /// Try to reserve `size` bytes. `Ok(true)` reserves; `Ok(false)` means
    /// the file must be refused. With no bounds configured the check is
    /// skipped entirely.
    pub fn admit(&self, size: u64) -> io::Result<bool> {
        if self.min_free.is_none() && self.max_percent.is_none() {
            return Ok(true);
        }
        let mut reserved = self
            .pre_alloc
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let usage = self.usage()?;

        if let Some(min_free) = self.min_free {
            let needed = u128::from(*reserved) + u128::from(size) + u128::from(min_free);
            if u128::from(usage.free) < needed {
                debug!(
                    size,
                    free = usage.free,
                    reserved = *reserved,
                    min_free,
                    "admission refused: would breach free-space floor"
                );
                return Ok(false);
            }
        }
        if let Some(max_percent) = self.max_percent {
            if usage.total == 0 {
                return Ok(false);
            }
            let would_use = u128::from(usage.used) + u128::from(*reserved) + u128::from(size);
            let pct = would_use as f64 / usage.total as f64 * 100.0;
            if pct > max_percent {
                debug!(
                    size,
                    pct,
                    max_percent,
                    "admission refused: would breach usage ceiling"
                );
                return Ok(false);
            }
        }

        *reserved += size;
        Ok(true)
    }

    /// Give back a reservation made by [`SpaceAdmitter::admit`].
    pub fn release(&self, size: u64) {
        let mut reserved = self
            .pre_alloc
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *reserved = reserved.saturating_sub(size);
    }

    pub fn reserved(&self) -> u64 {
        *self
            .pre_alloc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn usage(&self) -> io::Result<FsUsage> {
        match &self.probe {
            Probe::Statvfs => statvfs(&self.dir),
            #[cfg(test)]
            Probe::Fixed(usage) => Ok(*usage),
        }
    }
}

fn statvfs(path: &Path) -> io::Result<FsUsage> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = if vfs.f_frsize > 0 {
        vfs.f_frsize as u64
    } else {
        vfs.f_bsize as u64
    };
    let total = vfs.f_blocks as u64 * frsize;
    let free = vfs.f_bavail as u64 * frsize;
    let used = total.saturating_sub(vfs.f_bfree as u64 * frsize);
    Ok(FsUsage { free, total, used })
}
