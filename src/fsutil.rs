//! Filesystem helpers shared by both engines.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::warn;

/// Hard-link `src` to `dst`, degrading to a copy where a link cannot work.
///
/// - `EEXIST` with the same device and inode means the link is already
///   there; done.
/// - `EXDEV` (cross-device) silently copies.
/// - Any other link failure is logged once and copied.
///
/// `force_copy` skips linking entirely (the unique-copies knob).
pub fn link_or_copy(src: &Path, dst: &Path, force_copy: bool) -> io::Result<()> {
    if force_copy {
        fs::copy(src, dst)?;
        return Ok(());
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let a = fs::metadata(src)?;
            let b = fs::metadata(dst)?;
            if a.dev() == b.dev() && a.ino() == b.ino() {
                return Ok(());
            }
            warn!(
                src = %src.display(),
                dst = %dst.display(),
                "destination exists with different identity, copying over it"
            );
            fs::copy(src, dst)?;
            Ok(())
        }
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(src, dst)?;
            Ok(())
        }
        Err(err) => {
            warn!(
                src = %src.display(),
                dst = %dst.display(),
                %err,
                "hard link failed, copying instead"
            );
            fs::copy(src, dst)?;
            Ok(())
        }
    }
}

/// Move `src` to `dst`: rename when possible, copy-and-unlink across
/// devices.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
        Err(err) => Err(err),
    }
}

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}
