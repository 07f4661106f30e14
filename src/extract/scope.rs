//! Release scope for mounts and temporary mount points.
//!
//! Everything acquired through a [`CleanupScope`] is released exactly once:
//! by [`CleanupScope::unwind`] on normal and error paths, or by `Drop` if
//! the scope is abandoned (for example by a panic). Mounts are released
//! first, newest first, then directories, newest first.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::mount::{MountHandle, Mounter};
use crate::error::{CleanupAction, CleanupWarning};

/// Prefix of per-invocation mount point directories.
pub const TEMP_PREFIX: &str = "temp_";

pub struct CleanupScope<'m> {
    mounter: &'m dyn Mounter,
    root: PathBuf,
    mounts: Vec<MountHandle>,
    dirs: Vec<PathBuf>,
}

impl<'m> CleanupScope<'m> {
    pub fn new(mounter: &'m dyn Mounter, root: &Path) -> Self {
        Self {
            mounter,
            root: root.to_path_buf(),
            mounts: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// Create a fresh, uniquely named empty directory under the root.
    pub fn temp_dir(&mut self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&self.root)?
            .keep();
        debug!(path = %dir.display(), "created temporary mount point");
        self.dirs.push(dir.clone());
        Ok(dir)
    }

    /// Mount `handle`; on success the scope owns the unmount.
    pub fn mount(&mut self, handle: MountHandle) -> io::Result<()> {
        self.mounter.mount(&handle)?;
        debug!(
            source = %handle.source.display(),
            mount_point = %handle.mount_point.display(),
            fs_type = %handle.fs_type,
            "mounted"
        );
        self.mounts.push(handle);
        Ok(())
    }

    pub fn active_mounts(&self) -> usize {
        self.mounts.len()
    }

    /// Release everything held, returning the steps that failed.
    pub fn unwind(&mut self) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let mut still_mounted = HashSet::new();

        while let Some(handle) = self.mounts.pop() {
            match self.mounter.unmount(&handle.mount_point) {
                Ok(()) => debug!(mount_point = %handle.mount_point.display(), "unmounted"),
                Err(io) => {
                    still_mounted.insert(handle.mount_point.clone());
                    warnings.push(warning(CleanupAction::Unmount, &handle.mount_point, io));
                }
            }
        }

        while let Some(dir) = self.dirs.pop() {
            // A mount point that failed to unmount is left in place rather
            // than walked into.
            if still_mounted.contains(&dir) {
                continue;
            }
            if let Err(io) = fs::remove_dir(&dir) {
                warnings.push(warning(CleanupAction::RemoveDir, &dir, io));
            }
        }

        warnings
    }
}

impl Drop for CleanupScope<'_> {
    fn drop(&mut self) {
        if self.mounts.is_empty() && self.dirs.is_empty() {
            return;
        }
        // Warnings were already logged as they happened.
        let _ = self.unwind();
    }
}

fn warning(action: CleanupAction, path: &Path, io: io::Error) -> CleanupWarning {
    let warning = CleanupWarning {
        action,
        path: path.to_path_buf(),
        io,
    };
    warn!("{warning}");
    warning
}
