//! Mount primitives.
//!
//! Mounting goes through `mount(8)` so loop devices for file-backed images
//! are set up (and auto-cleared) by util-linux. Unmounting is a direct
//! `umount2(2)` call.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// An OS mount binding, created read-only by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
}

impl MountHandle {
    pub fn read_only(source: &Path, mount_point: &Path, fs_type: &str) -> Self {
        Self {
            source: source.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: "ro".to_string(),
        }
    }
}

/// Mount and unmount by path.
pub trait Mounter {
    fn mount(&self, handle: &MountHandle) -> io::Result<()>;
    fn unmount(&self, mount_point: &Path) -> io::Result<()>;
}

/// Host mounter. Requires `CAP_SYS_ADMIN`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, handle: &MountHandle) -> io::Result<()> {
        Cmd::new("mount")
            .env("LC_ALL", "C")
            .args(["-t", handle.fs_type.as_str(), "-o", handle.options.as_str()])
            .arg_path(&handle.source)
            .arg_path(&handle.mount_point)
            .error_msg(format!(
                "mounting '{}' as {}",
                handle.source.display(),
                handle.fs_type
            ))
            .run()
            .map(|_| ())
            .map_err(|e| io::Error::other(format!("{e:#}")))
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        let path = CString::new(mount_point.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `path` is a valid NUL-terminated string for the call.
        let rc = unsafe { libc::umount2(path.as_ptr(), 0) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
