//! Directory tree operations: emptying the destination root and mirroring
//! the unpacked filesystem into it.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{lchown, symlink, MetadataExt, PermissionsExt};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::process::Cmd;

/// Mirror one directory tree onto another.
pub trait TreeSync {
    /// Copy the contents of `source` into `dest`, overwriting entries that
    /// already exist there.
    fn sync(&self, source: &Path, dest: &Path) -> io::Result<()>;
}

/// In-process mirror preserving modes, ownership, extended attributes
/// (file capabilities, SELinux labels), timestamps, symlinks, hard links,
/// FIFOs and device nodes. Sockets are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct MirrorSync;

impl TreeSync for MirrorSync {
    fn sync(&self, source: &Path, dest: &Path) -> io::Result<()> {
        fs::create_dir_all(dest)?;
        let mut dirs = Vec::new();
        let mut links: HashMap<(u64, u64), std::path::PathBuf> = HashMap::new();

        for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(io::Error::other)?;
            let target = dest.join(rel);
            let meta = entry.path().symlink_metadata()?;
            let file_type = meta.file_type();

            replace_conflicting(&target, file_type.is_dir())?;

            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
                dirs.push((entry.path().to_path_buf(), target, meta));
                continue;
            }

            if meta.nlink() > 1 {
                if let Some(first) = links.get(&(meta.dev(), meta.ino())) {
                    fs::hard_link(first, &target)?;
                    continue;
                }
                links.insert((meta.dev(), meta.ino()), target.clone());
            }

            if file_type.is_symlink() {
                symlink(fs::read_link(entry.path())?, &target)?;
                lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
                copy_xattrs(entry.path(), &target)?;
                set_times(&target, &meta)?;
            } else if file_type.is_file() {
                fs::copy(entry.path(), &target)?;
                apply_metadata(entry.path(), &target, &meta)?;
            } else if is_node(&meta) {
                make_node(&target, &meta)?;
                apply_metadata(entry.path(), &target, &meta)?;
            } else {
                debug!(path = %entry.path().display(), "skipping socket");
            }
        }

        // Directory modes and times last, deepest first, so read-only
        // directories can still be populated and mtimes stay put.
        for (from, dir, meta) in dirs.iter().rev() {
            apply_metadata(from, dir, meta)?;
        }
        apply_metadata(source, dest, &fs::symlink_metadata(source)?)?;
        Ok(())
    }
}

/// `rsync -aHAX --delete`, for hosts that prefer it over [`MirrorSync`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RsyncSync;

impl TreeSync for RsyncSync {
    fn sync(&self, source: &Path, dest: &Path) -> io::Result<()> {
        // Trailing slash: copy the contents, not the directory itself.
        let mut from = source.as_os_str().to_os_string();
        from.push("/");
        Cmd::new("rsync")
            .args(["-aHAX", "--numeric-ids", "--delete"])
            .arg(from)
            .arg_path(dest)
            .error_msg("rsync failed")
            .run()
            .map(|_| ())
            .map_err(|e| io::Error::other(format!("{e:#}")))
    }
}

/// Leave `path` as an empty directory, creating it if absent.
///
/// Only the contents are removed; the directory entry itself is kept.
pub fn clear_directory(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return fs::create_dir_all(path),
        Err(e) => return Err(e),
        Ok(meta) if !meta.is_dir() => {
            return Err(io::Error::other(format!(
                "'{}' exists and is not a directory",
                path.display()
            )))
        }
        Ok(_) => {}
    }

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        remove_entry(&entry.path(), entry.file_type()?.is_dir())?;
    }
    Ok(())
}

fn remove_entry(path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn replace_conflicting(target: &Path, source_is_dir: bool) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(existing) if existing.is_dir() && source_is_dir => Ok(()),
        Ok(existing) => remove_entry(target, existing.is_dir()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_node(meta: &Metadata) -> bool {
    let kind = meta.mode() & libc::S_IFMT;
    kind == libc::S_IFIFO || kind == libc::S_IFCHR || kind == libc::S_IFBLK
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn make_node(target: &Path, meta: &Metadata) -> io::Result<()> {
    let path = c_path(target)?;
    // SAFETY: `path` is NUL-terminated; mode and rdev come from stat(2).
    let rc = unsafe {
        libc::mknod(
            path.as_ptr(),
            meta.mode() as libc::mode_t,
            meta.rdev() as libc::dev_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Ownership, then mode and extended attributes (chown clears setuid bits
/// and file capabilities), then times.
fn apply_metadata(source: &Path, target: &Path, meta: &Metadata) -> io::Result<()> {
    lchown(target, Some(meta.uid()), Some(meta.gid()))?;
    fs::set_permissions(target, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    copy_xattrs(source, target)?;
    set_times(target, meta)
}

/// Copy every extended attribute of `source` onto `target` without
/// following symlinks. A destination filesystem without xattr support is
/// not an error.
fn copy_xattrs(source: &Path, target: &Path) -> io::Result<()> {
    let src = c_path(source)?;
    let dst = c_path(target)?;

    let names = match xattr_call(|buf, len| unsafe {
        // SAFETY: `src` is NUL-terminated; `buf` is valid for `len` bytes.
        libc::llistxattr(src.as_ptr(), buf.cast(), len)
    }) {
        Ok(names) => names,
        Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(()),
        Err(e) => return Err(e),
    };

    for name in names.split(|&b| b == 0).filter(|name| !name.is_empty()) {
        let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let value = match xattr_call(|buf, len| unsafe {
            // SAFETY: both strings are NUL-terminated; `buf` is valid for `len` bytes.
            libc::lgetxattr(src.as_ptr(), name.as_ptr(), buf.cast(), len)
        }) {
            Ok(value) => value,
            // Removed between list and get.
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => continue,
            Err(e) => return Err(e),
        };
        let current = xattr_call(|buf, len| unsafe {
            // SAFETY: as above, for the destination path.
            libc::lgetxattr(dst.as_ptr(), name.as_ptr(), buf.cast(), len)
        });
        if current.is_ok_and(|current| current == value) {
            continue;
        }
        // SAFETY: both strings are NUL-terminated; `value` is valid for its length.
        let rc = unsafe {
            libc::lsetxattr(
                dst.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOTSUP) {
                debug!(path = %target.display(), "destination does not support xattrs");
                return Ok(());
            }
            return Err(io::Error::new(
                err.kind(),
                format!(
                    "setting xattr {} on '{}': {err}",
                    name.to_string_lossy(),
                    target.display()
                ),
            ));
        }
    }
    Ok(())
}

/// Run a size-query-then-fill xattr call, retrying if the value grew in
/// between.
fn xattr_call<F>(mut call: F) -> io::Result<Vec<u8>>
where
    F: FnMut(*mut u8, usize) -> libc::ssize_t,
{
    loop {
        let size = call(std::ptr::null_mut(), 0);
        if size < 0 {
            return Err(io::Error::last_os_error());
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; size as usize];
        let filled = call(buf.as_mut_ptr(), buf.len());
        if filled >= 0 {
            buf.truncate(filled as usize);
            return Ok(buf);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ERANGE) {
            return Err(err);
        }
    }
}

fn set_times(target: &Path, meta: &Metadata) -> io::Result<()> {
    let path = c_path(target)?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as libc::c_long,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as libc::c_long,
        },
    ];
    // SAFETY: `path` is NUL-terminated and `times` holds two timespecs.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
