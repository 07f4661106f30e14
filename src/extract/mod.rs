//! Root filesystem extraction from an ISO9660 image carrying a nested
//! squashfs image.
//!
//! ```text
//! Init ──mount outer──▶ OuterMounted ──mount nested──▶ InnerMounted
//!   ──clear dest──▶ DestinationCleared ──sync──▶ Synced ──▶ Cleanup ──▶ Done
//! ```
//!
//! Any step can fail; the [`scope::CleanupScope`] then unmounts and removes
//! whatever was acquired, and the failure is reported together with the
//! last state reached. Cleanup runs on the success path too.

pub mod mount;
pub mod scope;
pub mod tree;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CleanupWarning, Error};
use mount::{MountHandle, Mounter};
use scope::CleanupScope;
use tree::{clear_directory, TreeSync};

/// Where the nested image lives and which drivers mount what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayout {
    /// Path of the nested image relative to the outer image root.
    pub nested_image: PathBuf,
    pub outer_fs: String,
    pub inner_fs: String,
}

impl Default for ImageLayout {
    fn default() -> Self {
        Self {
            nested_image: PathBuf::from("live/filesystem.squashfs"),
            outer_fs: "iso9660".to_string(),
            inner_fs: "squashfs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    Init,
    OuterMounted,
    InnerMounted,
    DestinationCleared,
    Synced,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for ExtractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractState::Init => "init",
            ExtractState::OuterMounted => "outer-mounted",
            ExtractState::InnerMounted => "inner-mounted",
            ExtractState::DestinationCleared => "destination-cleared",
            ExtractState::Synced => "synced",
            ExtractState::Cleanup => "cleanup",
            ExtractState::Done => "done",
            ExtractState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Successful extraction.
#[derive(Debug)]
pub struct ExtractReport {
    pub warnings: Vec<CleanupWarning>,
}

/// Failed extraction, after cleanup has run.
#[derive(Debug)]
pub struct ExtractFailure {
    /// Last state reached before the failing transition.
    pub reached: ExtractState,
    pub error: Error,
    pub warnings: Vec<CleanupWarning>,
}

/// Drives one image through the extraction states.
pub struct Extractor<'a> {
    mounter: &'a dyn Mounter,
    sync: &'a dyn TreeSync,
    work_root: PathBuf,
    layout: ImageLayout,
}

impl<'a> Extractor<'a> {
    /// `work_root` receives the per-invocation mount point directories.
    pub fn new(mounter: &'a dyn Mounter, sync: &'a dyn TreeSync, work_root: &Path) -> Self {
        Self {
            mounter,
            sync,
            work_root: work_root.to_path_buf(),
            layout: ImageLayout::default(),
        }
    }

    pub fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Replace the contents of `destination` with the nested filesystem of
    /// `image`.
    ///
    /// On failure the destination may be partially populated; it is not
    /// rolled back.
    pub fn extract(&self, image: &Path, destination: &Path) -> Result<ExtractReport, ExtractFailure> {
        let mut scope = CleanupScope::new(self.mounter, &self.work_root);
        let mut state = ExtractState::Init;

        let result = self.run(&mut scope, &mut state, image, destination);
        let reached = state;

        enter(&mut state, ExtractState::Cleanup);
        let warnings = scope.unwind();

        match result {
            Ok(()) => {
                enter(&mut state, ExtractState::Done);
                info!(image = %image.display(), destination = %destination.display(), "root image unpacked");
                Ok(ExtractReport { warnings })
            }
            Err(error) => {
                enter(&mut state, ExtractState::Failed);
                Err(ExtractFailure {
                    reached,
                    error,
                    warnings,
                })
            }
        }
    }

    fn run(
        &self,
        scope: &mut CleanupScope<'_>,
        state: &mut ExtractState,
        image: &Path,
        destination: &Path,
    ) -> Result<(), Error> {
        let outer_dir = scope.temp_dir().map_err(|io| Error::Mount {
            path: image.to_path_buf(),
            mount_point: self.work_root.clone(),
            io,
        })?;
        scope
            .mount(MountHandle::read_only(image, &outer_dir, &self.layout.outer_fs))
            .map_err(|io| Error::Mount {
                path: image.to_path_buf(),
                mount_point: outer_dir.clone(),
                io,
            })?;
        enter(state, ExtractState::OuterMounted);

        let nested = outer_dir.join(&self.layout.nested_image);
        if !nested.is_file() {
            return Err(Error::MalformedImage {
                image: image.to_path_buf(),
                expected: self.layout.nested_image.clone(),
            });
        }

        let inner_dir = scope.temp_dir().map_err(|io| Error::Mount {
            path: nested.clone(),
            mount_point: self.work_root.clone(),
            io,
        })?;
        scope
            .mount(MountHandle::read_only(&nested, &inner_dir, &self.layout.inner_fs))
            .map_err(|io| Error::Mount {
                path: nested.clone(),
                mount_point: inner_dir.clone(),
                io,
            })?;
        enter(state, ExtractState::InnerMounted);

        clear_directory(destination).map_err(|io| Error::Destination {
            path: destination.to_path_buf(),
            io,
        })?;
        enter(state, ExtractState::DestinationCleared);

        info!(file = %nested.display(), "unpacking root image");
        self.sync
            .sync(&inner_dir, destination)
            .map_err(|io| Error::Sync {
                from: nested.clone(),
                to: destination.to_path_buf(),
                io,
            })?;
        enter(state, ExtractState::Synced);

        Ok(())
    }
}

fn enter(state: &mut ExtractState, next: ExtractState) {
    debug!(from = %state, to = %next, "extract state");
    *state = next;
}
