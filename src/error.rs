//! Error types for the acquisition and extraction pipeline.
//!
//! Every pipeline stage reports failures as an [`Error`] variant carrying
//! the URL or path involved. The pipeline wraps it in a [`PipelineError`]
//! naming the failing [`Stage`], together with any [`CleanupWarning`]s
//! raised while unwinding resources.

use std::fmt;
use std::path::PathBuf;

use crate::fetch::checksum::HashAlgorithm;

/// A terminal pipeline failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Verification is required but cannot be satisfied.
    #[error("verification keys required for insecure transport ({url})")]
    PolicyViolation { url: String },

    /// Network, HTTP status or cache write failure while fetching.
    #[error("download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    /// Transferred bytes do not match the expected digest.
    #[error("{algorithm} mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },

    /// Malformed signature data or an unusable keyring.
    #[error("signature check of '{}' could not run: {reason}", path.display())]
    Signature { path: PathBuf, reason: String },

    /// The signature is well-formed but no trusted key authenticates it.
    #[error(
        "signature '{}' does not authenticate '{}' under any trusted key",
        signature.display(),
        manifest.display()
    )]
    InvalidSignature {
        manifest: PathBuf,
        signature: PathBuf,
    },

    /// A mount call failed.
    #[error("failed mounting '{}' at '{}': {io}", path.display(), mount_point.display())]
    Mount {
        path: PathBuf,
        mount_point: PathBuf,
        #[source]
        io: std::io::Error,
    },

    /// The outer image mounted but the nested image is not where expected.
    #[error("image '{}' has no nested filesystem at '{}'", image.display(), expected.display())]
    MalformedImage { image: PathBuf, expected: PathBuf },

    /// The destination root could not be emptied.
    #[error("failed clearing destination '{}': {io}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        io: std::io::Error,
    },

    /// Copying the nested tree into the destination failed.
    #[error("failed syncing '{}' into '{}': {io}", from.display(), to.display())]
    Sync {
        from: PathBuf,
        to: PathBuf,
        #[source]
        io: std::io::Error,
    },
}

/// A release step that failed while unwinding. Never fatal.
#[derive(Debug, thiserror::Error)]
#[error("cleanup: {action} '{}' failed: {io}", path.display())]
pub struct CleanupWarning {
    pub action: CleanupAction,
    pub path: PathBuf,
    #[source]
    pub io: std::io::Error,
}

/// Which kind of release produced a [`CleanupWarning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    Unmount,
    RemoveDir,
}

impl fmt::Display for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupAction::Unmount => f.write_str("unmount"),
            CleanupAction::RemoveDir => f.write_str("remove directory"),
        }
    }
}

/// Pipeline stage, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Fetch,
    Verify,
    Extract,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Verify => "verify",
            Stage::Extract => "extract",
        };
        f.write_str(name)
    }
}

/// The single terminal error returned by [`crate::Pipeline::run`].
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {error}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub error: Error,
    /// Release failures observed while unwinding after `error`.
    pub warnings: Vec<CleanupWarning>,
}

impl PipelineError {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self {
            stage,
            error,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<CleanupWarning>) -> Self {
        self.warnings = warnings;
        self
    }
}
