//! Acquire a distribution ISO and unpack its nested root filesystem.
//!
//! The pipeline runs four stages in order, each consuming the previous
//! stage's output:
//!
//! ```text
//! SourceDescriptor
//!     │
//!     ├── resolve  ─ image URL + VerificationPlan (no I/O)
//!     ├── fetch    ─ signature, manifest, image into the download cache
//!     ├── verify   ─ manifest signature, then image digest
//!     └── extract  ─ mount ISO, mount nested squashfs, mirror into rootfs
//! ```
//!
//! Every collaborator sits behind a trait ([`fetch::Downloader`],
//! [`verify::SignatureVerifier`], [`extract::mount::Mounter`],
//! [`extract::tree::TreeSync`]) with a host-backed default implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_source::extract::{mount::SystemMounter, tree::MirrorSync, Extractor};
//! use distro_source::{Fetcher, GpgVerifier, Pipeline, SourceDescriptor};
//!
//! let cache = std::path::Path::new("/var/cache/distro-source");
//! let fetcher = Fetcher::http(cache);
//! let verifier = GpgVerifier::new();
//! let extractor = Extractor::new(&SystemMounter, &MirrorSync, cache);
//!
//! let source = SourceDescriptor::new("https://example.test/images/", "foo-1.0.iso")
//!     .with_keys(["0xABCDEF0123456789"]);
//! let outcome = Pipeline::new(&fetcher, &verifier, extractor)
//!     .run(&source, std::path::Path::new("/srv/rootfs"))?;
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod source;
pub mod verify;

pub use error::{CleanupWarning, Error, PipelineError, Stage};
pub use fetch::Fetcher;
pub use pipeline::{Outcome, Pipeline};
pub use source::{resolve, SourceDescriptor};
pub use verify::GpgVerifier;
