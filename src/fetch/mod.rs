//! Artifact fetching into a content-addressed download cache.
//!
//! Every URL owns one cache entry at `<cache_root>/download/<sha256(url)>/`
//! holding the file under its decoded URL basename. Re-fetching a cached
//! artifact does not touch the network unless the cached bytes fail the
//! requested hash check. Checksum manifests and signatures carry no digest
//! of their own and are transferred again on every use.

pub mod checksum;
pub mod transport;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Error;
use checksum::{hash_file, lookup_digest, HashAlgorithm, HashingWriter};
use transport::{HttpTransport, Transport};

/// Subdirectory of the cache root holding download entries.
pub const DOWNLOAD_SUBDIR: &str = "download";

const LOCK_FILE: &str = ".lock";

/// One file the pipeline needs, with its optional hash check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadArtifact {
    pub url: String,
    /// Checksum manifest listing the artifact's digest.
    pub checksum_url: Option<String>,
    /// Algorithm of the digests in `checksum_url`.
    pub algorithm: Option<HashAlgorithm>,
    /// Transfer again even when a cached copy exists.
    pub refresh: bool,
    /// Read the digest from the cached manifest without re-transferring it.
    pub pinned_manifest: bool,
}

impl DownloadArtifact {
    pub fn plain(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            checksum_url: None,
            algorithm: None,
            refresh: false,
            pinned_manifest: false,
        }
    }

    /// A manifest or signature: never served from the cache.
    pub fn refreshed(url: impl Into<String>) -> Self {
        Self {
            refresh: true,
            ..Self::plain(url)
        }
    }

    pub fn checked(
        url: impl Into<String>,
        checksum_url: impl Into<String>,
        algorithm: HashAlgorithm,
    ) -> Self {
        Self {
            url: url.into(),
            checksum_url: Some(checksum_url.into()),
            algorithm: Some(algorithm),
            refresh: false,
            pinned_manifest: false,
        }
    }

    /// Check against the manifest already in the cache, for manifests that
    /// were just fetched and authenticated.
    pub fn with_pinned_manifest(mut self) -> Self {
        self.pinned_manifest = true;
        self
    }

    /// File name the artifact is stored under.
    pub fn file_name(&self) -> Result<String, FetchError> {
        url_basename(&self.url)
    }
}

/// Errors from the download collaborator.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("download failed for {url}: {reason}")]
    Http { url: String, reason: String },

    #[error("cache I/O error for {url} at '{}': {io}", path.display())]
    Io {
        url: String,
        path: PathBuf,
        #[source]
        io: io::Error,
    },

    #[error("'{name}' is not listed in checksum manifest {manifest_url}")]
    ChecksumMissing { manifest_url: String, name: String },

    #[error("{algorithm} mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("cannot derive a file name from {url}")]
    InvalidUrl { url: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::NotFound { url }
            | FetchError::Http { url, .. }
            | FetchError::Io { url, .. }
            | FetchError::HashMismatch { url, .. }
            | FetchError::InvalidUrl { url } => url,
            FetchError::ChecksumMissing { manifest_url, .. } => manifest_url,
        }
    }
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HashMismatch {
                url,
                algorithm,
                expected,
                actual,
            } => Error::HashMismatch {
                url,
                algorithm,
                expected,
                actual,
            },
            other => Error::Download {
                url: other.url().to_owned(),
                reason: other.to_string(),
            },
        }
    }
}

/// The download collaborator consumed by the pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait Downloader {
    /// Make `artifact` available locally and return the directory holding it.
    ///
    /// # Errors
    ///
    /// [`FetchError::HashMismatch`] when a checksum was requested and the
    /// bytes disagree; any other variant for transfer or cache failures.
    fn download(&self, artifact: &DownloadArtifact) -> Result<PathBuf, FetchError>;
}

/// Cache-backed fetcher over a [`Transport`].
#[derive(Debug, Clone)]
pub struct Fetcher<T = HttpTransport> {
    cache_root: PathBuf,
    transport: T,
}

impl Fetcher<HttpTransport> {
    pub fn http(cache_root: &Path) -> Self {
        Self::new(cache_root, HttpTransport)
    }
}

impl<T: Transport> Fetcher<T> {
    pub fn new(cache_root: &Path, transport: T) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            transport,
        }
    }

    /// Cache directory owned by `url`.
    pub fn entry_dir(&self, url: &str) -> PathBuf {
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        self.cache_root.join(DOWNLOAD_SUBDIR).join(key)
    }

    fn fetch(&self, artifact: &DownloadArtifact) -> Result<PathBuf, FetchError> {
        let url = artifact.url.as_str();
        let name = artifact.file_name()?;

        // Resolve the expected digest before locking this entry; the
        // manifest lives in its own entry.
        let expected = match &artifact.checksum_url {
            Some(checksum_url) => {
                let algorithm = artifact.algorithm.unwrap_or_else(|| {
                    HashAlgorithm::for_manifest(&url_basename(checksum_url).unwrap_or_default())
                });
                let digest =
                    self.expected_digest(checksum_url, &name, algorithm, artifact.pinned_manifest)?;
                Some((algorithm, digest))
            }
            None => None,
        };

        let dir = self.entry_dir(url);
        fs::create_dir_all(&dir).map_err(|io| io_error(url, &dir, io))?;
        let _lock = EntryLock::acquire(url, &dir)?;

        let target = dir.join(&name);
        if target.is_file() && !artifact.refresh {
            match &expected {
                None => {
                    debug!(url, path = %target.display(), "reusing cached artifact");
                    return Ok(dir);
                }
                Some((algorithm, digest)) => {
                    let cached =
                        hash_file(&target, *algorithm).map_err(|io| io_error(url, &target, io))?;
                    if &cached == digest {
                        debug!(url, path = %target.display(), "cached artifact matches checksum");
                        return Ok(dir);
                    }
                    warn!(url, path = %target.display(), "cached artifact fails checksum, re-downloading");
                }
            }
        }

        info!(url, path = %target.display(), "downloading");
        let algorithm = expected
            .as_ref()
            .map_or(HashAlgorithm::Sha256, |(algorithm, _)| *algorithm);
        let staging = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&dir)
            .map_err(|io| io_error(url, &dir, io))?;
        let (file, path) = staging.into_parts();
        let mut writer = HashingWriter::new(BufWriter::new(file), algorithm);
        self.transport.get(url, &mut writer)?;
        let size = writer.bytes_written();
        let (_, actual) = writer.finish().map_err(|io| io_error(url, &path, io))?;

        if let Some((algorithm, digest)) = expected {
            if actual != digest {
                return Err(FetchError::HashMismatch {
                    url: url.to_owned(),
                    algorithm,
                    expected: digest,
                    actual,
                });
            }
        }

        path.persist(&target)
            .map_err(|e| io_error(url, &target, e.error))?;
        info!(url, size, digest = %actual, "download complete");
        Ok(dir)
    }

    fn expected_digest(
        &self,
        checksum_url: &str,
        name: &str,
        algorithm: HashAlgorithm,
        pinned: bool,
    ) -> Result<String, FetchError> {
        let manifest = if pinned {
            DownloadArtifact::plain(checksum_url)
        } else {
            DownloadArtifact::refreshed(checksum_url)
        };
        let manifest_path = self.fetch(&manifest)?.join(manifest.file_name()?);
        let contents = fs::read_to_string(&manifest_path)
            .map_err(|io| io_error(checksum_url, &manifest_path, io))?;
        lookup_digest(&contents, name, algorithm).ok_or_else(|| FetchError::ChecksumMissing {
            manifest_url: checksum_url.to_owned(),
            name: name.to_owned(),
        })
    }
}

impl<T: Transport> Downloader for Fetcher<T> {
    fn download(&self, artifact: &DownloadArtifact) -> Result<PathBuf, FetchError> {
        self.fetch(artifact)
    }
}

/// Last path segment of a URL, ignoring query and fragment, with
/// percent-escapes decoded.
pub fn url_basename(url: &str) -> Result<String, FetchError> {
    let invalid = || FetchError::InvalidUrl {
        url: url.to_owned(),
    };
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let (_, tail) = path.split_once('/').ok_or_else(invalid)?;
    let raw = tail.rsplit('/').next().ok_or_else(invalid)?;
    let name = percent_decode(raw).ok_or_else(invalid)?;
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(invalid());
    }
    Ok(name)
}

fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let pair = bytes.get(i + 1..i + 3)?;
            out.extend(hex::decode(pair).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn io_error(url: &str, path: &Path, io: io::Error) -> FetchError {
    FetchError::Io {
        url: url.to_owned(),
        path: path.to_path_buf(),
        io,
    }
}

/// Exclusive advisory lock on one cache entry, released on drop.
///
/// The lock file is never unlinked: removing a file another process still
/// holds a lock on would let a third process lock a fresh inode.
#[derive(Debug)]
struct EntryLock {
    file: File,
}

impl EntryLock {
    fn acquire(url: &str, dir: &Path) -> Result<Self, FetchError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|io| io_error(url, &path, io))?;
        file.lock_exclusive()
            .map_err(|io| io_error(url, &path, io))?;
        Ok(Self { file })
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryTransport {
        bodies: HashMap<String, Vec<u8>>,
        requests: RefCell<Vec<String>>,
    }

    impl MemoryTransport {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.bodies.insert(url.to_string(), body.to_vec());
            self
        }

        fn request_count(&self, url: &str) -> usize {
            self.requests.borrow().iter().filter(|u| *u == url).count()
        }
    }

    impl Transport for MemoryTransport {
        fn get(&self, url: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
            self.requests.borrow_mut().push(url.to_string());
            let body = self.bodies.get(url).ok_or_else(|| FetchError::NotFound {
                url: url.to_string(),
            })?;
            sink.write_all(body).map_err(|e| FetchError::Http {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok(body.len() as u64)
        }
    }

    const IMAGE_URL: &str = "https://example.test/images/foo-1.0.iso";
    const SUMS_URL: &str = "https://example.test/images/SHA256SUMS";
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn sums(digest: &str) -> Vec<u8> {
        format!("{digest}  foo-1.0.iso\n").into_bytes()
    }

    #[test]
    fn url_basename_takes_last_segment() {
        assert_eq!(url_basename(IMAGE_URL).unwrap(), "foo-1.0.iso");
        assert_eq!(
            url_basename("https://example.test/a/b.iso?token=1#frag").unwrap(),
            "b.iso"
        );
        assert!(url_basename("https://example.test/images/").is_err());
        assert!(url_basename("https://example.test").is_err());
    }

    #[test]
    fn url_basename_decodes_escapes() {
        assert_eq!(
            url_basename("https://example.test/vyos-1.5%2B20241017.iso").unwrap(),
            "vyos-1.5+20241017.iso"
        );
        assert_eq!(
            url_basename("https://example.test/a%20b.iso").unwrap(),
            "a b.iso"
        );
        assert!(url_basename("https://example.test/..%2Fetc%2Fpasswd").is_err());
        assert!(url_basename("https://example.test/%2e%2e").is_err());
        assert!(url_basename("https://example.test/bad%zz.iso").is_err());
        assert!(url_basename("https://example.test/trunc%2").is_err());
    }

    #[test]
    fn escaped_name_matches_manifest_entry() {
        let cache = TempDir::new().unwrap();
        let image = "https://example.test/images/foo%2B1.iso";
        let transport = MemoryTransport::default()
            .with(image, b"hello world")
            .with(SUMS_URL, format!("{HELLO_SHA256}  foo+1.iso\n").as_bytes());
        let fetcher = Fetcher::new(cache.path(), transport);

        let dir = fetcher
            .download(&DownloadArtifact::checked(image, SUMS_URL, HashAlgorithm::Sha256))
            .unwrap();
        assert!(dir.join("foo+1.iso").is_file());
    }

    #[test]
    fn manifest_is_transferred_again_on_each_use() {
        let cache = TempDir::new().unwrap();
        let artifact = DownloadArtifact::checked(IMAGE_URL, SUMS_URL, HashAlgorithm::Sha256);

        let publishing = Fetcher::new(
            cache.path(),
            MemoryTransport::default()
                .with(IMAGE_URL, b"hello world")
                .with(SUMS_URL, b"deadbeef  other.iso\n"),
        );
        assert!(matches!(
            publishing.download(&artifact).unwrap_err(),
            FetchError::ChecksumMissing { .. }
        ));

        let published = Fetcher::new(
            cache.path(),
            MemoryTransport::default()
                .with(IMAGE_URL, b"hello world")
                .with(SUMS_URL, &sums(HELLO_SHA256)),
        );
        let dir = published.download(&artifact).unwrap();
        assert!(dir.join("foo-1.0.iso").is_file());
        assert_eq!(published.transport.request_count(SUMS_URL), 1);
    }

    #[test]
    fn pinned_manifest_is_read_from_cache() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::default()
            .with(IMAGE_URL, b"hello world")
            .with(SUMS_URL, &sums(HELLO_SHA256));
        let fetcher = Fetcher::new(cache.path(), transport);

        fetcher
            .download(&DownloadArtifact::refreshed(SUMS_URL))
            .unwrap();
        let artifact = DownloadArtifact::checked(IMAGE_URL, SUMS_URL, HashAlgorithm::Sha256)
            .with_pinned_manifest();
        fetcher.download(&artifact).unwrap();

        assert_eq!(fetcher.transport.request_count(SUMS_URL), 1);
        assert_eq!(fetcher.transport.request_count(IMAGE_URL), 1);
    }

    #[test]
    fn refreshed_artifact_replaces_cached_copy() {
        let cache = TempDir::new().unwrap();
        let entry;
        {
            let fetcher = Fetcher::new(
                cache.path(),
                MemoryTransport::default().with(SUMS_URL, b"old\n"),
            );
            entry = fetcher.download(&DownloadArtifact::refreshed(SUMS_URL)).unwrap();
        }
        let fetcher = Fetcher::new(
            cache.path(),
            MemoryTransport::default().with(SUMS_URL, b"new\n"),
        );
        fetcher.download(&DownloadArtifact::refreshed(SUMS_URL)).unwrap();
        assert_eq!(fs::read(entry.join("SHA256SUMS")).unwrap(), b"new\n");
    }

    #[test]
    fn entry_dir_is_stable_and_distinct_per_url() {
        let cache = TempDir::new().unwrap();
        let fetcher = Fetcher::new(cache.path(), MemoryTransport::default());
        assert_eq!(fetcher.entry_dir(IMAGE_URL), fetcher.entry_dir(IMAGE_URL));
        assert_ne!(fetcher.entry_dir(IMAGE_URL), fetcher.entry_dir(SUMS_URL));
        assert!(fetcher
            .entry_dir(IMAGE_URL)
            .starts_with(cache.path().join(DOWNLOAD_SUBDIR)));
    }

    #[test]
    fn plain_fetch_stores_file_and_reuses_cache() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::default().with(IMAGE_URL, b"hello world");
        let fetcher = Fetcher::new(cache.path(), transport);

        let dir = fetcher.download(&DownloadArtifact::plain(IMAGE_URL)).unwrap();
        assert_eq!(fs::read(dir.join("foo-1.0.iso")).unwrap(), b"hello world");

        let again = fetcher.download(&DownloadArtifact::plain(IMAGE_URL)).unwrap();
        assert_eq!(dir, again);
        assert_eq!(fetcher.transport.request_count(IMAGE_URL), 1);
    }

    #[test]
    fn checked_fetch_verifies_against_manifest() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::default()
            .with(IMAGE_URL, b"hello world")
            .with(SUMS_URL, &sums(HELLO_SHA256));
        let fetcher = Fetcher::new(cache.path(), transport);
        let artifact = DownloadArtifact::checked(IMAGE_URL, SUMS_URL, HashAlgorithm::Sha256);

        let dir = fetcher.download(&artifact).unwrap();
        assert!(dir.join("foo-1.0.iso").is_file());

        fetcher.download(&artifact).unwrap();
        assert_eq!(fetcher.transport.request_count(IMAGE_URL), 1);
        assert_eq!(fetcher.transport.request_count(SUMS_URL), 2);
    }

    #[test]
    fn hash_mismatch_is_rejected_and_nothing_is_kept() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::default()
            .with(IMAGE_URL, b"tampered bytes")
            .with(SUMS_URL, &sums(HELLO_SHA256));
        let fetcher = Fetcher::new(cache.path(), transport);
        let artifact = DownloadArtifact::checked(IMAGE_URL, SUMS_URL, HashAlgorithm::Sha256);

        let err = fetcher.download(&artifact).unwrap_err();
        assert!(matches!(err, FetchError::HashMismatch { .. }));

        let entry = fetcher.entry_dir(IMAGE_URL);
        let leftovers: Vec<_> = fs::read_dir(&entry)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != LOCK_FILE)
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }

    #[test]
    fn stale_cache_entry_is_redownloaded() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::default()
            .with(IMAGE_URL, b"hello world")
            .with(SUMS_URL, &sums(HELLO_SHA256));
        let fetcher = Fetcher::new(cache.path(), transport);

        let entry = fetcher.entry_dir(IMAGE_URL);
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("foo-1.0.iso"), b"corrupt").unwrap();

        let artifact = DownloadArtifact::checked(IMAGE_URL, SUMS_URL, HashAlgorithm::Sha256);
        fetcher.download(&artifact).unwrap();
        assert_eq!(fs::read(entry.join("foo-1.0.iso")).unwrap(), b"hello world");
        assert_eq!(fetcher.transport.request_count(IMAGE_URL), 1);
    }

    #[test]
    fn missing_manifest_entry_is_reported() {
        let cache = TempDir::new().unwrap();
        let transport = MemoryTransport::default()
            .with(IMAGE_URL, b"hello world")
            .with(SUMS_URL, b"deadbeef  other.iso\n");
        let fetcher = Fetcher::new(cache.path(), transport);

        let err = fetcher
            .download(&DownloadArtifact::checked(
                IMAGE_URL,
                SUMS_URL,
                HashAlgorithm::Sha256,
            ))
            .unwrap_err();
        assert!(matches!(err, FetchError::ChecksumMissing { .. }));
        assert_eq!(fetcher.transport.request_count(IMAGE_URL), 0);
    }

    #[test]
    fn fetch_errors_map_to_pipeline_kinds() {
        let mismatch: Error = FetchError::HashMismatch {
            url: IMAGE_URL.to_string(),
            algorithm: HashAlgorithm::Sha256,
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(matches!(mismatch, Error::HashMismatch { .. }));

        let missing: Error = FetchError::NotFound {
            url: IMAGE_URL.to_string(),
        }
        .into();
        match missing {
            Error::Download { url, .. } => assert_eq!(url, IMAGE_URL),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
