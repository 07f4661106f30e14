//! The four-stage acquisition pipeline: resolve, fetch, verify, extract.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{CleanupWarning, Error, PipelineError, Stage};
use crate::extract::Extractor;
use crate::fetch::{DownloadArtifact, Downloader, FetchError};
use crate::source::{resolve, Keyring, ResolvedSource, SourceDescriptor, VerificationPlan};
use crate::verify::{SignatureError, SignatureVerifier};

/// Result of a successful run.
#[derive(Debug)]
pub struct Outcome {
    pub resolved: ResolvedSource,
    /// Local path of the fetched image.
    pub image: PathBuf,
    pub rootfs: PathBuf,
    pub warnings: Vec<CleanupWarning>,
}

pub struct Pipeline<'a> {
    downloader: &'a dyn Downloader,
    verifier: &'a dyn SignatureVerifier,
    extractor: Extractor<'a>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        downloader: &'a dyn Downloader,
        verifier: &'a dyn SignatureVerifier,
        extractor: Extractor<'a>,
    ) -> Self {
        Self {
            downloader,
            verifier,
            extractor,
        }
    }

    /// Acquire the image described by `descriptor` and replace the contents
    /// of `rootfs` with its nested filesystem.
    ///
    /// Stops at the first failure. Nothing is fetched when the descriptor
    /// violates the verification policy, and nothing is extracted unless
    /// every requested check passed.
    pub fn run(&self, descriptor: &SourceDescriptor, rootfs: &Path) -> Result<Outcome, PipelineError> {
        let resolved = resolve(descriptor).map_err(|e| PipelineError::new(Stage::Resolve, e))?;
        info!(url = %resolved.image_url, plan = plan_name(&resolved.plan), "resolved image source");

        let image = self.acquire(&resolved)?;

        info!(image = %image.display(), rootfs = %rootfs.display(), "extracting root filesystem");
        let report = self.extractor.extract(&image, rootfs).map_err(|failure| {
            PipelineError::new(Stage::Extract, failure.error).with_warnings(failure.warnings)
        })?;

        Ok(Outcome {
            resolved,
            image,
            rootfs: rootfs.to_path_buf(),
            warnings: report.warnings,
        })
    }

    fn acquire(&self, resolved: &ResolvedSource) -> Result<PathBuf, PipelineError> {
        let image_url = resolved.image_url.as_str();
        match &resolved.plan {
            VerificationPlan::Skip => {
                warn!(url = image_url, "image verification disabled");
                self.fetch(&DownloadArtifact::plain(image_url))
            }
            VerificationPlan::Checksum {
                manifest_url,
                algorithm,
            } => {
                info!(manifest = %manifest_url, "no signing keys, trusting manifest over https");
                self.fetch(&DownloadArtifact::checked(image_url, manifest_url, *algorithm))
            }
            VerificationPlan::Signed {
                manifest_url,
                signature_url,
                algorithm,
                keyring,
            } => {
                let signature = self.fetch(&DownloadArtifact::refreshed(signature_url))?;
                let manifest = self.fetch(&DownloadArtifact::refreshed(manifest_url))?;
                self.authenticate(&manifest, &signature, keyring)?;
                // Check the image against the manifest just authenticated.
                self.fetch(
                    &DownloadArtifact::checked(image_url, manifest_url, *algorithm)
                        .with_pinned_manifest(),
                )
            }
        }
    }

    /// Download one artifact and return the path of the file itself.
    fn fetch(&self, artifact: &DownloadArtifact) -> Result<PathBuf, PipelineError> {
        let name = artifact.file_name().map_err(fetch_failure)?;
        let dir = self.downloader.download(artifact).map_err(fetch_failure)?;
        Ok(dir.join(name))
    }

    fn authenticate(
        &self,
        manifest: &Path,
        signature: &Path,
        keyring: &Keyring,
    ) -> Result<(), PipelineError> {
        let valid = self
            .verifier
            .verify(manifest, signature, keyring)
            .map_err(|e| {
                let reason = e.to_string();
                let path = match e {
                    SignatureError::Malformed { path, .. } => path,
                    SignatureError::Keyring { .. } => signature.to_path_buf(),
                };
                PipelineError::new(Stage::Verify, Error::Signature { path, reason })
            })?;
        if !valid {
            return Err(PipelineError::new(
                Stage::Verify,
                Error::InvalidSignature {
                    manifest: manifest.to_path_buf(),
                    signature: signature.to_path_buf(),
                },
            ));
        }
        info!(manifest = %manifest.display(), "checksum manifest authenticated");
        Ok(())
    }
}

/// Digest failures belong to verification; everything else to fetching.
fn fetch_failure(err: FetchError) -> PipelineError {
    let stage = match err {
        FetchError::HashMismatch { .. } | FetchError::ChecksumMissing { .. } => Stage::Verify,
        _ => Stage::Fetch,
    };
    PipelineError::new(stage, err.into())
}

fn plan_name(plan: &VerificationPlan) -> &'static str {
    match plan {
        VerificationPlan::Skip => "skip",
        VerificationPlan::Checksum { .. } => "checksum",
        VerificationPlan::Signed { .. } => "signed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::mount::{MountHandle, Mounter};
    use crate::extract::tree::MirrorSync;
    use crate::fetch::checksum::HashAlgorithm;
    use crate::fetch::MockDownloader;
    use crate::verify::MockSignatureVerifier;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::cell::RefCell;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    /// Mounts by writing the expected layout into the mount point.
    #[derive(Default)]
    struct LayoutMounter {
        sources: RefCell<Vec<PathBuf>>,
    }

    impl Mounter for LayoutMounter {
        fn mount(&self, handle: &MountHandle) -> io::Result<()> {
            let root = &handle.mount_point;
            if handle.fs_type == "iso9660" {
                fs::create_dir_all(root.join("live"))?;
                fs::write(root.join("live/filesystem.squashfs"), "")?;
            } else {
                fs::create_dir_all(root.join("etc"))?;
                fs::write(root.join("etc/hostname"), "foo\n")?;
            }
            self.sources.borrow_mut().push(handle.source.clone());
            Ok(())
        }

        fn unmount(&self, mount_point: &Path) -> io::Result<()> {
            crate::extract::tree::clear_directory(mount_point)
        }
    }

    struct Env {
        temp: TempDir,
        mounter: LayoutMounter,
    }

    impl Env {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
                mounter: LayoutMounter::default(),
            }
        }

        fn rootfs(&self) -> PathBuf {
            self.temp.path().join("rootfs")
        }

        fn downloads(&self) -> PathBuf {
            self.temp.path().join("dl")
        }

        fn extractor(&self) -> Extractor<'_> {
            Extractor::new(&self.mounter, &MirrorSync, &self.temp.path().join("work"))
        }
    }

    fn returns_dir(dir: PathBuf) -> impl FnMut(&DownloadArtifact) -> Result<PathBuf, FetchError> {
        move |_| Ok(dir.clone())
    }

    #[test]
    fn skip_verification_fetches_image_once_and_extracts_it() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader
            .expect_download()
            .with(eq(DownloadArtifact::plain(
                "http://example.test/images/foo-1.0.iso",
            )))
            .times(1)
            .returning(returns_dir(env.downloads()));
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().never();

        let descriptor =
            SourceDescriptor::new("http://example.test/images/", "foo-1.0.iso").skip_verification(true);
        let outcome = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap();

        assert_eq!(outcome.image, env.downloads().join("foo-1.0.iso"));
        assert_eq!(env.mounter.sources.borrow()[0], outcome.image);
        assert!(env.rootfs().join("etc/hostname").is_file());
    }

    #[test]
    fn insecure_source_without_keys_never_touches_the_network() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader.expect_download().never();
        let verifier = MockSignatureVerifier::new();

        let descriptor = SourceDescriptor::new("http://example.test/images/", "foo-1.0.iso");
        let err = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Resolve);
        assert!(matches!(err.error, Error::PolicyViolation { .. }));
        assert!(!env.rootfs().exists());
    }

    #[test]
    fn signed_source_fetches_signature_then_manifest_then_image() {
        let env = Env::new();
        let mut seq = Sequence::new();
        let mut downloader = MockDownloader::new();
        let mut verifier = MockSignatureVerifier::new();
        downloader
            .expect_download()
            .with(eq(DownloadArtifact::refreshed(
                "http://example.test/SHA256SUMS.gpg",
            )))
            .times(1)
            .in_sequence(&mut seq)
            .returning(returns_dir(env.downloads().join("sig")));
        downloader
            .expect_download()
            .with(eq(DownloadArtifact::refreshed("http://example.test/SHA256SUMS")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(returns_dir(env.downloads().join("sums")));
        let sig_path = env.downloads().join("sig/SHA256SUMS.gpg");
        let sums_path = env.downloads().join("sums/SHA256SUMS");
        verifier
            .expect_verify()
            .withf(move |manifest, signature, keyring| {
                manifest == sums_path && signature == sig_path && keyring.keys == ["0xABCD"]
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(true));
        downloader
            .expect_download()
            .with(eq(DownloadArtifact::checked(
                "http://example.test/foo-1.0.iso",
                "http://example.test/SHA256SUMS",
                HashAlgorithm::Sha256,
            )
            .with_pinned_manifest()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(returns_dir(env.downloads().join("img")));

        let descriptor =
            SourceDescriptor::new("http://example.test", "foo-1.0.iso").with_keys(["0xABCD"]);
        let outcome = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap();

        assert_eq!(outcome.image, env.downloads().join("img/foo-1.0.iso"));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn untrusted_signature_stops_before_image_fetch() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader
            .expect_download()
            .times(2)
            .returning(returns_dir(env.downloads()));
        let mut verifier = MockSignatureVerifier::new();
        verifier
            .expect_verify()
            .times(1)
            .returning(|_, _, _| Ok(false));

        let descriptor =
            SourceDescriptor::new("https://example.test/", "foo-1.0.iso").with_keys(["0xABCD"]);
        let err = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Verify);
        assert!(matches!(err.error, Error::InvalidSignature { .. }));
        assert!(env.mounter.sources.borrow().is_empty());
    }

    #[test]
    fn malformed_signature_is_a_signature_error() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader
            .expect_download()
            .times(2)
            .returning(returns_dir(env.downloads()));
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().times(1).returning(|_, signature, _| {
            Err(SignatureError::Malformed {
                path: signature.to_path_buf(),
                reason: "no signature data found".to_string(),
            })
        });

        let descriptor =
            SourceDescriptor::new("https://example.test/", "foo-1.0.iso").with_keys(["0xABCD"]);
        let err = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap_err();

        match err.error {
            Error::Signature { path, .. } => {
                assert_eq!(path, env.downloads().join("SHA256SUMS.gpg"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn signature_fetch_failure_aborts_remaining_fetches() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader.expect_download().times(1).returning(|a| {
            Err(FetchError::NotFound {
                url: a.url.clone(),
            })
        });
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().never();

        let descriptor =
            SourceDescriptor::new("https://example.test/", "foo-1.0.iso").with_keys(["0xABCD"]);
        let err = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Fetch);
        assert!(
            matches!(&err.error, Error::Download { url, .. } if url == "https://example.test/SHA256SUMS.gpg")
        );
    }

    #[test]
    fn https_without_keys_uses_manifest_check_only() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader
            .expect_download()
            .with(eq(DownloadArtifact::checked(
                "https://example.test/foo-1.0.iso",
                "https://example.test/SHA256SUMS",
                HashAlgorithm::Sha256,
            )))
            .times(1)
            .returning(returns_dir(env.downloads()));
        let mut verifier = MockSignatureVerifier::new();
        verifier.expect_verify().never();

        let descriptor = SourceDescriptor::new("https://example.test/", "foo-1.0.iso");
        Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap();
    }

    #[test]
    fn hash_mismatch_never_reaches_extraction() {
        let env = Env::new();
        let mut downloader = MockDownloader::new();
        downloader.expect_download().times(1).returning(|a| {
            Err(FetchError::HashMismatch {
                url: a.url.clone(),
                algorithm: HashAlgorithm::Sha256,
                expected: "aa".repeat(32),
                actual: "bb".repeat(32),
            })
        });
        let verifier = MockSignatureVerifier::new();

        let descriptor = SourceDescriptor::new("https://example.test/", "foo-1.0.iso");
        let err = Pipeline::new(&downloader, &verifier, env.extractor())
            .run(&descriptor, &env.rootfs())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Verify);
        assert!(matches!(err.error, Error::HashMismatch { .. }));
        assert!(env.mounter.sources.borrow().is_empty());
        assert!(!env.rootfs().exists());
    }
}
