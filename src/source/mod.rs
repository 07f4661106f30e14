//! Source descriptors and the verification policy they carry.
//!
//! - [`resolve`] turns a [`SourceDescriptor`] into concrete URLs and a
//!   [`resolve::VerificationPlan`] without any I/O.
//! - [`release`] looks up the newest release asset of a hosted project and
//!   produces an ordinary descriptor from it.

pub mod release;
pub mod resolve;

pub use resolve::{resolve, ResolvedSource, VerificationPlan};

/// Checksum manifest published next to images by default.
pub const DEFAULT_CHECKSUM_FILE: &str = "SHA256SUMS";

/// Suffix appended to the manifest URL to locate its detached signature.
pub const DEFAULT_SIGNATURE_SUFFIX: &str = ".gpg";

/// Keyserver used to receive trusted keys by identifier.
pub const DEFAULT_KEYSERVER: &str = "hkps://keyserver.ubuntu.com";

/// Trusted keys for detached signature checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    /// Key identifiers or fingerprints.
    pub keys: Vec<String>,
    pub keyserver: String,
}

impl Keyring {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            keyserver: DEFAULT_KEYSERVER.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Where to get an image and how much to trust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Directory URL the image and its companions live under.
    pub base_url: String,
    /// Image file name under `base_url`.
    pub image: String,
    pub skip_verification: bool,
    pub keyring: Keyring,
    /// Checksum manifest file name under `base_url`.
    pub checksum_file: String,
    /// Appended to the manifest URL to form the signature URL.
    pub signature_suffix: String,
}

impl SourceDescriptor {
    pub fn new(base_url: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            image: image.into(),
            skip_verification: false,
            keyring: Keyring::new(Vec::new()),
            checksum_file: DEFAULT_CHECKSUM_FILE.to_string(),
            signature_suffix: DEFAULT_SIGNATURE_SUFFIX.to_string(),
        }
    }

    pub fn skip_verification(mut self, skip: bool) -> Self {
        self.skip_verification = skip;
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keyring.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the base URL uses an encrypted, authenticated transport.
    pub fn is_secure_transport(&self) -> bool {
        self.base_url
            .split_once("://")
            .is_some_and(|(scheme, _)| scheme.eq_ignore_ascii_case("https"))
    }
}
