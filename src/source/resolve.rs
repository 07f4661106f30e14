use crate::error::Error;
use crate::fetch::checksum::HashAlgorithm;

use super::{Keyring, SourceDescriptor};

/// How the fetched image is to be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationPlan {
    /// No checks at all.
    Skip,
    /// Check the image against a manifest fetched over HTTPS. The manifest
    /// itself is trusted on the strength of the transport.
    Checksum {
        manifest_url: String,
        algorithm: HashAlgorithm,
    },
    /// Authenticate the manifest with a detached signature, then check the
    /// image against it.
    Signed {
        manifest_url: String,
        signature_url: String,
        algorithm: HashAlgorithm,
        keyring: Keyring,
    },
}

/// Concrete URLs for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub image_url: String,
    pub plan: VerificationPlan,
}

/// Compute download URLs and the verification plan for `descriptor`.
///
/// # Errors
///
/// [`Error::PolicyViolation`] when verification is required, the transport
/// is not HTTPS and no keys are configured.
pub fn resolve(descriptor: &SourceDescriptor) -> Result<ResolvedSource, Error> {
    let base = directory_url(&descriptor.base_url);
    let image_url = format!("{base}{}", descriptor.image);

    if descriptor.skip_verification {
        return Ok(ResolvedSource {
            image_url,
            plan: VerificationPlan::Skip,
        });
    }

    let manifest_url = format!("{base}{}", descriptor.checksum_file);
    let algorithm = HashAlgorithm::for_manifest(&descriptor.checksum_file);

    let plan = if !descriptor.keyring.is_empty() {
        VerificationPlan::Signed {
            signature_url: format!("{manifest_url}{}", descriptor.signature_suffix),
            manifest_url,
            algorithm,
            keyring: descriptor.keyring.clone(),
        }
    } else if descriptor.is_secure_transport() {
        VerificationPlan::Checksum {
            manifest_url,
            algorithm,
        }
    } else {
        return Err(Error::PolicyViolation {
            url: descriptor.base_url.clone(),
        });
    };

    Ok(ResolvedSource { image_url, plan })
}

fn directory_url(base: &str) -> String {
    if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_verification_needs_no_companions() {
        let desc = SourceDescriptor::new("http://example.test/images/", "foo-1.0.iso")
            .skip_verification(true);
        let resolved = resolve(&desc).unwrap();
        assert_eq!(resolved.image_url, "http://example.test/images/foo-1.0.iso");
        assert_eq!(resolved.plan, VerificationPlan::Skip);
    }

    #[test]
    fn insecure_transport_without_keys_is_a_policy_violation() {
        let desc = SourceDescriptor::new("http://example.test/images/", "foo-1.0.iso");
        let err = resolve(&desc).unwrap_err();
        assert!(matches!(err, Error::PolicyViolation { .. }));
        assert!(err
            .to_string()
            .contains("verification keys required for insecure transport"));
    }

    #[test]
    fn https_without_keys_checks_manifest_only() {
        let desc = SourceDescriptor::new("https://example.test/images", "foo-1.0.iso");
        let resolved = resolve(&desc).unwrap();
        assert_eq!(resolved.image_url, "https://example.test/images/foo-1.0.iso");
        assert_eq!(
            resolved.plan,
            VerificationPlan::Checksum {
                manifest_url: "https://example.test/images/SHA256SUMS".to_string(),
                algorithm: HashAlgorithm::Sha256,
            }
        );
    }

    #[test]
    fn keys_produce_signed_plan_with_derived_urls() {
        let mut desc = SourceDescriptor::new("http://example.test/images/", "foo-1.0.iso")
            .with_keys(["0xCAFE"]);
        desc.checksum_file = "SHA512SUMS".to_string();
        desc.signature_suffix = ".asc".to_string();

        match resolve(&desc).unwrap().plan {
            VerificationPlan::Signed {
                manifest_url,
                signature_url,
                algorithm,
                keyring,
            } => {
                assert_eq!(manifest_url, "http://example.test/images/SHA512SUMS");
                assert_eq!(signature_url, "http://example.test/images/SHA512SUMS.asc");
                assert_eq!(algorithm, HashAlgorithm::Sha512);
                assert_eq!(keyring.keys, vec!["0xCAFE".to_string()]);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }
}
