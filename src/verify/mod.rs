//! Detached signature verification of checksum manifests.
//!
//! [`GpgVerifier`] runs `gpg` in a throwaway home directory so the host
//! keyring is neither consulted nor modified: only the configured keys,
//! received from the configured keyserver, can authenticate a manifest.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::process::Cmd;
use crate::source::Keyring;

/// Signature data or keyring could not be used at all.
///
/// Distinct from a well-formed signature that fails to authenticate,
/// which is reported as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature input '{}': {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("keyring unusable: {reason}")]
    Keyring { reason: String },
}

/// The signature-verification collaborator consumed by the pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait SignatureVerifier {
    /// Whether `signature` authenticates `manifest` under a key in `keyring`.
    ///
    /// # Errors
    ///
    /// [`SignatureError`] on malformed input or keyring failure.
    fn verify(
        &self,
        manifest: &Path,
        signature: &Path,
        keyring: &Keyring,
    ) -> Result<bool, SignatureError>;
}

/// Outcome of one `gpg --verify` run, read from its status output.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Valid,
    Untrusted(String),
    Malformed(String),
}

/// `gpg`-backed verifier.
#[derive(Debug, Clone, Default)]
pub struct GpgVerifier {
    program: Option<String>,
}

impl GpgVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific gpg binary instead of `gpg` from `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> &str {
        self.program.as_deref().unwrap_or("gpg")
    }

    fn receive_keys(&self, home: &Path, keyring: &Keyring) -> Result<(), SignatureError> {
        info!(keyserver = %keyring.keyserver, keys = ?keyring.keys, "receiving signing keys");
        Cmd::new(self.program())
            .arg("--homedir")
            .arg_path(home)
            .args(["--batch", "--no-tty", "--keyserver", keyring.keyserver.as_str()])
            .arg("--recv-keys")
            .args(&keyring.keys)
            .error_msg("gpg could not receive the configured keys")
            .run()
            .map_err(|e| SignatureError::Keyring {
                reason: format!("{e:#}"),
            })?;
        Ok(())
    }
}

impl SignatureVerifier for GpgVerifier {
    fn verify(
        &self,
        manifest: &Path,
        signature: &Path,
        keyring: &Keyring,
    ) -> Result<bool, SignatureError> {
        check_input(signature)?;
        check_input(manifest)?;
        if keyring.is_empty() {
            return Err(SignatureError::Keyring {
                reason: "no trusted keys configured".to_string(),
            });
        }

        let home = tempfile::Builder::new()
            .prefix("distro-source-gpg-")
            .tempdir()
            .map_err(|e| SignatureError::Keyring {
                reason: format!("creating gpg home: {e}"),
            })?;
        self.receive_keys(home.path(), keyring)?;

        let result = Cmd::new(self.program())
            .env("LC_ALL", "C")
            .arg("--homedir")
            .arg_path(home.path())
            .args(["--batch", "--no-tty", "--status-fd", "1", "--verify"])
            .arg_path(signature)
            .arg_path(manifest)
            .allow_fail()
            .run()
            .map_err(|e| SignatureError::Keyring {
                reason: format!("{e:#}"),
            })?;
        debug!(status = %result.stdout.trim(), "gpg verify finished");

        match classify(&result.stdout, &result.stderr, result.code) {
            Verdict::Valid => {
                info!(manifest = %manifest.display(), "manifest signature valid");
                Ok(true)
            }
            Verdict::Untrusted(reason) => {
                info!(manifest = %manifest.display(), %reason, "manifest signature not trusted");
                Ok(false)
            }
            Verdict::Malformed(reason) => Err(SignatureError::Malformed {
                path: signature.to_path_buf(),
                reason,
            }),
        }
    }
}

fn check_input(path: &Path) -> Result<(), SignatureError> {
    let meta = fs::metadata(path).map_err(|e| SignatureError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(SignatureError::Malformed {
            path: path.to_path_buf(),
            reason: "not a non-empty regular file".to_string(),
        });
    }
    Ok(())
}

/// Interpret `--status-fd` output and the exit code of `gpg --verify`.
///
/// A detached signature file may hold several signatures, each starting
/// with `NEWSIG`. One good signature from a key in the throwaway keyring
/// authenticates the manifest; gpg still exits non-zero when another
/// signature is from an unknown key.
fn classify(status: &str, stderr: &str, code: Option<i32>) -> Verdict {
    let blocks = signature_blocks(status);
    let any = |token: &str| blocks.iter().any(|block| block.contains(&token));

    if blocks
        .iter()
        .any(|block| block.contains(&"GOODSIG") && block.contains(&"VALIDSIG"))
    {
        return Verdict::Valid;
    }
    if any("NODATA") {
        return Verdict::Malformed("no signature data found".to_string());
    }
    for token in ["BADSIG", "NO_PUBKEY", "EXPKEYSIG", "REVKEYSIG"] {
        if any(token) {
            return Verdict::Untrusted(token.to_string());
        }
    }
    if code == Some(1) {
        return Verdict::Untrusted("signature did not verify".to_string());
    }
    Verdict::Malformed(format!(
        "gpg exited with {:?}: {}",
        code,
        stderr.trim()
    ))
}

/// Status keywords grouped per signature.
fn signature_blocks(status: &str) -> Vec<Vec<&str>> {
    let mut blocks = Vec::new();
    let mut current = Vec::new();
    for keyword in status
        .lines()
        .filter_map(|line| line.strip_prefix("[GNUPG:] "))
        .filter_map(|line| line.split_whitespace().next())
    {
        if keyword == "NEWSIG" {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push(keyword);
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}
