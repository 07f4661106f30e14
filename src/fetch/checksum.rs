//! Digest helpers: algorithm selection, checksum manifest parsing and
//! hash-while-writing.

use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

/// Digest algorithm used to check a fetched artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Infer the algorithm from a checksum manifest file name.
    ///
    /// `SHA512SUMS`, `sha512sum.txt` and friends select SHA-512; anything
    /// else falls back to SHA-256.
    pub fn for_manifest(file_name: &str) -> Self {
        if file_name.to_ascii_lowercase().contains("512") {
            HashAlgorithm::Sha512
        } else {
            HashAlgorithm::Sha256
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Length of the lowercase hex digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => f.write_str("sha256"),
            HashAlgorithm::Sha512 => f.write_str("sha512"),
        }
    }
}

/// Running digest for one of the supported algorithms.
#[derive(Clone)]
pub enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Writer adapter that digests every byte written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush and return the inner writer with the hex digest.
    pub fn finish(mut self) -> io::Result<(W, String)> {
        self.inner.flush()?;
        Ok((self.inner, self.hasher.finalize_hex()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hex digest of a file on disk.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Find the digest listed for `file_name` in a checksum manifest.
///
/// Understands coreutils output (`<hex>  <name>`, `<hex> *<name>`) and the
/// BSD tagged form (`SHA256 (<name>) = <hex>`). Entries may carry a `./`
/// prefix. Clearsigned manifests work too since armor lines never match.
pub fn lookup_digest(manifest: &str, file_name: &str, algorithm: HashAlgorithm) -> Option<String> {
    manifest.lines().find_map(|line| {
        let line = line.trim();
        [parse_coreutils_line(line), parse_bsd_line(line)]
            .into_iter()
            .flatten()
            .find(|(digest, name)| {
                normalize_name(name) == file_name && is_hex_digest(digest, algorithm)
            })
            .map(|(digest, _)| digest.to_ascii_lowercase())
    })
}

fn parse_coreutils_line(line: &str) -> Option<(&str, &str)> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    let name = rest.trim_start();
    let name = name.strip_prefix('*').unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    Some((digest, name))
}

fn parse_bsd_line(line: &str) -> Option<(&str, &str)> {
    let (_, rest) = line.split_once(" (")?;
    let (name, digest) = rest.split_once(") = ")?;
    Some((digest.trim(), name))
}

fn normalize_name(name: &str) -> &str {
    name.trim().strip_prefix("./").unwrap_or(name.trim())
}

fn is_hex_digest(value: &str, algorithm: HashAlgorithm) -> bool {
    value.len() == algorithm.hex_len() && value.bytes().all(|b| b.is_ascii_hexdigit())
}
