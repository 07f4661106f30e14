use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Stage};
use crate::extract::ImageLayout;
use crate::fetch::transport::Transport;
use crate::source::release::LatestRelease;
use crate::source::{
    SourceDescriptor, DEFAULT_CHECKSUM_FILE, DEFAULT_KEYSERVER, DEFAULT_SIGNATURE_SUFFIX,
};

/// Directory under the user cache dir used when `[cache] dir` is unset.
pub const CACHE_DIR_NAME: &str = "distro-source";

const DEFAULT_ASSET_EXTENSION: &str = ".iso";

#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub source: SourceConfig,
    pub layout: ImageLayout,
    pub sync: SyncMode,
    pub cache_dir: PathBuf,
}

/// Where the image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Fixed(SourceDescriptor),
    /// Newest release asset; `template` carries the verification policy.
    GithubLatest {
        release: LatestRelease,
        template: SourceDescriptor,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Builtin,
    Rsync,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    source: SourceToml,
    extract: Option<ExtractToml>,
    cache: Option<CacheToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceToml {
    kind: Option<String>,
    url: Option<String>,
    image: Option<String>,
    owner: Option<String>,
    repo: Option<String>,
    asset_extension: Option<String>,
    skip_verification: Option<bool>,
    keys: Option<Vec<String>>,
    keyserver: Option<String>,
    checksum_file: Option<String>,
    signature_suffix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractToml {
    nested_image: Option<String>,
    outer_fs: Option<String>,
    inner_fs: Option<String>,
    sync: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheToml {
    dir: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::parse(&text, path)
    }

    /// Parse `text`; `path` is used for error messages and relative paths.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let source = parse_source(parsed.source, path)?;
        let extract = parsed.extract.unwrap_or_default();
        let sync = parse_sync_mode(extract.sync.as_deref(), path)?;
        let layout = parse_layout(extract, path)?;
        let cache_dir = match parsed.cache.and_then(|cache| cache.dir) {
            Some(dir) => resolve_config_path(base_dir, &dir),
            None => default_cache_dir().with_context(|| {
                format!(
                    "config '{}' sets no [cache] dir and no user cache directory is available",
                    path.display()
                )
            })?,
        };

        Ok(Self {
            path: path.to_path_buf(),
            source,
            layout,
            sync,
            cache_dir,
        })
    }

    /// The descriptor used for verification policy decisions.
    pub fn policy(&self) -> &SourceDescriptor {
        match &self.source {
            SourceConfig::Fixed(descriptor) => descriptor,
            SourceConfig::GithubLatest { template, .. } => template,
        }
    }

    /// Concrete descriptor for this run. Fixed sources are used as
    /// configured; latest-release sources are looked up through `transport`
    /// and fail in the resolve stage.
    pub fn descriptor<T: Transport>(
        &self,
        transport: &T,
    ) -> Result<SourceDescriptor, PipelineError> {
        match &self.source {
            SourceConfig::Fixed(descriptor) => Ok(descriptor.clone()),
            SourceConfig::GithubLatest { release, template } => release
                .lookup(transport, template.clone())
                .map_err(|e| PipelineError::new(Stage::Resolve, e)),
        }
    }
}

pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join(CACHE_DIR_NAME))
}

fn parse_source(source: SourceToml, config_path: &Path) -> Result<SourceConfig> {
    let kind = source
        .kind
        .as_deref()
        .map(|kind| kind.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "fixed".to_string());

    let mut template = SourceDescriptor::new(String::new(), String::new())
        .skip_verification(source.skip_verification.unwrap_or(false))
        .with_keys(
            source
                .keys
                .unwrap_or_default()
                .into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
        );
    template.keyring.keyserver = non_empty(source.keyserver, "keyserver", config_path)?
        .unwrap_or_else(|| DEFAULT_KEYSERVER.to_string());
    template.checksum_file = non_empty(source.checksum_file, "checksum_file", config_path)?
        .unwrap_or_else(|| DEFAULT_CHECKSUM_FILE.to_string());
    template.signature_suffix = non_empty(source.signature_suffix, "signature_suffix", config_path)?
        .unwrap_or_else(|| DEFAULT_SIGNATURE_SUFFIX.to_string());
    if template.checksum_file.contains('/') {
        bail!(
            "invalid config '{}': source.checksum_file must be a bare file name",
            config_path.display()
        );
    }

    match kind.as_str() {
        "fixed" => {
            reject(source.owner.is_some(), "owner", &kind, config_path)?;
            reject(source.repo.is_some(), "repo", &kind, config_path)?;
            reject(source.asset_extension.is_some(), "asset_extension", &kind, config_path)?;
            let url = require(source.url, "url", &kind, config_path)?;
            if !url.contains("://") {
                bail!(
                    "invalid config '{}': source.url '{}' has no scheme",
                    config_path.display(),
                    url
                );
            }
            let image = require(source.image, "image", &kind, config_path)?;
            if image.contains('/') {
                bail!(
                    "invalid config '{}': source.image must be a bare file name, got '{}'",
                    config_path.display(),
                    image
                );
            }
            Ok(SourceConfig::Fixed(SourceDescriptor {
                base_url: url,
                image,
                ..template
            }))
        }
        "github_latest" => {
            reject(source.url.is_some(), "url", &kind, config_path)?;
            reject(source.image.is_some(), "image", &kind, config_path)?;
            let release = LatestRelease {
                owner: require(source.owner, "owner", &kind, config_path)?,
                repo: require(source.repo, "repo", &kind, config_path)?,
                asset_extension: non_empty(source.asset_extension, "asset_extension", config_path)?
                    .unwrap_or_else(|| DEFAULT_ASSET_EXTENSION.to_string()),
            };
            // Release assets are served over https.
            template.base_url = "https://github.com/".to_string();
            Ok(SourceConfig::GithubLatest { release, template })
        }
        other => bail!(
            "invalid config '{}': unsupported source.kind '{}' (expected 'fixed' or 'github_latest')",
            config_path.display(),
            other
        ),
    }
}

fn parse_layout(extract: ExtractToml, config_path: &Path) -> Result<ImageLayout> {
    let defaults = ImageLayout::default();
    let nested_image = match non_empty(extract.nested_image, "nested_image", config_path)? {
        Some(raw) => {
            let path = PathBuf::from(raw.trim_start_matches('/'));
            if path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                bail!(
                    "invalid config '{}': extract.nested_image must stay inside the image, got '{}'",
                    config_path.display(),
                    raw
                );
            }
            path
        }
        None => defaults.nested_image,
    };
    Ok(ImageLayout {
        nested_image,
        outer_fs: non_empty(extract.outer_fs, "outer_fs", config_path)?.unwrap_or(defaults.outer_fs),
        inner_fs: non_empty(extract.inner_fs, "inner_fs", config_path)?.unwrap_or(defaults.inner_fs),
    })
}

fn parse_sync_mode(value: Option<&str>, config_path: &Path) -> Result<SyncMode> {
    match value.map(|raw| raw.trim().to_ascii_lowercase()).as_deref() {
        None | Some("builtin") => Ok(SyncMode::Builtin),
        Some("rsync") => Ok(SyncMode::Rsync),
        Some(other) => bail!(
            "invalid config '{}': unsupported extract.sync '{}' (expected 'builtin' or 'rsync')",
            config_path.display(),
            other
        ),
    }
}

fn require(value: Option<String>, field: &str, kind: &str, config_path: &Path) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => bail!(
            "invalid config '{}': source.{} is required for kind '{}'",
            config_path.display(),
            field,
            kind
        ),
    }
}

fn reject(present: bool, field: &str, kind: &str, config_path: &Path) -> Result<()> {
    if present {
        bail!(
            "invalid config '{}': source.{} is not allowed for kind '{}'",
            config_path.display(),
            field,
            kind
        );
    }
    Ok(())
}

fn non_empty(value: Option<String>, field: &str, config_path: &Path) -> Result<Option<String>> {
    match value {
        Some(v) if v.trim().is_empty() => bail!(
            "invalid config '{}': {} must not be empty",
            config_path.display(),
            field
        ),
        Some(v) => Ok(Some(v.trim().to_string())),
        None => Ok(None),
    }
}

fn resolve_config_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
