//! Latest-release lookup for images published as GitHub release assets.
//!
//! The lookup runs before resolution: it picks the asset and splits its
//! download URL into the base URL and image name of a plain
//! [`SourceDescriptor`], so resolution itself stays free of I/O.

use serde::Deserialize;
use tracing::info;

use crate::error::Error;
use crate::fetch::transport::Transport;
use crate::fetch::FetchError;

use super::SourceDescriptor;

const GITHUB_API: &str = "https://api.github.com";

/// A project whose newest release carries the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestRelease {
    pub owner: String,
    pub repo: String,
    /// Asset name suffix identifying the image, e.g. `.iso`.
    pub asset_extension: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    tag_name: String,
    #[serde(default)]
    assets: Vec<AssetJson>,
}

#[derive(Debug, Deserialize)]
struct AssetJson {
    name: String,
    browser_download_url: String,
}

impl LatestRelease {
    pub fn api_url(&self) -> String {
        format!(
            "{GITHUB_API}/repos/{}/{}/releases/latest",
            self.owner, self.repo
        )
    }

    /// Query the newest release and point `template` at its image asset.
    ///
    /// Every field of `template` other than the base URL and image name is
    /// kept as given.
    ///
    /// # Errors
    ///
    /// [`Error::Download`] when the API call fails, the response does not
    /// parse, or no asset matches the extension.
    pub fn lookup<T: Transport>(
        &self,
        transport: &T,
        template: SourceDescriptor,
    ) -> Result<SourceDescriptor, Error> {
        let api_url = self.api_url();
        let body = transport.get_text(&api_url).map_err(Error::from)?;
        let release: ReleaseJson =
            serde_json::from_str(&body).map_err(|e| Error::Download {
                url: api_url.clone(),
                reason: format!("unparseable release metadata: {e}"),
            })?;

        let asset_url = self.pick_asset(&release).ok_or_else(|| Error::Download {
            url: api_url.clone(),
            reason: format!(
                "release {} has no asset ending in '{}'",
                release.tag_name, self.asset_extension
            ),
        })?;

        let (base_url, image) = split_asset_url(asset_url).ok_or_else(|| {
            Error::from(FetchError::InvalidUrl {
                url: asset_url.to_string(),
            })
        })?;
        info!(release = %release.tag_name, url = %asset_url, "resolved latest release asset");

        Ok(SourceDescriptor {
            base_url: base_url.to_string(),
            image: image.to_string(),
            ..template
        })
    }

    /// Last asset whose name ends with the configured extension.
    fn pick_asset<'a>(&self, release: &'a ReleaseJson) -> Option<&'a str> {
        release
            .assets
            .iter()
            .filter(|asset| asset.name.ends_with(&self.asset_extension))
            .map(|asset| asset.browser_download_url.as_str())
            .last()
    }
}

fn split_asset_url(url: &str) -> Option<(&str, &str)> {
    let idx = url.rfind('/')?;
    let (base, name) = url.split_at(idx + 1);
    if name.is_empty() || !base.contains("://") {
        return None;
    }
    Some((base, name))
}
