//! `manifest.json` of a saved image.

use layerscan_core::error::{Result, ScanError};
use serde::{Deserialize, Serialize};

/// Name of the manifest member in a saved image.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One record of `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Path of the image configuration blob
    #[serde(rename = "Config", default)]
    pub config: Option<String>,

    /// Tags the image was saved under
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,

    /// Paths of the layer tarballs, oldest first
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

impl ImageManifest {
    /// Tags of this image (empty when saved by id).
    pub fn tags(&self) -> &[String] {
        self.repo_tags.as_deref().unwrap_or(&[])
    }

    /// Parse every record of `manifest.json`.
    pub fn parse_all(content: &[u8]) -> Result<Vec<ImageManifest>> {
        let manifests: Vec<ImageManifest> = serde_json::from_slice(content)
            .map_err(|e| ScanError::ArchiveFormat(format!("Failed to parse {}: {}", MANIFEST_FILE, e)))?;

        if manifests.is_empty() {
            return Err(ScanError::ArchiveFormat(format!(
                "{} contains no image records",
                MANIFEST_FILE
            )));
        }

        Ok(manifests)
    }

    /// Pick the record to reconstruct.
    ///
    /// With a tag, the record listing that tag is chosen. Without one, the
    /// first record wins and the others are reported as ignored.
    pub fn select(manifests: Vec<ImageManifest>, tag: Option<&str>) -> Result<ImageManifest> {
        if let Some(tag) = tag {
            return manifests
                .into_iter()
                .find(|manifest| manifest.tags().iter().any(|t| t == tag))
                .ok_or_else(|| {
                    ScanError::ArchiveFormat(format!("No image tagged '{}' in archive", tag))
                });
        }

        let total = manifests.len();
        let mut manifests = manifests.into_iter();
        let first = manifests
            .next()
            .ok_or_else(|| ScanError::ArchiveFormat(format!("{} is empty", MANIFEST_FILE)))?;

        if total > 1 {
            let ignored: Vec<String> = manifests.flat_map(|m| m.tags().to_vec()).collect();
            tracing::warn!(
                records = total,
                selected = ?first.tags(),
                ignored = ?ignored,
                "Archive holds several images, using the first"
            );
        }

        Ok(first)
    }
}
