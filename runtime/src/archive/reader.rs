//! Saved image archive parsing.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use layerscan_core::error::{Result, ScanError};

use super::filesystem::MergedFilesystem;
use super::layer::{ArchiveEntry, EntryKind, Layer};
use super::manifest::{ImageManifest, MANIFEST_FILE};
use super::source::ArchiveSource;
use super::{join_path, normalize_path, split_parent};

/// Longest chain of links followed when resolving a path.
const MAX_LINK_DEPTH: usize = 40;

/// Location of a member inside the outer archive.
#[derive(Debug, Clone, Copy)]
struct Member {
    offset: u64,
    size: u64,
}

/// A saved image with its layers merged into one filesystem view.
///
/// Constructed once; all accessors are read-only afterwards.
#[derive(Debug)]
pub struct ImageArchive {
    source: ArchiveSource,
    manifest: ImageManifest,
    config: serde_json::Value,
    layers: Vec<Arc<Layer>>,
    filesystem: MergedFilesystem,
}

impl ImageArchive {
    /// Open a saved image from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(ArchiveSource::File(path.as_ref().to_path_buf()), None)
    }

    /// Parse a saved image held in memory.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        Self::load(ArchiveSource::Memory(bytes.into()), None)
    }

    /// Parse a saved image from any source, using the first manifest record.
    pub fn from_source(source: ArchiveSource) -> Result<Self> {
        Self::load(source, None)
    }

    /// Parse the image tagged `tag` from an archive that may hold several.
    pub fn open_tagged(source: ArchiveSource, tag: &str) -> Result<Self> {
        Self::load(source, Some(tag))
    }

    fn load(source: ArchiveSource, tag: Option<&str>) -> Result<Self> {
        let members = Self::index_members(&source)?;

        let manifest_member = members.get(MANIFEST_FILE).ok_or_else(|| {
            ScanError::ArchiveFormat(format!(
                "{} not found in {}",
                MANIFEST_FILE,
                source.describe()
            ))
        })?;
        let content = Self::read_member(&source, manifest_member)?;
        let manifest = ImageManifest::select(ImageManifest::parse_all(&content)?, tag)?;

        let config = Self::load_config(&source, &members, &manifest);

        let mut layers = Vec::with_capacity(manifest.layers.len());
        let mut filesystem = MergedFilesystem::new();
        for (index, location) in manifest.layers.iter().enumerate() {
            let member = members.get(&normalize_path(location)).ok_or_else(|| {
                ScanError::ArchiveFormat(format!("Layer {} listed in manifest but missing", location))
            })?;

            let layer = Arc::new(Layer::new(
                location,
                index,
                source.clone(),
                member.offset,
                member.size,
            )?);
            filesystem.apply_layer(layer.read_entries()?);

            tracing::debug!(
                layer = %layer,
                location = %layer.location(),
                index,
                visible = filesystem.len(),
                tags = ?manifest.tags(),
                "Applied layer"
            );
            layers.push(layer);
        }

        tracing::debug!(
            source = %source.describe(),
            layers = layers.len(),
            entries = filesystem.len(),
            "Reconstructed image filesystem"
        );

        Ok(Self {
            source,
            manifest,
            config,
            layers,
            filesystem,
        })
    }

    /// Record where every member of the outer archive lives.
    fn index_members(source: &ArchiveSource) -> Result<HashMap<String, Member>> {
        let format_error = |e: std::io::Error| {
            ScanError::ArchiveFormat(format!("Malformed image archive {}: {}", source.describe(), e))
        };

        let mut archive = tar::Archive::new(source.open()?);
        let mut members = HashMap::new();
        for entry in archive.entries_with_seek().map_err(format_error)? {
            let entry = entry.map_err(format_error)?;
            let path = normalize_path(&entry.path().map_err(format_error)?.to_string_lossy());
            members.insert(
                path,
                Member {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                },
            );
        }
        Ok(members)
    }

    fn read_member(source: &ArchiveSource, member: &Member) -> Result<Vec<u8>> {
        // The header size is untrusted; let the buffer grow with the data.
        let mut content = Vec::new();
        source
            .open_range(member.offset, member.size)?
            .read_to_end(&mut content)?;
        if (content.len() as u64) < member.size {
            return Err(ScanError::ArchiveFormat(format!(
                "Truncated member at offset {} in {}: {} of {} bytes",
                member.offset,
                source.describe(),
                content.len(),
                member.size
            )));
        }
        Ok(content)
    }

    /// Load the image configuration; absence or damage yields `{}`.
    fn load_config(
        source: &ArchiveSource,
        members: &HashMap<String, Member>,
        manifest: &ImageManifest,
    ) -> serde_json::Value {
        let empty = || serde_json::Value::Object(serde_json::Map::new());

        let Some(config_path) = manifest.config.as_deref() else {
            return empty();
        };
        let Some(member) = members.get(&normalize_path(config_path)) else {
            tracing::warn!(config = %config_path, "Image config listed in manifest but missing");
            return empty();
        };

        match Self::read_member(source, member)
            .and_then(|content| Ok(serde_json::from_slice::<serde_json::Value>(&content)?))
        {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(config = %config_path, error = %e, "Ignoring unreadable image config");
                empty()
            }
        }
    }

    /// Selected manifest record.
    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Tags the image was saved under.
    pub fn tags(&self) -> &[String] {
        self.manifest.tags()
    }

    /// Image configuration (`{}` when absent).
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Layers, oldest first.
    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    /// Merged filesystem view.
    pub fn entries(&self) -> &MergedFilesystem {
        &self.filesystem
    }

    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    /// Look up the entry visible at `path`, following symbolic and hard
    /// links inside the merged view.
    pub fn entry(&self, path: &str) -> Option<&ArchiveEntry> {
        let mut path = normalize_path(path);
        for _ in 0..MAX_LINK_DEPTH {
            let entry = self.filesystem.get(&path)?;
            path = match entry.kind() {
                EntryKind::Symlink(target) => {
                    let (parent, _) = split_parent(entry.path());
                    if target.starts_with('/') {
                        normalize_path(target)
                    } else {
                        normalize_path(&join_path(parent, target))
                    }
                }
                EntryKind::HardLink(target) => normalize_path(target),
                _ => return Some(entry),
            };
        }

        tracing::warn!(path = %path, "Too many levels of links");
        None
    }

    /// Open the content of `entry` (re-read on every call).
    pub fn extract(&self, entry: &ArchiveEntry) -> Result<Box<dyn Read + Send>> {
        entry.extract()
    }

    /// Open the content at `path` (leading `/` allowed); `Ok(None)` when the
    /// path is not visible.
    pub fn get(&self, path: &str) -> Result<Option<Box<dyn Read + Send>>> {
        match self.entry(path) {
            Some(entry) => Ok(Some(self.extract(entry)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{archive, gzip, image, layer, Item};
    use super::*;
    use std::io::Write;

    fn read(archive: &ImageArchive, path: &str) -> Option<String> {
        archive.get(path).unwrap().map(|mut reader| {
            let mut content = String::new();
            reader.read_to_string(&mut content).unwrap();
            content
        })
    }

    fn debian_image() -> Vec<u8> {
        image(
            &["debian:11"],
            &[
                (
                    "base",
                    layer(&[
                        Item::Dir("etc/"),
                        Item::File("etc/motd", b"welcome"),
                        Item::File("usr/lib/os-release", b"ID=debian\n"),
                        Item::Symlink("etc/os-release", "../usr/lib/os-release"),
                    ]),
                ),
                (
                    "top",
                    gzip(&layer(&[
                        Item::File("etc/.wh.motd", b""),
                        Item::File("etc/hostname", b"scanner"),
                    ])),
                ),
            ],
        )
    }

    #[test]
    fn test_open_reconstructs_filesystem() {
        let archive = ImageArchive::from_bytes(debian_image()).unwrap();

        assert_eq!(archive.tags(), ["debian:11"]);
        let ids: Vec<&str> = archive.layers().iter().map(|l| l.id()).collect();
        assert_eq!(ids, ["base", "top"]);
        assert_eq!(archive.config()["os"], "linux");

        assert_eq!(read(&archive, "etc/hostname").as_deref(), Some("scanner"));
        assert_eq!(read(&archive, "/etc/hostname").as_deref(), Some("scanner"));
        assert!(read(&archive, "etc/motd").is_none());
        assert!(!archive.entries().contains("etc/.wh.motd"));
    }

    #[test]
    fn test_get_follows_symlinks() {
        let archive = ImageArchive::from_bytes(debian_image()).unwrap();
        assert_eq!(read(&archive, "etc/os-release").as_deref(), Some("ID=debian\n"));
        assert_eq!(
            archive.entry("etc/os-release").unwrap().path(),
            "usr/lib/os-release"
        );
    }

    #[test]
    fn test_symlink_loop_is_not_found() {
        let bytes = image(
            &[],
            &[(
                "l",
                layer(&[Item::Symlink("a", "b"), Item::Symlink("b", "/a")]),
            )],
        );
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        assert!(archive.entry("a").is_none());
    }

    #[test]
    fn test_get_missing_path_is_none() {
        let archive = ImageArchive::from_bytes(debian_image()).unwrap();
        assert!(archive.get("var/lib/dpkg/status").unwrap().is_none());
    }

    #[test]
    fn test_open_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&debian_image()).unwrap();
        file.flush().unwrap();

        let archive = ImageArchive::open(file.path()).unwrap();
        assert_eq!(read(&archive, "etc/hostname").as_deref(), Some("scanner"));
        assert_eq!(read(&archive, "etc/hostname").as_deref(), Some("scanner"));
    }

    #[test]
    fn test_missing_manifest_is_fatal() {
        let bytes = archive(&[("layer/layer.tar", layer(&[Item::File("a", b"a")]))]);
        let err = ImageArchive::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, ScanError::ArchiveFormat(_)));
        assert!(err.to_string().contains("manifest.json not found"));
    }

    #[test]
    fn test_truncated_manifest_is_fatal() {
        for (declared, present) in [(1u64 << 50, 0usize), (100, 10)] {
            let mut header = tar::Header::new_gnu();
            header.set_path(MANIFEST_FILE).unwrap();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(declared);
            header.set_cksum();

            let mut bytes = header.as_bytes().to_vec();
            bytes.extend(std::iter::repeat(b'[').take(present));

            let err = ImageArchive::from_bytes(bytes).unwrap_err();
            assert!(matches!(err, ScanError::ArchiveFormat(_)), "unexpected error: {}", err);
        }
    }

    #[test]
    fn test_missing_layer_is_fatal() {
        let manifest = br#"[{"Config": "c.json", "RepoTags": [], "Layers": ["gone/layer.tar"]}]"#;
        let bytes = archive(&[("manifest.json", manifest.to_vec())]);
        let err = ImageArchive::from_bytes(bytes).unwrap_err();
        assert!(err.to_string().contains("gone/layer.tar"));
    }

    #[test]
    fn test_missing_or_broken_config_is_tolerated() {
        let manifest = br#"[{"Config": "c.json", "RepoTags": ["x:1"], "Layers": ["l/layer.tar"]}]"#;
        let bytes = archive(&[
            ("manifest.json", manifest.to_vec()),
            ("c.json", b"{broken".to_vec()),
            ("l/layer.tar", layer(&[Item::File("a", b"a")])),
        ]);
        let archive_with_broken = ImageArchive::from_bytes(bytes).unwrap();
        assert_eq!(archive_with_broken.config(), &serde_json::json!({}));

        let manifest = br#"[{"RepoTags": ["x:1"], "Layers": ["l/layer.tar"]}]"#;
        let bytes = archive(&[
            ("manifest.json", manifest.to_vec()),
            ("l/layer.tar", layer(&[Item::File("a", b"a")])),
        ]);
        let archive_without = ImageArchive::from_bytes(bytes).unwrap();
        assert_eq!(archive_without.config(), &serde_json::json!({}));
        assert_eq!(read(&archive_without, "a").as_deref(), Some("a"));
    }

    #[test]
    fn test_open_tagged_selects_record() {
        let manifest = br#"[
            {"RepoTags": ["one:1"], "Layers": ["l1/layer.tar"]},
            {"RepoTags": ["two:2"], "Layers": ["l2/layer.tar"]}
        ]"#;
        let bytes = archive(&[
            ("manifest.json", manifest.to_vec()),
            ("l1/layer.tar", layer(&[Item::File("which", b"one")])),
            ("l2/layer.tar", layer(&[Item::File("which", b"two")])),
        ]);

        let first = ImageArchive::from_bytes(bytes.clone()).unwrap();
        assert_eq!(read(&first, "which").as_deref(), Some("one"));

        let second = ImageArchive::open_tagged(ArchiveSource::from(bytes), "two:2").unwrap();
        assert_eq!(read(&second, "which").as_deref(), Some("two"));
        assert_eq!(second.manifest().layers, ["l2/layer.tar"]);
        assert!(second.source().describe().starts_with("<memory"));
    }
}
