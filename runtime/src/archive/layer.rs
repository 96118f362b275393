//! Image layers and the entries they contain.

use std::io::{Cursor, Read};
use std::sync::Arc;

use flate2::read::GzDecoder;
use layerscan_core::error::{Result, ScanError};
use tar::EntryType;

use super::source::ArchiveSource;
use super::{normalize_path, split_parent, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// Compression applied to a nested layer tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
}

impl LayerCompression {
    fn sniff(source: &ArchiveSource, offset: u64, size: u64) -> Result<Self> {
        let mut magic = [0u8; 2];
        let mut reader = source.open_range(offset, size.min(2))?;
        let mut filled = 0;
        while filled < magic.len() {
            let n = reader.read(&mut magic[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 2 && magic == [0x1f, 0x8b] {
            Ok(Self::Gzip)
        } else {
            Ok(Self::None)
        }
    }
}

/// One filesystem layer of an image, backed by a nested tarball inside the
/// outer archive.
#[derive(Debug)]
pub struct Layer {
    id: String,
    index: usize,
    location: String,
    source: ArchiveSource,
    offset: u64,
    size: u64,
    compression: LayerCompression,
}

impl Layer {
    /// Describe the layer stored at `offset..offset + size` of `source`.
    pub(crate) fn new(
        location: &str,
        index: usize,
        source: ArchiveSource,
        offset: u64,
        size: u64,
    ) -> Result<Self> {
        let compression = LayerCompression::sniff(&source, offset, size)?;
        Ok(Self {
            id: Self::id_from_location(location),
            index,
            location: location.to_string(),
            source,
            offset,
            size,
            compression,
        })
    }

    /// Derive a layer id from its location in the archive.
    ///
    /// `<id>/layer.tar` yields `<id>`; OCI style `blobs/<alg>/<digest>`
    /// yields `<digest>`.
    pub fn id_from_location(location: &str) -> String {
        let normalized = normalize_path(location);
        let mut parts = normalized.split('/');
        let first = parts.next().unwrap_or_default();
        if first == "blobs" {
            if let Some(last) = normalized.rsplit('/').next() {
                return last.to_string();
            }
        }
        first.to_string()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Position of this layer, 0 being the oldest.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Path of the nested tarball inside the outer archive.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn compression(&self) -> LayerCompression {
        self.compression
    }

    /// Size of the nested tarball in bytes (as stored).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open a fresh, decompressed stream over the nested tarball.
    pub(crate) fn open(&self) -> Result<Box<dyn Read + Send>> {
        let raw = self.source.open_range(self.offset, self.size)?;
        Ok(match self.compression {
            LayerCompression::None => raw,
            LayerCompression::Gzip => Box::new(GzDecoder::new(raw)),
        })
    }

    fn format_error(&self, e: impl std::fmt::Display) -> ScanError {
        ScanError::ArchiveFormat(format!("Malformed layer {} ({}): {}", self.id, self.location, e))
    }

    /// Read the entry table of this layer in archive order.
    pub(crate) fn read_entries(self: &Arc<Self>) -> Result<Vec<ArchiveEntry>> {
        let mut archive = tar::Archive::new(self.open()?);
        let mut entries = Vec::new();

        let iter = archive.entries().map_err(|e| self.format_error(e))?;
        for (ordinal, entry) in iter.enumerate() {
            let entry = entry.map_err(|e| self.format_error(e))?;
            let raw_path = entry.path().map_err(|e| self.format_error(e))?;
            let path = normalize_path(&raw_path.to_string_lossy());
            if path.is_empty() {
                continue;
            }

            let link_target = entry
                .link_name()
                .map_err(|e| self.format_error(e))?
                .map(|target| target.to_string_lossy().into_owned());
            let kind = EntryKind::from_header(entry.header().entry_type(), link_target);

            entries.push(ArchiveEntry {
                path,
                layer: Arc::clone(self),
                kind,
                ordinal,
                data_offset: entry.raw_file_position(),
                size: entry.size(),
            });
        }

        tracing::debug!(
            layer = %self.id,
            entries = entries.len(),
            compression = ?self.compression,
            "Read layer entry table"
        );

        Ok(entries)
    }

    /// Open the content of `entry`, which must belong to this layer.
    pub(crate) fn extract(&self, entry: &ArchiveEntry) -> Result<Box<dyn Read + Send>> {
        match self.compression {
            LayerCompression::None => Ok(self
                .source
                .open_range(self.offset + entry.data_offset, entry.size)?),
            LayerCompression::Gzip => {
                // No random access into a gzip stream: walk to the entry again.
                let mut archive = tar::Archive::new(self.open()?);
                let mut iter = archive.entries().map_err(|e| self.format_error(e))?;
                let mut found = iter
                    .nth(entry.ordinal)
                    .ok_or_else(|| {
                        self.format_error(format!("entry {} disappeared", entry.path))
                    })?
                    .map_err(|e| self.format_error(e))?;

                let mut content = Vec::new();
                found.read_to_end(&mut content)?;
                if (content.len() as u64) < entry.size {
                    return Err(self.format_error(format!(
                        "entry {} truncated: {} of {} bytes",
                        entry.path,
                        content.len(),
                        entry.size
                    )));
                }
                Ok(Box::new(Cursor::new(content)))
            }
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Type of an archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Symbolic link with its target as written in the archive
    Symlink(String),
    /// Hard link to another path of the archive
    HardLink(String),
    Other,
}

impl EntryKind {
    fn from_header(entry_type: EntryType, link_target: Option<String>) -> Self {
        match (entry_type, link_target) {
            (EntryType::Regular | EntryType::Continuous, _) => Self::File,
            (EntryType::Directory, _) => Self::Directory,
            (EntryType::Symlink, Some(target)) => Self::Symlink(target),
            (EntryType::Link, Some(target)) => Self::HardLink(target),
            _ => Self::Other,
        }
    }
}

/// A path written by a layer.
///
/// The entry does not hold its content; [`super::ImageArchive::extract`]
/// re-reads it from the owning layer on every call.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    path: String,
    layer: Arc<Layer>,
    kind: EntryKind,
    ordinal: usize,
    data_offset: u64,
    size: u64,
}

impl ArchiveEntry {
    /// Normalized path (no leading slash).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Layer that wrote this entry.
    pub fn layer(&self) -> &Arc<Layer> {
        &self.layer
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// Content size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this entry deletes a path from lower layers.
    pub fn is_whiteout(&self) -> bool {
        split_parent(&self.path).1.starts_with(WHITEOUT_PREFIX)
    }

    /// Whether this entry hides the lower-layer contents of its directory.
    pub fn is_opaque_whiteout(&self) -> bool {
        split_parent(&self.path).1 == OPAQUE_WHITEOUT
    }

    /// Path this whiteout deletes, or the entry's own path otherwise.
    pub fn whiteout_target(&self) -> String {
        let (parent, name) = split_parent(&self.path);
        match name.strip_prefix(WHITEOUT_PREFIX) {
            Some(target) => super::join_path(parent, target),
            None => self.path.clone(),
        }
    }

    /// Open the entry's content.
    pub fn extract(&self) -> Result<Box<dyn Read + Send>> {
        self.layer.extract(self)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{gzip, layer, Item};
    use super::*;

    fn layer_from(bytes: Vec<u8>) -> Arc<Layer> {
        let size = bytes.len() as u64;
        Arc::new(Layer::new("abc123/layer.tar", 0, ArchiveSource::from(bytes), 0, size).unwrap())
    }

    fn read(entry: &ArchiveEntry) -> String {
        let mut content = String::new();
        entry.extract().unwrap().read_to_string(&mut content).unwrap();
        content
    }

    #[test]
    fn test_layer_id_from_location() {
        assert_eq!(Layer::id_from_location("abc123/layer.tar"), "abc123");
        assert_eq!(Layer::id_from_location("./abc123/layer.tar"), "abc123");
        assert_eq!(Layer::id_from_location("blobs/sha256/deadbeef"), "deadbeef");
    }

    #[test]
    fn test_read_entries_in_archive_order() {
        let bytes = layer(&[
            Item::Dir("etc/"),
            Item::File("etc/hostname", b"box"),
            Item::Symlink("etc/os-release", "../usr/lib/os-release"),
            Item::File("etc/.wh.motd", b""),
        ]);
        let layer = layer_from(bytes);
        let entries = layer.read_entries().unwrap();

        let paths: Vec<&str> = entries.iter().map(|e| e.path()).collect();
        assert_eq!(paths, ["etc", "etc/hostname", "etc/os-release", "etc/.wh.motd"]);
        assert_eq!(entries[0].kind(), &EntryKind::Directory);
        assert_eq!(
            entries[2].kind(),
            &EntryKind::Symlink("../usr/lib/os-release".to_string())
        );
        assert!(entries[3].is_whiteout());
        assert_eq!(entries[3].whiteout_target(), "etc/motd");
        assert!(!entries[1].is_whiteout());
    }

    #[test]
    fn test_extract_uncompressed_is_repeatable() {
        let layer = layer_from(layer(&[Item::File("a", b"first"), Item::File("b", b"second")]));
        let entries = layer.read_entries().unwrap();

        assert_eq!(read(&entries[1]), "second");
        assert_eq!(read(&entries[1]), "second");
        assert_eq!(read(&entries[0]), "first");
    }

    #[test]
    fn test_extract_gzip_layer() {
        let layer = layer_from(gzip(&layer(&[
            Item::File("a", b"first"),
            Item::File("b", b"second"),
        ])));
        assert_eq!(layer.compression(), LayerCompression::Gzip);

        let entries = layer.read_entries().unwrap();
        assert_eq!(read(&entries[1]), "second");
        assert_eq!(read(&entries[0]), "first");
    }

    #[test]
    fn test_opaque_whiteout_detection() {
        let layer = layer_from(layer(&[Item::File("var/cache/.wh..wh..opq", b"")]));
        let entries = layer.read_entries().unwrap();
        assert!(entries[0].is_whiteout());
        assert!(entries[0].is_opaque_whiteout());
    }

    #[test]
    fn test_malformed_layer_is_archive_format_error() {
        let mut bytes = layer(&[Item::File("a", b"first")]);
        // Corrupt the header checksum field.
        bytes[148..156].copy_from_slice(b"garbage!");
        let layer = layer_from(bytes);

        let err = layer.read_entries().unwrap_err();
        assert!(matches!(err, ScanError::ArchiveFormat(_)));
    }
}
