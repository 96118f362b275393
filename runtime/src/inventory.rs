//! Package inventory of a saved image.

use std::path::Path;

use layerscan_core::error::Result;
use serde::Serialize;

use crate::archive::ImageArchive;
use crate::detect::{DpkgStatus, OsRelease, Package};

/// What a scan needs to know about an image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInventory {
    pub tags: Vec<String>,
    pub layers: Vec<String>,
    pub os_release: OsRelease,
    pub packages: Vec<Package>,
}

impl ImageInventory {
    /// Packages as `name-version`, the form sent to the scanner.
    pub fn package_list(&self) -> Vec<String> {
        self.packages.iter().map(Package::to_string).collect()
    }

    /// Scanner-facing operating system identifier.
    pub fn operating_system(&self) -> String {
        self.os_release.operating_system()
    }
}

/// Build the inventory of an image.
///
/// Returns `Ok(None)` when the image has no os-release file or no dpkg
/// status database, i.e. when it cannot be scanned by package.
pub fn collect_inventory(archive: &ImageArchive) -> Result<Option<ImageInventory>> {
    let Some(os_release) = OsRelease::from_archive(archive)? else {
        tracing::info!(
            source = %archive.source().describe(),
            tags = ?archive.tags(),
            "No os-release found"
        );
        return Ok(None);
    };
    let Some(packages) = DpkgStatus::from_archive(archive)? else {
        tracing::info!(tags = ?archive.tags(), os = %os_release, "No dpkg status database found");
        return Ok(None);
    };

    tracing::debug!(
        tags = ?archive.tags(),
        config = ?archive.manifest().config,
        os = %os_release.operating_system(),
        packages = packages.len(),
        "Inventory collected"
    );

    Ok(Some(ImageInventory {
        tags: archive.tags().to_vec(),
        layers: archive.layers().iter().map(|layer| layer.id().to_string()).collect(),
        os_release,
        packages,
    }))
}

/// Open a saved image from disk and build its inventory.
pub fn inventory_from_file(path: &Path) -> Result<Option<ImageInventory>> {
    let archive = ImageArchive::open(path)?;
    collect_inventory(&archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testing::{gzip, image, layer, Item};

    const OS_RELEASE: &[u8] = b"PRETTY_NAME=\"Debian GNU/Linux 11 (bullseye)\"\nNAME=\"Debian GNU/Linux\"\nVERSION_ID=\"11\"\nID=debian\n";

    const STATUS_V1: &[u8] = b"Package: libc6\nVersion: 2.31-13\nArchitecture: amd64\n\nPackage: openssl\nVersion: 1.1.1k-1\nArchitecture: amd64\n";

    const STATUS_V2: &[u8] = b"Package: libc6\nVersion: 2.31-13+deb11u5\nArchitecture: amd64\n\nPackage: openssl\nVersion: 1.1.1n-0+deb11u4\nArchitecture: amd64\n";

    fn debian_image() -> Vec<u8> {
        image(
            &["debian:11"],
            &[
                (
                    "base",
                    layer(&[
                        Item::Dir("etc/"),
                        Item::Dir("usr/lib/"),
                        Item::File("usr/lib/os-release", OS_RELEASE),
                        Item::Symlink("etc/os-release", "../usr/lib/os-release"),
                        Item::File("var/lib/dpkg/status", STATUS_V1),
                        Item::File("var/lib/dpkg/status-old", STATUS_V1),
                    ]),
                ),
                (
                    "upgrade",
                    gzip(&layer(&[
                        Item::File("var/lib/dpkg/status", STATUS_V2),
                        Item::File("var/lib/dpkg/.wh.status-old", b""),
                    ])),
                ),
            ],
        )
    }

    #[test]
    fn test_end_to_end_inventory() {
        let archive = ImageArchive::from_bytes(debian_image()).unwrap();
        let inventory = collect_inventory(&archive).unwrap().unwrap();

        assert_eq!(inventory.tags, ["debian:11"]);
        assert_eq!(inventory.layers, ["base", "upgrade"]);
        assert_eq!(inventory.os_release.id.as_deref(), Some("debian"));
        assert_eq!(inventory.os_release.version_id.as_deref(), Some("11"));
        assert_eq!(inventory.operating_system(), "debian 11");
        assert_eq!(inventory.packages.len(), 2);
        assert_eq!(
            inventory.package_list(),
            ["libc6-2.31-13+deb11u5", "openssl-1.1.1n-0+deb11u4"]
        );
        assert!(archive.entry("var/lib/dpkg/status-old").is_none());
    }

    #[test]
    fn test_not_applicable_without_dpkg() {
        let bytes = image(
            &["alpine:3.19"],
            &[("l", layer(&[Item::File("etc/os-release", b"ID=alpine\nVERSION_ID=3.19.1\n")]))],
        );
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        assert!(collect_inventory(&archive).unwrap().is_none());
    }

    #[test]
    fn test_not_applicable_without_os_release() {
        let bytes = image(
            &["scratch:1"],
            &[("l", layer(&[Item::File("var/lib/dpkg/status", STATUS_V1)]))],
        );
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        assert!(collect_inventory(&archive).unwrap().is_none());
    }

    #[test]
    fn test_inventory_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debian.tar");
        std::fs::write(&path, debian_image()).unwrap();

        let inventory = inventory_from_file(&path).unwrap().unwrap();
        assert_eq!(inventory.packages.len(), 2);

        let json = serde_json::to_value(&inventory).unwrap();
        assert_eq!(json["os_release"]["id"], "debian");
        assert_eq!(json["packages"][1]["name"], "openssl");
    }
}
