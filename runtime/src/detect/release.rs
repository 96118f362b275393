//! `os-release` parsing.

use std::io::{BufRead, BufReader};

use layerscan_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveEntry, ImageArchive};

use super::decode_line;

/// Primary location of the os-release file.
pub const ETC_OS_RELEASE: &str = "etc/os-release";

/// Fallback location of the os-release file.
pub const USR_LIB_OS_RELEASE: &str = "usr/lib/os-release";

/// Operating system identity of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsRelease {
    pub name: Option<String>,
    pub id: Option<String>,
    pub version_id: Option<String>,
    pub pretty_name: Option<String>,
    pub cpe_id: Option<String>,
}

/// Values may be wrapped in one pair of double or single quotes.
fn cleanup(value: &str) -> String {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote) {
            return inner.strip_suffix(quote).unwrap_or(inner).trim().to_string();
        }
    }
    value.to_string()
}

impl OsRelease {
    /// Find the os-release entry of an image.
    pub fn detect(archive: &ImageArchive) -> Option<&ArchiveEntry> {
        archive
            .entry(ETC_OS_RELEASE)
            .or_else(|| archive.entry(USR_LIB_OS_RELEASE))
    }

    /// Detect and parse the image's os-release, if it has one.
    pub fn from_archive(archive: &ImageArchive) -> Result<Option<Self>> {
        match Self::detect(archive) {
            Some(entry) => {
                let reader = BufReader::new(archive.extract(entry)?);
                Ok(Some(Self::parse(reader)?))
            }
            None => Ok(None),
        }
    }

    /// Parse os-release content.
    ///
    /// Invalid UTF-8 is replaced, unknown keys are ignored and a repeated
    /// key keeps its last value. Only I/O failures are errors.
    pub fn parse<R: BufRead>(mut reader: R) -> Result<Self> {
        let mut release = Self::default();
        let mut raw = Vec::new();

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = decode_line(&raw);

            if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
                release.pretty_name = Some(cleanup(value));
            } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
                release.version_id = Some(cleanup(value));
            } else if let Some(value) = line.strip_prefix("NAME=") {
                release.name = Some(cleanup(value));
            } else if let Some(value) = line.strip_prefix("CPE_NAME=") {
                release.cpe_id = Some(cleanup(value));
            } else if let Some(value) = line.strip_prefix("ID=") {
                release.id = Some(cleanup(value));
            }
        }

        Ok(release)
    }

    /// Operating system identifier understood by the scanner, `"<id> <version_id>"`.
    pub fn operating_system(&self) -> String {
        format!(
            "{} {}",
            self.id.as_deref().unwrap_or_default(),
            self.version_id.as_deref().unwrap_or_default()
        )
        .trim()
        .to_string()
    }
}

impl std::fmt::Display for OsRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.pretty_name, &self.name) {
            (Some(pretty), _) => write!(f, "{}", pretty),
            (None, Some(name)) => write!(f, "{} {}", name, self.version_id.as_deref().unwrap_or("")),
            (None, None) => write!(f, "{}", self.operating_system()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ImageArchive;
    use crate::archive::testing::{image, layer, Item};

    const DEBIAN: &str = r#"PRETTY_NAME="Debian GNU/Linux 11 (bullseye)"
NAME="Debian GNU/Linux"
VERSION_ID="11"
VERSION="11 (bullseye)"
VERSION_CODENAME=bullseye
ID=debian
HOME_URL="https://www.debian.org/"
"#;

    #[test]
    fn test_parse_debian() {
        let release = OsRelease::parse(DEBIAN.as_bytes()).unwrap();
        assert_eq!(release.pretty_name.as_deref(), Some("Debian GNU/Linux 11 (bullseye)"));
        assert_eq!(release.name.as_deref(), Some("Debian GNU/Linux"));
        assert_eq!(release.version_id.as_deref(), Some("11"));
        assert_eq!(release.id.as_deref(), Some("debian"));
        assert_eq!(release.cpe_id, None);
        assert_eq!(release.operating_system(), "debian 11");
    }

    #[test]
    fn test_cpe_name_and_single_quotes() {
        let content = "CPE_NAME='cpe:/o:redhat:enterprise_linux:9::baseos'\nID='rhel'\n";
        let release = OsRelease::parse(content.as_bytes()).unwrap();
        assert_eq!(
            release.cpe_id.as_deref(),
            Some("cpe:/o:redhat:enterprise_linux:9::baseos")
        );
        assert_eq!(release.id.as_deref(), Some("rhel"));
    }

    #[test]
    fn test_last_occurrence_wins() {
        let release = OsRelease::parse("ID=alpine\nID=debian\n".as_bytes()).unwrap();
        assert_eq!(release.id.as_deref(), Some("debian"));
    }

    #[test]
    fn test_prefixes_are_exact() {
        let content = "VERSION_CODENAME=bookworm\nID_LIKE=debian\nXNAME=foo\n";
        let release = OsRelease::parse(content.as_bytes()).unwrap();
        assert_eq!(release, OsRelease::default());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut content = b"NAME=\"Deb".to_vec();
        content.push(0xff);
        content.extend_from_slice(b"ian\"\r\nID=debian");
        let release = OsRelease::parse(content.as_slice()).unwrap();
        assert_eq!(release.name.as_deref(), Some("Deb\u{fffd}ian"));
        assert_eq!(release.id.as_deref(), Some("debian"));
    }

    #[test]
    fn test_quoting_round_trip() {
        let fields = [
            ("NAME", "Alpine Linux"),
            ("ID", "alpine"),
            ("VERSION_ID", "3.19.1"),
            ("PRETTY_NAME", "Alpine Linux v3.19"),
            ("CPE_NAME", "cpe:/o:alpinelinux:alpine_linux:3.19"),
        ];
        let styles: [fn(&str) -> String; 3] = [
            |v| format!("\"{}\"", v),
            |v| format!("'{}'", v),
            |v| v.to_string(),
        ];

        for rotation in 0..fields.len() {
            for (offset, _) in styles.iter().enumerate() {
                let mut lines = Vec::new();
                for i in 0..fields.len() {
                    let (key, value) = fields[(i + rotation) % fields.len()];
                    let style = styles[(i + offset) % styles.len()];
                    lines.push(format!("{}={}  ", key, style(value)));
                }
                let content = lines.join("\n");
                let release = OsRelease::parse(content.as_bytes()).unwrap();

                assert_eq!(release.name.as_deref(), Some("Alpine Linux"));
                assert_eq!(release.id.as_deref(), Some("alpine"));
                assert_eq!(release.version_id.as_deref(), Some("3.19.1"));
                assert_eq!(release.pretty_name.as_deref(), Some("Alpine Linux v3.19"));
                assert_eq!(
                    release.cpe_id.as_deref(),
                    Some("cpe:/o:alpinelinux:alpine_linux:3.19")
                );
            }
        }
    }

    #[test]
    fn test_detect_prefers_etc() {
        let bytes = image(
            &["x:1"],
            &[(
                "l",
                layer(&[
                    Item::File("usr/lib/os-release", b"ID=fallback\n"),
                    Item::File("etc/os-release", b"ID=primary\n"),
                ]),
            )],
        );
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        let release = OsRelease::from_archive(&archive).unwrap().unwrap();
        assert_eq!(release.id.as_deref(), Some("primary"));
    }

    #[test]
    fn test_detect_falls_back_to_usr_lib() {
        let bytes = image(
            &["x:1"],
            &[("l", layer(&[Item::File("usr/lib/os-release", b"ID=fallback\n")]))],
        );
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        let release = OsRelease::from_archive(&archive).unwrap().unwrap();
        assert_eq!(release.id.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_detect_none() {
        let bytes = image(&["x:1"], &[("l", layer(&[Item::File("bin/sh", b"")]))]);
        let archive = ImageArchive::from_bytes(bytes).unwrap();
        assert!(OsRelease::from_archive(&archive).unwrap().is_none());
    }
}
