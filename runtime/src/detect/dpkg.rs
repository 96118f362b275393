//! dpkg status database parsing.
//!
//! The status file is a sequence of RFC 822 style stanzas separated by
//! blank lines. Only `Package`, `Version` and `Architecture` are kept.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, BufReader};

use layerscan_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveEntry, ImageArchive};

use super::decode_line;

/// Location of the dpkg status database inside an image.
pub const DPKG_STATUS_FILE: &str = "var/lib/dpkg/status";

/// An installed package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub architecture: String,
}

impl fmt::Display for Package {
    /// `<name>-<version>`, the form the scanner expects.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// Entry point for dpkg detection.
pub struct DpkgStatus;

impl DpkgStatus {
    /// Find the dpkg status database of an image.
    pub fn detect(archive: &ImageArchive) -> Option<&ArchiveEntry> {
        archive.entry(DPKG_STATUS_FILE)
    }

    /// Lazily parse packages from a status stream.
    pub fn packages<R: BufRead>(reader: R) -> Packages<R> {
        Packages {
            reader,
            raw: Vec::new(),
            record: Record::default(),
            done: false,
        }
    }

    /// Detect the status database and collect every package in it.
    pub fn from_archive(archive: &ImageArchive) -> Result<Option<Vec<Package>>> {
        match Self::detect(archive) {
            Some(entry) => {
                let reader = BufReader::new(archive.extract(entry)?);
                Ok(Some(Self::packages(reader).collect::<Result<Vec<_>>>()?))
            }
            None => Ok(None),
        }
    }
}

/// Stanza being accumulated.
#[derive(Debug, Default)]
struct Record {
    fields: HashMap<String, String>,
    current: Option<String>,
    /// The current header repeats an earlier one and is ignored.
    repeated: bool,
    malformed: bool,
    lines: usize,
}

impl Record {
    fn push_line(&mut self, line: &str) {
        self.lines += 1;
        if self.malformed {
            return;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if self.repeated {
                return;
            }
            // Folded lines are appended verbatim.
            match self.current.as_ref().and_then(|key| self.fields.get_mut(key)) {
                Some(value) => value.push_str(line),
                None => self.malformed = true,
            }
            return;
        }

        match line.split_once(':') {
            Some((key, value)) => {
                let key = key.trim().to_ascii_lowercase();
                self.repeated = self.fields.contains_key(&key);
                if !self.repeated {
                    self.fields.insert(key.clone(), value.trim().to_string());
                }
                self.current = Some(key);
            }
            None => self.malformed = true,
        }
    }

    /// Turn the accumulated stanza into a package, resetting the record.
    fn finish(&mut self) -> Option<Package> {
        let record = std::mem::take(self);
        if record.lines == 0 {
            return None;
        }
        if record.malformed {
            tracing::warn!(
                package = record.fields.get("package").map(String::as_str).unwrap_or("<unknown>"),
                lines = record.lines,
                "Skipping malformed dpkg status record"
            );
            return None;
        }

        let mut fields = record.fields;
        let mut take = |key: &str| fields.remove(key).unwrap_or_default();
        Some(Package {
            name: take("package"),
            version: take("version"),
            architecture: take("architecture"),
        })
    }
}

/// Iterator over the packages of a dpkg status stream.
///
/// Yields `Err` only for I/O failures. Malformed stanzas are logged and
/// skipped; missing fields come back as empty strings.
pub struct Packages<R> {
    reader: R,
    raw: Vec<u8>,
    record: Record,
    done: bool,
}

impl<R: BufRead> Iterator for Packages<R> {
    type Item = Result<Package>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.raw.clear();
            match self.reader.read_until(b'\n', &mut self.raw) {
                Ok(0) => {
                    self.done = true;
                    if let Some(package) = self.record.finish() {
                        return Some(Ok(package));
                    }
                }
                Ok(_) => {
                    let line = decode_line(&self.raw);
                    if line.trim().is_empty() {
                        if let Some(package) = self.record.finish() {
                            return Some(Ok(package));
                        }
                    } else {
                        self.record.push_line(&line);
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}
