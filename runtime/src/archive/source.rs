//! Backing storage of an image archive.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Readable and seekable byte stream.
pub(crate) trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Where the bytes of an image archive live.
///
/// Every read re-opens the source, so independent readers never share a
/// cursor.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// Archive saved on disk
    File(PathBuf),
    /// Archive held in memory
    Memory(Arc<[u8]>),
}

impl ArchiveSource {
    /// Human-readable location for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory(bytes) => format!("<memory: {} bytes>", bytes.len()),
        }
    }

    pub(crate) fn open(&self) -> io::Result<Box<dyn ReadSeek>> {
        match self {
            Self::File(path) => Ok(Box::new(File::open(path)?)),
            Self::Memory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }

    /// Open a window of `len` bytes starting at `offset`.
    pub(crate) fn open_range(&self, offset: u64, len: u64) -> io::Result<Box<dyn Read + Send>> {
        let mut reader = self.open()?;
        reader.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(reader.take(len)))
    }
}

impl From<&Path> for ArchiveSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<PathBuf> for ArchiveSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<Vec<u8>> for ArchiveSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Memory(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_range_memory() {
        let source = ArchiveSource::from(b"0123456789".to_vec());
        let mut window = String::new();
        source.open_range(3, 4).unwrap().read_to_string(&mut window).unwrap();
        assert_eq!(window, "3456");
    }

    #[test]
    fn test_open_range_file_reopens() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello layered world").unwrap();
        let source = ArchiveSource::from(file.path());

        for _ in 0..2 {
            let mut window = String::new();
            source.open_range(6, 7).unwrap().read_to_string(&mut window).unwrap();
            assert_eq!(window, "layered");
        }
    }
}
