//! Docker image archive reconstruction.
//!
//! Reads the tarball produced by `docker save` (image spec v1.2, including
//! the OCI `blobs/` layout written by newer engines) and merges its layers
//! into a single logical filesystem view.
//!
//! # Layout
//!
//! ```text
//! image.tar
//! ├── manifest.json          [{Config, Layers: [...], RepoTags: [...]}]
//! ├── <config>.json          (image configuration, optional)
//! └── <layer-id>/layer.tar   (one nested tar per layer, oldest first)
//! ```
//!
//! Layers are applied oldest to newest. A later layer overwrites any path
//! it writes; a `.wh.<name>` entry deletes `<name>` (and anything below it)
//! from the view, and `.wh..wh..opq` hides everything earlier layers put in
//! its directory. Entry content is never copied out of the archive: each
//! entry remembers where its bytes live and is re-read on demand.

mod filesystem;
mod layer;
mod manifest;
mod reader;
mod source;

pub use filesystem::MergedFilesystem;
pub use layer::{ArchiveEntry, EntryKind, Layer, LayerCompression};
pub use manifest::ImageManifest;
pub use reader::ImageArchive;
pub use source::ArchiveSource;

/// Base name prefix marking a deleted path.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Base name marking a directory whose lower-layer contents are hidden.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Normalize an archive path: no leading `/` or `./`, no trailing `/`,
/// `.` and `..` components resolved.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Split a normalized path into its parent directory and base name.
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Join a parent directory and a base name.
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/etc/os-release"), "etc/os-release");
        assert_eq!(normalize_path("./etc/"), "etc");
        assert_eq!(normalize_path("usr/lib/../lib/os-release"), "usr/lib/os-release");
        assert_eq!(normalize_path("./"), "");
        assert_eq!(normalize_path("a//b"), "a/b");
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_parent("a/b/c"), ("a/b", "c"));
        assert_eq!(split_parent("c"), ("", "c"));
        assert_eq!(join_path("a/b", "c"), "a/b/c");
        assert_eq!(join_path("", "c"), "c");
    }
}
