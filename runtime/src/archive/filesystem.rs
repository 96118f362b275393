//! Merged view over an ordered stack of layers.

use std::collections::BTreeMap;

use super::layer::ArchiveEntry;
use super::split_parent;

/// Path → currently visible entry, after applying layers in order.
///
/// Whiteout entries are consumed while merging and never stored.
#[derive(Debug, Clone, Default)]
pub struct MergedFilesystem {
    entries: BTreeMap<String, ArchiveEntry>,
}

impl MergedFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply all entries of one layer, in archive order.
    pub fn apply_layer<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = ArchiveEntry>,
    {
        for entry in entries {
            self.apply(entry);
        }
    }

    /// Apply a single entry on top of the current view.
    pub fn apply(&mut self, entry: ArchiveEntry) {
        if entry.is_opaque_whiteout() {
            let (dir, _) = split_parent(entry.path());
            let removed = self.remove_lower(dir, entry.layer().index());
            tracing::debug!(
                dir = %dir,
                layer = %entry.layer(),
                removed,
                "Opaque whiteout"
            );
            return;
        }

        if entry.is_whiteout() {
            let target = entry.whiteout_target();
            let removed = self.remove_tree(&target);
            if removed == 0 {
                tracing::debug!(
                    path = %target,
                    layer = %entry.layer(),
                    "Can't whiteout missing path"
                );
            } else {
                tracing::debug!(
                    path = %target,
                    layer = %entry.layer(),
                    removed,
                    "Whiteout"
                );
            }
            return;
        }

        self.entries.insert(entry.path().to_string(), entry);
    }

    /// Remove `path` and everything below it.
    fn remove_tree(&mut self, path: &str) -> usize {
        let mut removed = usize::from(self.entries.remove(path).is_some());
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            self.entries.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Remove everything below `dir` written by a layer older than `layer_index`.
    fn remove_lower(&mut self, dir: &str, layer_index: usize) -> usize {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, entry)| entry.layer().index() < layer_index)
            .map(|(key, _)| key.clone())
            .collect();
        let removed = doomed.len();
        for key in doomed {
            self.entries.remove(&key);
        }
        removed
    }

    /// Visible entry at a normalized path.
    pub fn get(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Visible entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArchiveEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }
}

#[cfg(test)]
mod tests {
    use super::super::layer::Layer;
    use super::super::source::ArchiveSource;
    use super::super::testing::{layer, Item};
    use super::*;
    use std::io::Read;
    use std::sync::Arc;

    fn entries(index: usize, items: &[Item<'_>]) -> Vec<ArchiveEntry> {
        let bytes = layer(items);
        let size = bytes.len() as u64;
        let location = format!("layer{}/layer.tar", index);
        let layer = Arc::new(
            Layer::new(&location, index, ArchiveSource::from(bytes), 0, size).unwrap(),
        );
        layer.read_entries().unwrap()
    }

    fn content(fs: &MergedFilesystem, path: &str) -> String {
        let mut content = String::new();
        fs.get(path)
            .unwrap()
            .extract()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    fn snapshot(fs: &MergedFilesystem) -> Vec<(String, String)> {
        fs.iter()
            .map(|(path, entry)| (path.to_string(), entry.layer().id().to_string()))
            .collect()
    }

    fn stack() -> Vec<Vec<ArchiveEntry>> {
        vec![
            entries(0, &[
                Item::Dir("a/"),
                Item::File("a/file", b"v1"),
                Item::File("a/keep", b"k"),
                Item::Dir("cache/"),
                Item::File("cache/old", b"o"),
            ]),
            entries(1, &[
                Item::File("a/.wh.file", b""),
                Item::File("b/new", b"n"),
            ]),
            entries(2, &[
                Item::File("a/file", b"v3"),
                Item::File("cache/.wh..wh..opq", b""),
                Item::File("cache/fresh", b"f"),
            ]),
            entries(3, &[Item::File(".wh.b", b""), Item::File("a/keep", b"k4")]),
        ]
    }

    #[test]
    fn test_overwrite() {
        let mut fs = MergedFilesystem::new();
        fs.apply_layer(entries(0, &[Item::File("a/file", b"v1")]));
        fs.apply_layer(entries(1, &[Item::File("a/file", b"v2")]));

        assert_eq!(content(&fs, "a/file"), "v2");
        assert_eq!(fs.get("a/file").unwrap().layer().id(), "layer1");
    }

    #[test]
    fn test_whiteout_removes_entry() {
        let mut fs = MergedFilesystem::new();
        fs.apply_layer(entries(0, &[Item::File("a/file", b"v1")]));
        fs.apply_layer(entries(1, &[Item::File("a/.wh.file", b"")]));

        assert!(!fs.contains("a/file"));
        assert!(!fs.contains("a/.wh.file"));
        assert!(fs.is_empty());
    }

    #[test]
    fn test_whiteout_of_missing_path_is_tolerated() {
        let mut fs = MergedFilesystem::new();
        fs.apply_layer(entries(0, &[Item::File("a/file", b"v1")]));
        fs.apply_layer(entries(1, &[Item::File("a/.wh.other", b"")]));

        assert_eq!(fs.len(), 1);
        assert!(fs.contains("a/file"));
    }

    #[test]
    fn test_whiteout_of_directory_hides_subtree() {
        let mut fs = MergedFilesystem::new();
        fs.apply_layer(entries(0, &[
            Item::Dir("a/"),
            Item::File("a/x", b"x"),
            Item::File("a/y/z", b"z"),
            Item::File("ab", b"sibling"),
        ]));
        fs.apply_layer(entries(1, &[Item::File(".wh.a", b"")]));

        let paths: Vec<&str> = fs.iter().map(|(path, _)| path).collect();
        assert_eq!(paths, ["ab"]);
    }

    #[test]
    fn test_opaque_whiteout_keeps_same_layer_entries() {
        let mut fs = MergedFilesystem::new();
        fs.apply_layer(entries(0, &[Item::File("cache/old", b"o"), Item::File("cachex", b"c")]));
        fs.apply_layer(entries(1, &[
            Item::File("cache/fresh", b"f"),
            Item::File("cache/.wh..wh..opq", b""),
        ]));

        assert!(!fs.contains("cache/old"));
        assert!(fs.contains("cache/fresh"));
        assert!(fs.contains("cachex"));
    }

    #[test]
    fn test_rewrite_after_whiteout() {
        let mut fs = MergedFilesystem::new();
        for layer in stack().into_iter().take(3) {
            fs.apply_layer(layer);
        }
        assert_eq!(content(&fs, "a/file"), "v3");
    }

    #[test]
    fn test_merge_split_at_any_point_is_identical() {
        let mut full = MergedFilesystem::new();
        for layer in stack() {
            full.apply_layer(layer);
        }
        let expected = snapshot(&full);
        assert_eq!(
            expected,
            [
                ("a".to_string(), "layer0".to_string()),
                ("a/file".to_string(), "layer2".to_string()),
                ("a/keep".to_string(), "layer3".to_string()),
                ("cache".to_string(), "layer0".to_string()),
                ("cache/fresh".to_string(), "layer2".to_string()),
            ]
        );

        for split in 0..=stack().len() {
            let layers = stack();
            let (head, tail) = layers.split_at(split);

            let mut prefix = MergedFilesystem::new();
            for layer in head {
                prefix.apply_layer(layer.clone());
            }
            let mut resumed = prefix.clone();
            for layer in tail {
                resumed.apply_layer(layer.clone());
            }

            assert_eq!(snapshot(&resumed), expected, "split at {}", split);
        }
    }
}
