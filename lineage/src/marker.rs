//! Locating the lineage store on disk.

use std::path::{Path, PathBuf};

const RELATIONAL_FILE: &str = "lineage.db";
const EMBEDDED_DIR: &str = "lineage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// SQLite database file.
    Relational,
    /// Embedded graph store directory. Detected, but not written to.
    EmbeddedGraph,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMarker {
    pub kind: StoreKind,
    pub path: PathBuf,
}

/// Search `start` and its ancestors for a store under `marker_dir`.
///
/// At each level an existing `lineage.db` entry of any file type wins over the
/// embedded directory; the nearest level with either wins overall. A
/// `lineage.db` that is not a usable database fails later, when opened.
#[must_use]
pub fn find_store_marker(start: &Path, marker_dir: &str) -> Option<StoreMarker> {
    start.ancestors().find_map(|dir| {
        let base = dir.join(marker_dir);
        let relational = base.join(RELATIONAL_FILE);
        if relational.exists() {
            return Some(StoreMarker {
                kind: StoreKind::Relational,
                path: relational,
            });
        }
        let embedded = base.join(EMBEDDED_DIR);
        embedded.is_dir().then_some(StoreMarker {
            kind: StoreKind::EmbeddedGraph,
            path: embedded,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_nothing_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_store_marker(dir.path(), ".spectrena"), None);
    }

    #[test]
    fn finds_marker_in_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".spectrena")).unwrap();
        fs::write(dir.path().join(".spectrena/lineage.db"), b"").unwrap();
        let nested = dir.path().join("src/deep/module");
        fs::create_dir_all(&nested).unwrap();

        let marker = find_store_marker(&nested, ".spectrena").unwrap();
        assert_eq!(marker.kind, StoreKind::Relational);
        assert_eq!(marker.path, dir.path().join(".spectrena/lineage.db"));
    }

    #[test]
    fn sqlite_file_preferred_over_embedded_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".spectrena/lineage")).unwrap();
        assert_eq!(
            find_store_marker(dir.path(), ".spectrena").map(|m| m.kind),
            Some(StoreKind::EmbeddedGraph)
        );

        fs::write(dir.path().join(".spectrena/lineage.db"), b"").unwrap();
        assert_eq!(
            find_store_marker(dir.path(), ".spectrena").map(|m| m.kind),
            Some(StoreKind::Relational)
        );
    }

    #[test]
    fn nearest_level_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".spectrena")).unwrap();
        fs::write(dir.path().join(".spectrena/lineage.db"), b"").unwrap();
        let inner = dir.path().join("pkg");
        fs::create_dir_all(inner.join(".spectrena/lineage")).unwrap();

        let marker = find_store_marker(&inner, ".spectrena").unwrap();
        assert_eq!(marker.kind, StoreKind::EmbeddedGraph);
        assert_eq!(marker.path, inner.join(".spectrena/lineage"));
    }

    #[test]
    fn lineage_file_named_like_dir_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".spectrena")).unwrap();
        fs::write(dir.path().join(".spectrena/lineage"), b"not a dir").unwrap();
        assert_eq!(find_store_marker(dir.path(), ".spectrena"), None);
    }

    #[test]
    fn any_lineage_db_entry_is_the_relational_marker() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".spectrena/lineage.db")).unwrap();
        fs::create_dir_all(dir.path().join(".spectrena/lineage")).unwrap();
        let marker = find_store_marker(dir.path(), ".spectrena").unwrap();
        assert_eq!(marker.kind, StoreKind::Relational);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_is_not_a_marker() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".spectrena")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("gone.db"),
            dir.path().join(".spectrena/lineage.db"),
        )
        .unwrap();
        assert_eq!(find_store_marker(dir.path(), ".spectrena"), None);

        fs::write(dir.path().join("gone.db"), b"").unwrap();
        assert_eq!(
            find_store_marker(dir.path(), ".spectrena").map(|m| m.kind),
            Some(StoreKind::Relational)
        );
    }
}
