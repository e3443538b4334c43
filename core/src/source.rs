//! Filesystem tree sources feeding the backup controller.

use crate::metadata::MetadataAdapter;
use crate::{EntryKind, Error, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::debug;
use walkdir::WalkDir;

/// One enumerated filesystem object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    /// Normalized relative path using `/` separators.
    pub path: String,
    pub absolute: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: i64,
    pub metadata: Vec<u8>,
    pub symlink_target: Option<String>,
}

/// A path that could not be enumerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Scan {
    /// Entries sorted by path, parents before children.
    pub entries: Vec<SourceEntry>,
    pub failures: Vec<ScanFailure>,
}

pub trait TreeSource: Send + Sync {
    /// Human readable description recorded in manifests.
    fn describe(&self) -> String;

    fn scan(&self) -> Result<Scan>;

    /// Opens the content stream of a regular file.
    fn open(&self, entry: &SourceEntry) -> Result<Box<dyn Read + Send>>;
}

/// Walks a local directory without following symlinks.
pub struct LocalTreeSource {
    root: PathBuf,
    excludes: Gitignore,
    metadata: Arc<dyn MetadataAdapter>,
}

impl LocalTreeSource {
    pub fn new(root: impl Into<PathBuf>, metadata: Arc<dyn MetadataAdapter>) -> Self {
        Self {
            root: root.into(),
            excludes: Gitignore::empty(),
            metadata,
        }
    }

    /// Exclude patterns use gitignore syntax relative to the root:
    /// `.DS_Store` and `*.tmp` match at any depth, `cache/tmp` and
    /// `cache/**` are anchored.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a malformed pattern.
    pub fn with_excludes(mut self, patterns: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(&self.root);
        for pattern in patterns {
            builder
                .add_line(None, &pattern)
                .map_err(|e| Error::InvalidConfig(format!("invalid exclude pattern '{pattern}': {e}")))?;
        }
        self.excludes = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("exclude matcher build failed: {e}")))?;
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, relative: &str, is_dir: bool) -> bool {
        self.excludes
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }

    fn entry_for(&self, path: &Path, relative: String) -> Result<Option<SourceEntry>> {
        let meta = fs::symlink_metadata(path)?;
        let file_type = meta.file_type();

        let (kind, size, symlink_target) = if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            let target = target
                .to_str()
                .ok_or_else(|| Error::Other("symlink target is not valid UTF-8".to_string()))?
                .to_string();
            (EntryKind::Symlink, 0, Some(target))
        } else if file_type.is_dir() {
            (EntryKind::Directory, 0, None)
        } else if file_type.is_file() {
            (EntryKind::File, meta.len(), None)
        } else {
            debug!("Skipping special file {}", relative);
            return Ok(None);
        };

        Ok(Some(SourceEntry {
            path: relative,
            absolute: path.to_path_buf(),
            kind,
            size,
            mtime: mtime_secs(&meta),
            metadata: self.metadata.capture(path, &meta)?,
            symlink_target,
        }))
    }
}

impl TreeSource for LocalTreeSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn scan(&self) -> Result<Scan> {
        if !fs::metadata(&self.root)?.is_dir() {
            return Err(Error::Other(format!(
                "source {} is not a directory",
                self.root.display()
            )));
        }

        let mut scan = Scan::default();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| match relative_path(&self.root, e.path()) {
                Some(rel) => !self.is_excluded(&rel, e.file_type().is_dir()),
                None => true,
            });

        for item in walker {
            let dir_entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| relative_path(&self.root, p))
                        .unwrap_or_else(|| self.describe());
                    scan.failures.push(ScanFailure {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let Some(relative) = relative_path(&self.root, dir_entry.path()) else {
                scan.failures.push(ScanFailure {
                    path: dir_entry.path().to_string_lossy().to_string(),
                    reason: "path is not valid UTF-8".to_string(),
                });
                continue;
            };

            match self.entry_for(dir_entry.path(), relative.clone()) {
                Ok(Some(entry)) => scan.entries.push(entry),
                Ok(None) => {}
                Err(e) => scan.failures.push(ScanFailure {
                    path: relative,
                    reason: e.to_string(),
                }),
            }
        }

        scan.entries.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(
            "Scanned {}: {} entries, {} failures",
            self.describe(),
            scan.entries.len(),
            scan.failures.len()
        );
        Ok(scan)
    }

    fn open(&self, entry: &SourceEntry) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&entry.absolute)?))
    }
}

pub(crate) fn mtime_secs(meta: &fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

/// Relative `/`-separated form of `path` below `root`, or `None` when the
/// path escapes the root or is not valid UTF-8.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Validates a stored relative path before it is joined onto a target.
pub fn safe_join(target: &Path, relative: &str) -> Option<PathBuf> {
    let mut out = target.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return None;
        }
        out.push(part);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::NoopMetadata;
    use tempfile::TempDir;

    fn source(dir: &TempDir) -> LocalTreeSource {
        LocalTreeSource::new(dir.path(), Arc::new(NoopMetadata))
    }

    #[test]
    fn test_scan_lists_sorted_relative_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/c")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::write(dir.path().join("b/c/d.txt"), b"world!").unwrap();

        let scan = source(&dir).scan().unwrap();
        let paths: Vec<_> = scan.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b", "b/c", "b/c/d.txt"]);
        assert!(scan.failures.is_empty());

        let file = &scan.entries[3];
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, 6);
        assert_eq!(scan.entries[1].kind, EntryKind::Directory);
    }

    #[test]
    fn test_excludes_by_name_and_prefix() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("cache/tmp")).unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("cache/tmp/x"), b"x").unwrap();
        fs::write(dir.path().join("cache/keep"), b"k").unwrap();
        fs::write(dir.path().join("src/.DS_Store"), b"junk").unwrap();
        fs::write(dir.path().join("src/main.rs"), b"fn main() {}").unwrap();

        let scan = source(&dir)
            .with_excludes(vec!["cache/tmp".to_string(), ".DS_Store".to_string()])
            .unwrap()
            .scan()
            .unwrap();
        let paths: Vec<_> = scan.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["cache", "cache/keep", "src", "src/main.rs"]);
    }

    #[test]
    fn test_excludes_with_globs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("cache/deep")).unwrap();
        fs::create_dir_all(dir.path().join("work/cache")).unwrap();
        fs::write(dir.path().join("cache/deep/blob"), b"b").unwrap();
        fs::write(dir.path().join("work/cache/kept"), b"k").unwrap();
        fs::write(dir.path().join("work/scratch.tmp"), b"t").unwrap();
        fs::write(dir.path().join("work/notes.txt"), b"n").unwrap();
        fs::write(dir.path().join("top.tmp"), b"t").unwrap();

        let scan = source(&dir)
            .with_excludes(vec!["*.tmp".to_string(), "cache/**".to_string()])
            .unwrap()
            .scan()
            .unwrap();
        let paths: Vec<_> = scan.entries.iter().map(|e| e.path.as_str()).collect();
        // `cache/**` is anchored: the directory itself stays, its content goes
        assert_eq!(
            paths,
            vec!["cache", "work", "work/cache", "work/cache/kept", "work/notes.txt"]
        );
    }

    #[test]
    fn test_invalid_exclude_pattern_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = source(&dir).with_excludes(vec!["src/[".to_string()]);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/f"), b"data").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("link")).unwrap();

        let scan = source(&dir).scan().unwrap();
        let link = scan.entries.iter().find(|e| e.path == "link").unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.symlink_target.as_deref(), Some("real"));
        assert!(!scan.entries.iter().any(|e| e.path == "link/f"));
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let target = Path::new("/restore");
        assert_eq!(safe_join(target, "a/b"), Some(PathBuf::from("/restore/a/b")));
        assert!(safe_join(target, "../etc/passwd").is_none());
        assert!(safe_join(target, "a//b").is_none());
        assert!(safe_join(target, "").is_none());
    }

    #[test]
    fn test_relative_path() {
        let root = Path::new("/data");
        assert_eq!(relative_path(root, Path::new("/data/x/y")).as_deref(), Some("x/y"));
        assert_eq!(relative_path(root, Path::new("/data")), None);
        assert_eq!(relative_path(root, Path::new("/other")), None);
    }
}
