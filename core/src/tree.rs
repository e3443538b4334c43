//! Reconstruction of the logical file tree from a chain of manifests.

use crate::manifest::Manifest;
use crate::{Error, FileEntry, Result};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// Live entries of an archive as of one increment, keyed by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicalTree {
    entries: BTreeMap<String, FileEntry>,
}

impl LogicalTree {
    /// Applies manifests oldest to newest. A later entry overrides an earlier
    /// one; a tombstone removes its path together with everything below it.
    pub fn merge<'a>(manifests: impl IntoIterator<Item = &'a Manifest>) -> Self {
        let mut tree = Self::default();
        for manifest in manifests {
            for entry in &manifest.entries {
                if entry.is_tombstone() {
                    tree.remove_subtree(&entry.path);
                } else {
                    tree.insert(entry.clone());
                }
            }
        }
        tree
    }

    pub fn insert(&mut self, entry: FileEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    /// Removes `path` and all of its descendants.
    pub fn remove_subtree(&mut self, path: &str) {
        self.entries.remove(path);
        let descendants: Vec<String> = self
            .entries
            .range(format!("{path}/")..format!("{path}0"))
            .map(|(p, _)| p.clone())
            .collect();
        for p in descendants {
            self.entries.remove(&p);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, FileEntry> {
        self.entries.values()
    }

    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values().filter(|e| e.is_file())
    }

    pub fn total_size(&self) -> u64 {
        self.files().map(|e| e.size).sum()
    }

    /// Entries equal to `prefix` or below it. An empty prefix selects everything.
    pub fn filter_prefix(&self, prefix: &str) -> LogicalTree {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.clone();
        }
        let entries = self
            .entries
            .iter()
            .filter(|(path, _)| {
                path.as_str() == prefix
                    || path
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        LogicalTree { entries }
    }
}

impl<'a> IntoIterator for &'a LogicalTree {
    type Item = &'a FileEntry;
    type IntoIter = btree_map::Values<'a, String, FileEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Every manifest of an archive, addressed by sequence number.
#[derive(Debug, Default)]
pub struct ManifestChain {
    manifests: BTreeMap<u32, Manifest>,
    broken: BTreeMap<u32, String>,
}

impl ManifestChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, manifest: Manifest) {
        self.manifests.insert(manifest.sequence, manifest);
    }

    /// Records a manifest file that exists but could not be parsed.
    pub fn mark_broken(&mut self, sequence: u32, reason: impl Into<String>) {
        self.broken.insert(sequence, reason.into());
    }

    pub fn broken(&self) -> &BTreeMap<u32, String> {
        &self.broken
    }

    pub fn get(&self, sequence: u32) -> Option<&Manifest> {
        self.manifests.get(&sequence)
    }

    /// Highest sequence number present on disk, readable or not.
    pub fn highest_sequence(&self) -> Option<u32> {
        let readable = self.manifests.keys().next_back().copied();
        let broken = self.broken.keys().next_back().copied();
        readable.max(broken)
    }

    fn missing(&self, sequence: u32, context: String) -> Error {
        match self.broken.get(&sequence) {
            Some(reason) => Error::ManifestChain(format!("{context}: {reason}")),
            None => Error::ManifestChain(context),
        }
    }

    pub fn latest(&self) -> Option<&Manifest> {
        self.manifests.values().next_back()
    }

    pub fn latest_sequence(&self) -> Option<u32> {
        self.manifests.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.values()
    }

    /// Walks `previous` links back from `target` (or the latest manifest)
    /// and returns the chain oldest first.
    pub fn resolve(&self, target: Option<u32>) -> Result<Vec<&Manifest>> {
        let target = match target.or_else(|| self.highest_sequence()) {
            Some(seq) => seq,
            None => return Ok(Vec::new()),
        };
        let start = self
            .get(target)
            .ok_or_else(|| self.missing(target, format!("increment {target} is not readable")))?;

        let mut chain = vec![start];
        let mut current = start;
        while let Some(previous) = current.previous {
            if previous >= current.sequence {
                return Err(Error::ManifestChain(format!(
                    "increment {} references later increment {}",
                    current.sequence, previous
                )));
            }
            current = self.get(previous).ok_or_else(|| {
                self.missing(
                    previous,
                    format!(
                        "increment {} references missing increment {}",
                        current.sequence, previous
                    ),
                )
            })?;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Logical tree as of `target` (or the latest increment).
    pub fn tree_at(&self, target: Option<u32>) -> Result<LogicalTree> {
        Ok(LogicalTree::merge(self.resolve(target)?))
    }
}
