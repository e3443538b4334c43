//! Restore engine.
//!
//! Resolves the manifest chain for the requested increment, merges it into a
//! logical tree and materializes that tree under a target directory.
//! Directories are created first, regular files are reconstructed in
//! parallel, symlinks follow, and directory metadata is applied last so
//! restrictive permissions never block the creation of children.

use crate::archive::{Archive, VolumeCache};
use crate::cancel::CancelHandle;
use crate::codec::ChunkCodec;
use crate::index::DedupIndex;
use crate::manifest::FailedEntry;
use crate::metadata::{self, MetadataAdapter};
use crate::progress::{Progress, ProgressFn, report};
use crate::source::{relative_path, safe_join};
use crate::tree::LogicalTree;
use crate::{ChunkID, Error, FileEntry, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreOptions {
    /// Increment to restore; the latest when unset.
    pub increment: Option<u32>,
    /// Restore only entries at or below these paths. Empty means everything.
    pub paths: Vec<String>,
    pub threads: usize,
    /// Plan the restore without writing anything.
    pub dry_run: bool,
    /// Remove entries under the target that are within the selected paths
    /// but absent from the restored increment.
    pub delete_missing: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            increment: None,
            paths: Vec::new(),
            threads: crate::backup::default_threads(),
            dry_run: false,
            delete_missing: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    pub increment: u32,
    pub dry_run: bool,
    pub files: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub bytes: u64,
    /// Paths removed from the target (or that would be, on a dry run).
    pub deleted: Vec<String>,
    pub failed: Vec<FailedEntry>,
    pub duration_secs: f64,
}

impl RestoreSummary {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    fn fail(&mut self, path: &str, error: &Error) {
        warn!("Failed to restore {}: {}", path, error);
        self.failed.push(FailedEntry {
            path: path.to_string(),
            reason: error.to_string(),
        });
    }
}

/// Everything a file job needs, shared across worker threads.
struct RestoreContext {
    codec: ChunkCodec,
    index: DedupIndex,
    volumes: VolumeCache,
    metadata: Arc<dyn MetadataAdapter>,
    cancel: CancelHandle,
}

pub struct RestoreEngine<'a> {
    archive: &'a Archive,
    options: RestoreOptions,
    metadata: Arc<dyn MetadataAdapter>,
    cancel: CancelHandle,
    progress: Option<ProgressFn>,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(archive: &'a Archive, options: RestoreOptions) -> Self {
        Self {
            archive,
            options,
            metadata: metadata::detect(),
            cancel: CancelHandle::new(),
            progress: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataAdapter>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Logical tree selected by the options, without touching any volume.
    ///
    /// # Errors
    ///
    /// Returns `Error::ManifestChain` when the chain cannot be resolved.
    pub async fn plan(&self) -> Result<(u32, LogicalTree)> {
        let chain = self.archive.load_chain().await?;
        let manifests = chain.resolve(self.options.increment)?;
        let increment = manifests
            .last()
            .map(|m| m.sequence)
            .ok_or_else(|| Error::ManifestChain("archive has no increments".to_string()))?;
        let tree = LogicalTree::merge(manifests);

        if self.options.paths.is_empty() {
            return Ok((increment, tree));
        }
        let mut selected = LogicalTree::default();
        for prefix in &self.options.paths {
            for entry in &tree.filter_prefix(prefix) {
                // parents of a selected path come along so it has somewhere to go
                for (i, _) in entry.path.match_indices('/') {
                    if let Some(parent) = tree.get(&entry.path[..i]) {
                        selected.insert(parent.clone());
                    }
                }
                selected.insert(entry.clone());
            }
        }
        Ok((increment, selected))
    }

    /// Restores the selected tree under `target`.
    ///
    /// A chunk that fails verification or lives in an unusable volume fails
    /// only the file that needs it. Chain resolution failures abort.
    pub async fn run(&self, target: &Path) -> Result<RestoreSummary> {
        let started = Instant::now();
        let (increment, tree) = self.plan().await?;
        info!(
            "Restoring increment {} ({} entries) to {}",
            increment,
            tree.len(),
            target.display()
        );
        report(&self.progress, Progress::Planned { entries: tree.len() });

        let mut summary = RestoreSummary {
            increment,
            dry_run: self.options.dry_run,
            ..RestoreSummary::default()
        };

        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut links = Vec::new();
        for entry in &tree {
            let Some(dest) = safe_join(target, &entry.path) else {
                summary.fail(&entry.path, &restore_error(&entry.path, "unsafe path"));
                continue;
            };
            if entry.is_dir() {
                dirs.push((entry.clone(), dest));
            } else if entry.is_symlink() {
                links.push((entry.clone(), dest));
            } else if entry.is_file() {
                files.push((entry.clone(), dest));
            }
        }

        if self.options.delete_missing {
            self.delete_missing(target, &tree, &mut summary);
        }

        if self.options.dry_run {
            summary.directories = dirs.len();
            summary.symlinks = links.len();
            summary.files = files.len();
            summary.bytes = files.iter().map(|(e, _)| e.size).sum();
            summary.duration_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }

        fs::create_dir_all(target)?;
        let mut created = Vec::with_capacity(dirs.len());
        for (entry, dest) in dirs {
            match fs::create_dir_all(&dest) {
                Ok(()) => {
                    summary.directories += 1;
                    created.push((entry, dest));
                }
                Err(e) => summary.fail(&entry.path, &restore_error(&entry.path, e)),
            }
        }

        let (index, unusable) = self.archive.build_index().await?;
        for volume in &unusable {
            warn!("Volume {} is unusable: {}", volume.volume, volume.reason);
        }
        let ctx = Arc::new(RestoreContext {
            codec: self.archive.codec()?,
            index,
            volumes: VolumeCache::new(self.archive.volume_opener()),
            metadata: Arc::clone(&self.metadata),
            cancel: self.cancel.clone(),
        });

        self.restore_files(&ctx, files, &mut summary).await;
        self.cancel.check()?;

        for (entry, dest) in &links {
            match restore_symlink(&ctx, entry, dest) {
                Ok(()) => summary.symlinks += 1,
                Err(e) => summary.fail(&entry.path, &e),
            }
        }

        // deepest first so a parent's mtime is set after its children change it
        for (entry, dest) in created.iter().rev() {
            if let Err(e) = ctx.metadata.apply(dest, entry) {
                summary.fail(&entry.path, &restore_error(&entry.path, e));
            }
        }

        summary.duration_secs = started.elapsed().as_secs_f64();
        info!(
            "Restored {} files, {} directories, {} symlinks ({} bytes), {} failed",
            summary.files,
            summary.directories,
            summary.symlinks,
            summary.bytes,
            summary.failed.len()
        );
        Ok(summary)
    }

    async fn restore_files(
        &self,
        ctx: &Arc<RestoreContext>,
        files: Vec<(FileEntry, PathBuf)>,
        summary: &mut RestoreSummary,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.threads.max(1)));
        let mut jobs: JoinSet<(FileEntry, Result<u64>)> = JoinSet::new();

        for (entry, dest) in files {
            while let Some(joined) = jobs.try_join_next() {
                self.absorb(joined, summary);
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let ctx = Arc::clone(ctx);
            jobs.spawn_blocking(move || {
                let _permit = permit;
                let result = restore_file(&ctx, &entry, &dest);
                (entry, result)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            self.absorb(joined, summary);
        }
    }

    fn absorb(
        &self,
        joined: std::result::Result<(FileEntry, Result<u64>), tokio::task::JoinError>,
        summary: &mut RestoreSummary,
    ) {
        match joined {
            Ok((entry, Ok(bytes))) => {
                summary.files += 1;
                summary.bytes += bytes;
                report(
                    &self.progress,
                    Progress::FileDone {
                        path: entry.path,
                        bytes,
                    },
                );
            }
            Ok((_, Err(Error::Cancelled))) => {}
            Ok((entry, Err(e))) => {
                summary.fail(&entry.path, &e);
                report(&self.progress, Progress::FileFailed { path: entry.path });
            }
            Err(e) => {
                summary.failed.push(FailedEntry {
                    path: String::new(),
                    reason: format!("restore job failed: {e}"),
                });
            }
        }
    }

    /// Removes what lies under `target` within the selected paths but is
    /// not part of `tree`, or has a different type there. Removal of a
    /// directory covers its whole subtree.
    fn delete_missing(&self, target: &Path, tree: &LogicalTree, summary: &mut RestoreSummary) {
        if !target.is_dir() {
            return;
        }
        let in_scope = |rel: &str| {
            self.options.paths.is_empty()
                || self.options.paths.iter().any(|p| {
                    let p = p.trim_matches('/');
                    p.is_empty()
                        || rel == p
                        || rel.strip_prefix(p).is_some_and(|rest| rest.starts_with('/'))
                })
        };

        let mut walker = WalkDir::new(target)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();
        while let Some(item) = walker.next() {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    let path = e
                        .path()
                        .and_then(|p| relative_path(target, p))
                        .unwrap_or_default();
                    summary.fail(&path, &restore_error(&path, e));
                    continue;
                }
            };
            let Some(rel) = relative_path(target, item.path()) else {
                continue;
            };
            let on_disk_dir = item.file_type().is_dir();
            let keep = match tree.get(&rel) {
                Some(entry) => entry.is_dir() == on_disk_dir,
                None => false,
            };
            if keep || !in_scope(&rel) {
                continue;
            }
            if on_disk_dir {
                walker.skip_current_dir();
            }

            if !self.options.dry_run {
                let removed = if on_disk_dir {
                    fs::remove_dir_all(item.path())
                } else {
                    fs::remove_file(item.path())
                };
                if let Err(e) = removed {
                    summary.fail(&rel, &restore_error(&rel, e));
                    continue;
                }
            }
            debug!("Deleted {} (not in increment {})", rel, summary.increment);
            summary.deleted.push(rel);
        }
    }
}

fn restore_error(path: &str, reason: impl ToString) -> Error {
    Error::FileRestore {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.cairn-part"))
}

/// Rebuilds one regular file next to its destination and renames it into
/// place once its content hash checks out.
fn restore_file(ctx: &RestoreContext, entry: &FileEntry, dest: &Path) -> Result<u64> {
    let partial = partial_path(dest);
    let written = write_content(ctx, entry, &partial).and_then(|bytes| {
        fs::rename(&partial, dest)?;
        Ok(bytes)
    });
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&partial);
            return Err(match e {
                Error::Cancelled => Error::Cancelled,
                e @ Error::FileRestore { .. } => e,
                e => restore_error(&entry.path, e),
            });
        }
    };

    ctx.metadata
        .apply(dest, entry)
        .map_err(|e| restore_error(&entry.path, format!("metadata: {e}")))?;
    debug!("Restored {} ({} bytes)", entry.path, bytes);
    Ok(bytes)
}

fn write_content(ctx: &RestoreContext, entry: &FileEntry, partial: &Path) -> Result<u64> {
    if let Some(parent) = partial.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(partial)?);
    let mut hasher = ctx.codec.content_hasher();
    let mut bytes = 0u64;

    for id in &entry.chunks {
        ctx.cancel.check()?;
        let plaintext = read_chunk(ctx, id)?;
        hasher.update(&plaintext);
        out.write_all(&plaintext)?;
        bytes += plaintext.len() as u64;
    }
    out.flush()?;
    drop(out);

    if bytes != entry.size {
        return Err(restore_error(
            &entry.path,
            format!("expected {} bytes, reconstructed {}", entry.size, bytes),
        ));
    }
    if let Some(expected) = entry.content_hash {
        let actual = ChunkID::new(hasher.finalize());
        if actual != expected {
            return Err(restore_error(&entry.path, "content hash mismatch"));
        }
    }
    Ok(bytes)
}

fn read_chunk(ctx: &RestoreContext, id: &ChunkID) -> Result<Vec<u8>> {
    let location = ctx
        .index
        .lookup(id)
        .ok_or_else(|| Error::ChunkNotFound { id: id.to_hex() })?;
    let volume = ctx.volumes.get(location.volume)?;
    let record = volume.read_chunk(location.offset, location.length)?;
    ctx.codec.decode(&record.data, &record.iv, id)
}

fn restore_symlink(ctx: &RestoreContext, entry: &FileEntry, dest: &Path) -> Result<()> {
    let target = entry
        .symlink_target
        .as_deref()
        .ok_or_else(|| restore_error(&entry.path, "symlink without target"))?;
    if let Ok(existing) = fs::symlink_metadata(dest) {
        if existing.is_dir() {
            return Err(restore_error(&entry.path, "a directory is in the way"));
        }
        fs::remove_file(dest).map_err(|e| restore_error(&entry.path, e))?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| restore_error(&entry.path, e))?;
    }
    create_symlink(target, dest).map_err(|e| restore_error(&entry.path, e))?;
    ctx.metadata
        .apply(dest, entry)
        .map_err(|e| restore_error(&entry.path, format!("metadata: {e}")))
}

#[cfg(unix)]
fn create_symlink(target: &str, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(windows)]
fn create_symlink(target: &str, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_is_hidden_sibling() {
        let p = partial_path(Path::new("/out/docs/report.pdf"));
        assert_eq!(p, PathBuf::from("/out/docs/.report.pdf.cairn-part"));
    }

    #[test]
    fn test_default_options_restore_latest_everything() {
        let options = RestoreOptions::default();
        assert!(options.increment.is_none());
        assert!(options.paths.is_empty());
        assert!(options.threads >= 1);
        assert!(!options.dry_run);
        assert!(!options.delete_missing);
    }
}
