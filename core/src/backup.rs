//! Backup controller.
//!
//! One run enumerates the source, classifies every entry against the merged
//! tree of the latest increment and stores what changed. Regular files are
//! chunked on a bounded pool of blocking workers; encoded chunks that the
//! dedup index does not know yet are sent over a bounded channel to a single
//! writer that owns the volume set. The manifest is written only after the
//! writer has finalized every volume of the run.

use crate::archive::Archive;
use crate::cancel::CancelHandle;
use crate::change::{Change, ChangeDetection};
use crate::chunker::Chunker;
use crate::codec::{ChunkCodec, EncodedChunk};
use crate::index::DedupIndex;
use crate::manifest::{FailedEntry, ManifestBuilder};
use crate::progress::{Progress, ProgressFn, report};
use crate::source::{SourceEntry, TreeSource};
use crate::tree::LogicalTree;
use crate::volume::{FinalizedVolume, VolumeSet};
use crate::{ChunkID, EntryKind, Error, FileEntry, Result, VolumeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupOptions {
    /// Files chunked and encoded concurrently.
    pub threads: usize,
    /// Encoded chunks that may wait for the volume writer.
    pub queue_depth: usize,
    pub change_detection: ChangeDetection,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            queue_depth: 16,
            change_detection: ChangeDetection::default(),
        }
    }
}

pub(crate) fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Machine readable outcome of a backup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupSummary {
    pub increment: u32,
    pub previous: Option<u32>,
    pub files_new: usize,
    pub files_changed: usize,
    pub files_metadata_changed: usize,
    pub files_unchanged: usize,
    pub directories: usize,
    pub symlinks: usize,
    pub deleted: usize,
    pub failed: Vec<FailedEntry>,
    pub bytes_read: u64,
    pub chunks_written: u64,
    pub chunks_deduplicated: u64,
    pub bytes_stored: u64,
    pub volumes: Vec<VolumeId>,
    pub duration_secs: f64,
}

impl BackupSummary {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    fn count(&mut self, kind: EntryKind, change: Change) {
        match kind {
            EntryKind::Directory => self.directories += 1,
            EntryKind::Symlink => self.symlinks += 1,
            _ => match change {
                Change::New => self.files_new += 1,
                Change::ContentChanged => self.files_changed += 1,
                Change::MetadataChanged => self.files_metadata_changed += 1,
                Change::Unchanged => self.files_unchanged += 1,
                Change::Deleted => self.deleted += 1,
            },
        }
    }
}

enum Stored {
    Written,
    AlreadyPresent,
}

struct WriteRequest {
    chunk: EncodedChunk,
    reply: oneshot::Sender<std::result::Result<Stored, String>>,
}

#[derive(Default)]
struct WriterStats {
    chunks_written: u64,
    bytes_stored: u64,
}

/// Result of chunking one file.
struct StoredFile {
    chunks: Vec<ChunkID>,
    content_hash: ChunkID,
    size: u64,
    chunks_written: u64,
    chunks_deduplicated: u64,
}

/// State shared by every file job of a run.
struct JobContext {
    source: Arc<dyn TreeSource>,
    codec: ChunkCodec,
    chunker: Chunker,
    index: Arc<DedupIndex>,
    writer: mpsc::Sender<WriteRequest>,
    cancel: CancelHandle,
    /// Set after a fatal error so in-flight jobs stop early.
    halted: AtomicBool,
}

impl JobContext {
    fn check(&self) -> Result<()> {
        self.cancel.check()?;
        if self.halted.load(Ordering::SeqCst) {
            return Err(Error::BackupIo("run aborted".to_string()));
        }
        Ok(())
    }
}

pub struct BackupController<'a> {
    archive: &'a Archive,
    options: BackupOptions,
    cancel: CancelHandle,
    progress: Option<ProgressFn>,
}

impl<'a> BackupController<'a> {
    pub fn new(archive: &'a Archive, options: BackupOptions) -> Self {
        Self {
            archive,
            options,
            cancel: CancelHandle::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs one backup of `source` and writes its manifest.
    ///
    /// Per-file failures are recorded in the manifest and the summary.
    /// A volume write failure aborts with `Error::BackupIo` and cancellation
    /// with `Error::Cancelled`; in both cases no manifest is written.
    pub async fn run(&self, source: Arc<dyn TreeSource>) -> Result<BackupSummary> {
        let started = Instant::now();
        let archive = self.archive;

        let chain = archive.load_chain().await?;
        let prior_tree = chain.tree_at(None)?;
        let previous = chain.highest_sequence();
        let increment = previous.map_or(1, |p| p + 1);
        info!(
            "Starting increment {} of {} (previous: {:?})",
            increment,
            source.describe(),
            previous
        );

        let (index, unusable) = archive.build_index().await?;
        for volume in &unusable {
            warn!("Volume {} is unusable, its chunks will be stored again: {}", volume.volume, volume.reason);
        }
        let index = Arc::new(index);

        let scan = {
            let source = Arc::clone(&source);
            tokio::task::spawn_blocking(move || source.scan())
                .await
                .map_err(|e| Error::Other(format!("scan task failed: {e}")))??
        };
        report(&self.progress, Progress::Planned { entries: scan.entries.len() });

        let mut builder = ManifestBuilder::new(
            increment,
            previous,
            archive.config().id.clone(),
            archive.encryption_params(),
        )
        .with_source(source.describe());
        for failure in &scan.failures {
            warn!("Cannot read {}: {}", failure.path, failure.reason);
            builder.add_failed(&failure.path, &failure.reason);
            report(&self.progress, Progress::FileFailed { path: failure.path.clone() });
        }

        let config = archive.config();
        let volumes = VolumeSet::new(
            archive.volumes_dir(),
            increment,
            archive.next_volume_sequence(increment).await?,
            config.volume_size,
            config.cipher,
            config.compression,
            archive.salt(),
        );
        let (tx, rx) = mpsc::channel(self.options.queue_depth.max(1));
        let abandon = Arc::new(AtomicBool::new(false));
        let writer = {
            let index = Arc::clone(&index);
            let abandon = Arc::clone(&abandon);
            tokio::task::spawn_blocking(move || write_chunks(volumes, rx, &index, &abandon))
        };

        let ctx = Arc::new(JobContext {
            source,
            codec: archive.codec()?,
            chunker: archive.chunker()?,
            index: Arc::clone(&index),
            writer: tx,
            cancel: self.cancel.clone(),
            halted: AtomicBool::new(false),
        });

        let mut summary = BackupSummary {
            increment,
            previous,
            ..BackupSummary::default()
        };
        let dispatched = self
            .dispatch(&ctx, scan.entries, &prior_tree, &mut builder, &mut summary)
            .await;
        drop(ctx);

        let failure = match dispatched {
            Ok(()) => self.cancel.check().err(),
            Err(e) => Some(e),
        };
        if failure.is_some() {
            abandon.store(true, Ordering::SeqCst);
        }

        let written = writer
            .await
            .map_err(|e| Error::BackupIo(format!("volume writer failed: {e}")))?;
        if let Some(e) = failure {
            warn!("Increment {} aborted, no manifest written: {}", increment, e);
            return Err(e);
        }
        let (finalized, stats) = written?;

        for volume in &finalized {
            builder.add_volume(volume.id);
            summary.volumes.push(volume.id);
        }
        summary.chunks_written = stats.chunks_written;
        summary.bytes_stored = stats.bytes_stored;

        let mut manifest = builder.build(&prior_tree);
        summary.deleted = manifest.tombstones().count();
        summary.failed = manifest.failed.clone();
        archive
            .save_manifest(&mut manifest)
            .await
            .map_err(|e| Error::BackupIo(format!("failed to write manifest: {e}")))?;

        summary.duration_secs = started.elapsed().as_secs_f64();
        info!(
            "Increment {} complete: {} new, {} changed, {} unchanged, {} deleted, {} failed, {} chunks written",
            increment,
            summary.files_new,
            summary.files_changed,
            summary.files_unchanged,
            summary.deleted,
            summary.failed.len(),
            summary.chunks_written
        );
        Ok(summary)
    }

    /// Classifies every entry and runs file jobs. Returns early on
    /// cancellation or on the first error that is fatal to the run.
    async fn dispatch(
        &self,
        ctx: &Arc<JobContext>,
        entries: Vec<SourceEntry>,
        prior_tree: &LogicalTree,
        builder: &mut ManifestBuilder,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let policy = self.options.change_detection;
        let semaphore = Arc::new(Semaphore::new(self.options.threads.max(1)));
        let mut jobs: JoinSet<(SourceEntry, Result<StoredFile>)> = JoinSet::new();
        let mut outcome = Ok(());

        'entries: for entry in entries {
            while let Some(joined) = jobs.try_join_next() {
                if let Err(e) = self.absorb(joined, policy, prior_tree, builder, summary) {
                    ctx.halted.store(true, Ordering::SeqCst);
                    outcome = Err(e);
                    break 'entries;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let prior = prior_tree.get(&entry.path);
            let resolvable = prior.is_some_and(|p| p.chunks.iter().all(|c| ctx.index.contains(c)));
            if !policy.needs_content(prior, &entry) && (resolvable || entry.kind != EntryKind::File) {
                let change = policy.classify(prior, &entry, None);
                self.record(builder, summary, prior, &entry, change, None);
                continue;
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    outcome = Err(Error::Other(format!("worker pool closed: {e}")));
                    break;
                }
            };
            let ctx = Arc::clone(ctx);
            jobs.spawn_blocking(move || {
                let _permit = permit;
                let result = store_file(&ctx, &entry);
                (entry, result)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = self.absorb(joined, policy, prior_tree, builder, summary) {
                ctx.halted.store(true, Ordering::SeqCst);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    fn absorb(
        &self,
        joined: std::result::Result<(SourceEntry, Result<StoredFile>), tokio::task::JoinError>,
        policy: ChangeDetection,
        prior_tree: &LogicalTree,
        builder: &mut ManifestBuilder,
        summary: &mut BackupSummary,
    ) -> Result<()> {
        let (entry, result) =
            joined.map_err(|e| Error::BackupIo(format!("file job failed: {e}")))?;
        match result {
            Ok(stored) => {
                summary.bytes_read += stored.size;
                summary.chunks_deduplicated += stored.chunks_deduplicated;
                let mut current = entry;
                current.size = stored.size;
                let prior = prior_tree.get(&current.path);
                let change = policy.classify(prior, &current, Some(&stored.content_hash));
                debug!(
                    "{} {:?}: {} chunks, {} new",
                    current.path,
                    change,
                    stored.chunks.len(),
                    stored.chunks_written
                );
                self.record(builder, summary, prior, &current, change, Some(stored));
                Ok(())
            }
            Err(e) if e.is_fatal_to_run() => Err(e),
            Err(e) => {
                warn!("Failed to back up {}: {}", entry.path, e);
                builder.add_failed(&entry.path, e.to_string());
                report(&self.progress, Progress::FileFailed { path: entry.path });
                Ok(())
            }
        }
    }

    fn record(
        &self,
        builder: &mut ManifestBuilder,
        summary: &mut BackupSummary,
        prior: Option<&FileEntry>,
        current: &SourceEntry,
        change: Change,
        stored: Option<StoredFile>,
    ) {
        summary.count(current.kind, change);
        match (change, prior) {
            (Change::Unchanged, Some(prior)) => builder.reuse_entry(prior),
            (Change::MetadataChanged, Some(prior)) => {
                let (chunks, content_hash) = match stored {
                    Some(s) => (s.chunks, Some(s.content_hash)),
                    None => (prior.chunks.clone(), prior.content_hash),
                };
                builder.add_entry(entry_from_source(current, chunks, content_hash));
            }
            _ => {
                let (chunks, content_hash) = match stored {
                    Some(s) => (s.chunks, Some(s.content_hash)),
                    None => (Vec::new(), None),
                };
                builder.add_entry(entry_from_source(current, chunks, content_hash));
            }
        }
        if current.kind == EntryKind::File {
            report(
                &self.progress,
                Progress::FileDone {
                    path: current.path.clone(),
                    bytes: current.size,
                },
            );
        }
    }
}

fn entry_from_source(source: &SourceEntry, chunks: Vec<ChunkID>, content_hash: Option<ChunkID>) -> FileEntry {
    FileEntry {
        path: source.path.clone(),
        kind: source.kind,
        size: source.size,
        mtime: source.mtime,
        metadata: source.metadata.clone(),
        chunks,
        symlink_target: source.symlink_target.clone(),
        content_hash,
        origin: 0,
    }
}

/// Chunks one file, storing every chunk the index does not know yet.
fn store_file(ctx: &JobContext, entry: &SourceEntry) -> Result<StoredFile> {
    let reader = ctx.source.open(entry)?;
    let mut hasher = ctx.codec.content_hasher();
    let mut chunks = Vec::new();
    let mut size = 0u64;
    let mut chunks_written = 0;
    let mut chunks_deduplicated = 0;

    for chunk in ctx.chunker.chunk_reader(reader) {
        ctx.check()?;
        let chunk = chunk?;
        hasher.update(chunk.data());
        size += chunk.len() as u64;

        let id = ctx.codec.chunk_id(chunk.data());
        if ctx.index.contains(&id) {
            chunks_deduplicated += 1;
        } else {
            let encoded = ctx.codec.encode_with_id(id, chunk.data())?;
            match send_to_writer(&ctx.writer, encoded)? {
                Stored::Written => chunks_written += 1,
                Stored::AlreadyPresent => chunks_deduplicated += 1,
            }
        }
        chunks.push(id);
    }

    if size != entry.size {
        debug!(
            "{} changed size while being read ({} -> {} bytes)",
            entry.path, entry.size, size
        );
    }
    Ok(StoredFile {
        chunks,
        content_hash: ChunkID::new(hasher.finalize()),
        size,
        chunks_written,
        chunks_deduplicated,
    })
}

fn send_to_writer(writer: &mpsc::Sender<WriteRequest>, chunk: EncodedChunk) -> Result<Stored> {
    let stopped = || Error::BackupIo("volume writer stopped".to_string());
    let (reply, response) = oneshot::channel();
    writer
        .blocking_send(WriteRequest { chunk, reply })
        .map_err(|_| stopped())?;
    match response.blocking_recv() {
        Ok(Ok(stored)) => Ok(stored),
        Ok(Err(reason)) => Err(Error::BackupIo(reason)),
        Err(_) => Err(stopped()),
    }
}

/// Single owner of the run's volume set. Appends each requested chunk,
/// records it in the index, then acknowledges. Any I/O failure stops the
/// writer and leaves the open volume unfinalized.
fn write_chunks(
    mut volumes: VolumeSet,
    mut rx: mpsc::Receiver<WriteRequest>,
    index: &DedupIndex,
    abandon: &AtomicBool,
) -> Result<(Vec<FinalizedVolume>, WriterStats)> {
    let mut stats = WriterStats::default();
    while let Some(request) = rx.blocking_recv() {
        let id = request.chunk.id;
        if index.contains(&id) {
            let _ = request.reply.send(Ok(Stored::AlreadyPresent));
            continue;
        }
        match volumes.append(&request.chunk) {
            Ok(location) => {
                index.record(id, location);
                stats.chunks_written += 1;
                stats.bytes_stored += u64::from(location.length);
                let _ = request.reply.send(Ok(Stored::Written));
            }
            Err(e) => {
                let reason = format!("failed to append chunk {}: {}", id.short_string(), e);
                let _ = request.reply.send(Err(reason.clone()));
                return Err(Error::BackupIo(reason));
            }
        }
    }

    if abandon.load(Ordering::SeqCst) {
        debug!("Abandoning open volume of cancelled run");
        return Ok((volumes.finalized().to_vec(), stats));
    }
    let finalized = volumes
        .finish()
        .map_err(|e| Error::BackupIo(format!("failed to finalize volume: {e}")))?;
    for volume in &finalized {
        index.add_finalized(volume);
    }
    Ok((finalized, stats))
}
