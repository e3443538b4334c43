//! Integrity verifier.
//!
//! Reads every finalized volume, decodes every chunk and recomputes its
//! identity, then checks that every chunk referenced by any manifest is
//! stored in a usable volume. The archive is never modified and the report
//! is ordered so repeated runs over the same archive compare equal.

use crate::archive::Archive;
use crate::{ChunkID, Error, Result, VolumeId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct VolumeProblem {
    pub volume: VolumeId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ChunkProblem {
    pub volume: VolumeId,
    pub chunk: ChunkID,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct UnresolvedReference {
    pub increment: u32,
    pub path: String,
    pub chunk: ChunkID,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ManifestProblem {
    pub increment: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub manifests_checked: usize,
    pub volumes_checked: usize,
    pub chunks_checked: u64,
    pub references_checked: u64,
    /// Stored but referenced by no manifest. Informational.
    pub orphaned_chunks: Vec<ChunkID>,
    /// Referenced chunks stored nowhere usable. Chunks that are present
    /// but fail to decode are listed in `corrupt_chunks` instead.
    pub unresolved_references: Vec<UnresolvedReference>,
    pub corrupt_volumes: Vec<VolumeProblem>,
    pub corrupt_chunks: Vec<ChunkProblem>,
    pub broken_manifests: Vec<ManifestProblem>,
}

impl VerifyReport {
    /// True when nothing but orphaned chunks was found.
    pub fn is_clean(&self) -> bool {
        self.unresolved_references.is_empty()
            && self.corrupt_volumes.is_empty()
            && self.corrupt_chunks.is_empty()
            && self.broken_manifests.is_empty()
    }
}

pub struct Verifier<'a> {
    archive: &'a Archive,
}

impl<'a> Verifier<'a> {
    pub fn new(archive: &'a Archive) -> Self {
        Self { archive }
    }

    pub async fn run(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        let chain = self.archive.load_chain().await?;
        for (&increment, reason) in chain.broken() {
            report.broken_manifests.push(ManifestProblem {
                increment,
                reason: reason.clone(),
            });
        }
        for manifest in chain.iter() {
            if let Err(e) = chain.resolve(Some(manifest.sequence)) {
                report.broken_manifests.push(ManifestProblem {
                    increment: manifest.sequence,
                    reason: e.to_string(),
                });
            }
        }
        report.manifests_checked = chain.len() + chain.broken().len();

        let volumes = self.archive.list_volumes().await?;
        let opener = self.archive.volume_opener();
        let codec = self.archive.codec()?;
        let scanned = tokio::task::spawn_blocking(move || {
            let mut stored: BTreeSet<ChunkID> = BTreeSet::new();
            let mut damaged: BTreeSet<ChunkID> = BTreeSet::new();
            let mut corrupt_volumes = Vec::new();
            let mut corrupt_chunks = Vec::new();
            let mut chunks_checked = 0u64;

            for id in &volumes {
                let reader = match opener.open(*id) {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!("Volume {} failed validation: {}", id, e);
                        corrupt_volumes.push(VolumeProblem {
                            volume: *id,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                for entry in reader.entries() {
                    let chunk = entry.chunk_id();
                    chunks_checked += 1;
                    let decoded = reader
                        .read_chunk(entry.offset, entry.length)
                        .and_then(|record| codec.decode(&record.data, &record.iv, &chunk));
                    match decoded {
                        Ok(plaintext) if plaintext.len() as u64 == u64::from(entry.plaintext_length) => {
                            stored.insert(chunk);
                        }
                        Ok(plaintext) => {
                            damaged.insert(chunk);
                            corrupt_chunks.push(ChunkProblem {
                                volume: *id,
                                chunk,
                                reason: format!(
                                    "decoded {} bytes, footer records {}",
                                    plaintext.len(),
                                    entry.plaintext_length
                                ),
                            });
                        }
                        Err(e) => {
                            warn!("Chunk {} in {} is corrupt: {}", chunk.short_string(), id, e);
                            damaged.insert(chunk);
                            corrupt_chunks.push(ChunkProblem {
                                volume: *id,
                                chunk,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                debug!("Verified volume {} ({} chunks)", id, reader.entries().len());
            }
            (volumes.len(), stored, damaged, corrupt_volumes, corrupt_chunks, chunks_checked)
        })
        .await
        .map_err(|e| Error::Other(format!("verify task failed: {e}")))?;

        let (volumes_checked, stored, damaged, corrupt_volumes, corrupt_chunks, chunks_checked) = scanned;
        report.volumes_checked = volumes_checked;
        report.chunks_checked = chunks_checked;
        report.corrupt_volumes = corrupt_volumes;
        report.corrupt_chunks = corrupt_chunks;

        // first referencing (increment, path) per missing chunk keeps the report compact
        let mut referenced: BTreeSet<ChunkID> = BTreeSet::new();
        let mut unresolved: BTreeMap<ChunkID, UnresolvedReference> = BTreeMap::new();
        for manifest in chain.iter() {
            for entry in manifest.live_entries() {
                for chunk in &entry.chunks {
                    report.references_checked += 1;
                    referenced.insert(*chunk);
                    if !stored.contains(chunk) && !damaged.contains(chunk) {
                        unresolved.entry(*chunk).or_insert_with(|| UnresolvedReference {
                            increment: manifest.sequence,
                            path: entry.path.clone(),
                            chunk: *chunk,
                        });
                    }
                }
            }
        }

        report.orphaned_chunks = stored.difference(&referenced).copied().collect();
        report.unresolved_references = unresolved.into_values().collect();
        report.unresolved_references.sort();
        report.corrupt_volumes.sort();
        report.corrupt_chunks.sort();
        report.broken_manifests.sort();
        report.broken_manifests.dedup();

        info!(
            "Verified {} volumes, {} chunks, {} references: {} orphaned, {} unresolved, {} corrupt chunks, {} corrupt volumes",
            report.volumes_checked,
            report.chunks_checked,
            report.references_checked,
            report.orphaned_chunks.len(),
            report.unresolved_references.len(),
            report.corrupt_chunks.len(),
            report.corrupt_volumes.len()
        );
        Ok(report)
    }
}
