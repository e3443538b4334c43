use crate::compress::Compression;
use crate::crypto::{CipherId, Encryptor};
use crate::tree::LogicalTree;
use crate::{Error, FileEntry, Result, VolumeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;
pub const MANIFEST_EXTENSION: &str = "manifest";

const CHECKSUM_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub cipher: CipherId,
    pub compression: Compression,
}

/// A path that could not be captured during a run. The previous version of
/// the path, if any, stays in effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub path: String,
    pub reason: String,
}

/// Durable record of one increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub sequence: u32,
    pub previous: Option<u32>,
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub source: String,
    pub encryption: EncryptionParams,
    /// Every entry valid as of this increment plus tombstones for paths
    /// that disappeared in it, sorted by path.
    pub entries: Vec<FileEntry>,
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
    /// Volumes written by this increment.
    #[serde(default)]
    pub volumes: Vec<VolumeId>,
    /// Hex checksum of the serialized body, filled in by `to_bytes` and `parse`.
    #[serde(skip)]
    pub checksum: Option<String>,
}

impl Manifest {
    pub fn file_name(sequence: u32) -> String {
        format!("{:08}.{}", sequence, MANIFEST_EXTENSION)
    }

    pub fn sequence_from_file_name(name: &str) -> Option<u32> {
        name.strip_suffix(".manifest")?.parse().ok()
    }

    pub fn is_full(&self) -> bool {
        self.previous.is_none()
    }

    pub fn entry(&self, path: &str) -> Option<&FileEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| !e.is_tombstone())
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter().filter(|e| e.is_tombstone())
    }

    /// Entries whose content was written by this increment.
    pub fn new_entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.live_entries().filter(move |e| e.origin == self.sequence)
    }

    pub fn total_size(&self) -> u64 {
        self.live_entries().map(|e| e.size).sum()
    }

    pub fn short_id(&self) -> String {
        format!("#{}", self.sequence)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} entries ({} deleted, {} failed) from {} on {} at {}",
            self.short_id(),
            self.live_entries().count(),
            self.tombstones().count(),
            self.failed.len(),
            self.source,
            self.hostname,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Serializes, checksums and encrypts the manifest.
    pub fn to_bytes(&mut self, encryptor: &Encryptor) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let checksum = blake3::hash(&body);
        let mut plain = Vec::with_capacity(CHECKSUM_LEN + body.len());
        plain.extend_from_slice(checksum.as_bytes());
        plain.extend_from_slice(&body);
        self.checksum = Some(checksum.to_hex().to_string());
        encryptor.encrypt(&plain)
    }

    /// Decrypts and validates a manifest file.
    pub fn parse(data: &[u8], encryptor: &Encryptor) -> Result<Self> {
        let plain = encryptor
            .decrypt(data)
            .map_err(|_| Error::ManifestChain("manifest failed authentication".to_string()))?;
        if plain.len() < CHECKSUM_LEN {
            return Err(Error::ManifestParse("manifest too short".to_string()));
        }
        let (stored, body) = plain.split_at(CHECKSUM_LEN);
        let actual = blake3::hash(body);
        if actual.as_bytes() != stored {
            return Err(Error::ManifestChain(
                "manifest checksum does not match its contents".to_string(),
            ));
        }

        let mut manifest: Manifest =
            serde_json::from_slice(body).map_err(|e| Error::ManifestParse(e.to_string()))?;
        if manifest.version != MANIFEST_FORMAT_VERSION {
            return Err(Error::ManifestParse(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        if let Some(previous) = manifest.previous {
            if previous >= manifest.sequence {
                return Err(Error::ManifestChain(format!(
                    "manifest {} points forward to {}",
                    manifest.sequence, previous
                )));
            }
        }
        manifest.checksum = Some(actual.to_hex().to_string());
        Ok(manifest)
    }
}

/// Assembles the manifest of one increment from classified entries.
pub struct ManifestBuilder {
    sequence: u32,
    previous: Option<u32>,
    archive_id: String,
    source: String,
    encryption: EncryptionParams,
    entries: BTreeMap<String, FileEntry>,
    failed: BTreeMap<String, String>,
    volumes: BTreeSet<VolumeId>,
}

impl ManifestBuilder {
    pub fn new(
        sequence: u32,
        previous: Option<u32>,
        archive_id: impl Into<String>,
        encryption: EncryptionParams,
    ) -> Self {
        Self {
            sequence,
            previous,
            archive_id: archive_id.into(),
            source: String::new(),
            encryption,
            entries: BTreeMap::new(),
            failed: BTreeMap::new(),
            volumes: BTreeSet::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Adds an entry whose content was captured in this increment.
    pub fn add_entry(&mut self, mut entry: FileEntry) {
        entry.origin = self.sequence;
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Carries a prior entry over unchanged, chunk references included.
    pub fn reuse_entry(&mut self, prior: &FileEntry) {
        self.entries.insert(prior.path.clone(), prior.clone());
    }

    /// Records a path that could not be read. Prior entries at or below it
    /// are kept rather than tombstoned.
    pub fn add_failed(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.failed.insert(path.into(), reason.into());
    }

    pub fn add_volume(&mut self, volume: VolumeId) {
        self.volumes.insert(volume);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn covered_by_failure(&self, path: &str) -> bool {
        if self.failed.contains_key(path) {
            return true;
        }
        path.match_indices('/')
            .any(|(i, _)| self.failed.contains_key(&path[..i]))
    }

    /// Seals the manifest. Paths present in `prior` that were neither seen
    /// nor covered by a failure in this run become tombstones.
    pub fn build(mut self, prior: &LogicalTree) -> Manifest {
        for path in prior.paths() {
            if !self.entries.contains_key(path) && !self.covered_by_failure(path) {
                self.entries
                    .insert(path.to_string(), FileEntry::tombstone(path, self.sequence));
            }
        }

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Manifest {
            version: MANIFEST_FORMAT_VERSION,
            sequence: self.sequence,
            previous: self.previous,
            archive_id: self.archive_id,
            created_at: Utc::now(),
            hostname,
            source: self.source,
            encryption: self.encryption,
            entries: self.entries.into_values().collect(),
            failed: self
                .failed
                .into_iter()
                .map(|(path, reason)| FailedEntry { path, reason })
                .collect(),
            volumes: self.volumes.into_iter().collect(),
            checksum: None,
        }
    }
}
