#![allow(dead_code)]

use cairn_core::chunker::ChunkerLimits;
use cairn_core::metadata::NoopMetadata;
use cairn_core::{
    Archive, ArchiveSettings, BackupController, BackupOptions, BackupSummary, ChangeDetection,
    KdfParams, LocalTreeSource, RestoreEngine, RestoreOptions, RestoreSummary,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

pub const PASSWORD: &str = "correct horse battery staple";

pub fn fast_settings() -> ArchiveSettings {
    ArchiveSettings {
        chunker: ChunkerLimits {
            min_size: 64,
            avg_size: 256,
            max_size: 1024,
        },
        volume_size: 16 * 1024,
        kdf_params: KdfParams {
            iterations: 1,
            memory: 1024,
            parallelism: 1,
            ..KdfParams::default()
        },
        ..ArchiveSettings::default()
    }
}

pub async fn new_archive(dir: &Path) -> Archive {
    Archive::init(dir, PASSWORD, fast_settings()).await.unwrap()
}

pub fn options(change_detection: ChangeDetection) -> BackupOptions {
    BackupOptions {
        threads: 4,
        queue_depth: 4,
        change_detection,
    }
}

pub fn source(root: &Path) -> Arc<LocalTreeSource> {
    Arc::new(LocalTreeSource::new(root, cairn_core::metadata::detect()))
}

pub async fn backup(archive: &Archive, root: &Path) -> BackupSummary {
    BackupController::new(archive, options(ChangeDetection::Simple))
        .run(source(root))
        .await
        .unwrap()
}

pub async fn restore(archive: &Archive, target: &Path, increment: Option<u32>) -> RestoreSummary {
    let options = RestoreOptions {
        increment,
        threads: 4,
        ..RestoreOptions::default()
    };
    RestoreEngine::new(archive, options)
        .with_metadata(Arc::new(NoopMetadata))
        .run(target)
        .await
        .unwrap()
}

pub fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Deterministic pseudo-random bytes.
pub fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Relative path -> content of every regular file below `root`.
pub fn files(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}
