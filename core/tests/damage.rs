mod common;

use cairn_core::{ChunkID, Error, Verifier};
use common::{backup, files, new_archive, noise, restore, write};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use tempfile::TempDir;

#[tokio::test]
async fn verify_is_clean_and_repeatable() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    for i in 0..6u64 {
        write(&src, &format!("dir{}/file{}.bin", i % 2, i), &noise(i, 3000));
    }
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;
    write(&src, "dir0/late.bin", &noise(99, 5000));
    backup(&archive, &src).await;

    let first = Verifier::new(&archive).run().await.unwrap();
    let second = Verifier::new(&archive).run().await.unwrap();
    assert!(first.is_clean(), "{first:?}");
    assert!(first.orphaned_chunks.is_empty());
    assert_eq!(first.manifests_checked, 2);
    assert!(first.volumes_checked > 1);
    assert!(first.chunks_checked > 0);
    assert_eq!(first, second);
}

#[tokio::test]
async fn truncated_volume_fails_only_the_files_that_need_it() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let mut expected = BTreeMap::new();
    for i in 0..8u64 {
        let rel = format!("file{i}.bin");
        let content = noise(i + 1, 6000);
        write(&src, &rel, &content);
        expected.insert(rel, content);
    }
    let archive = new_archive(&dir.path().join("archive")).await;
    let summary = backup(&archive, &src).await;
    assert!(summary.volumes.len() >= 3, "{:?}", summary.volumes);

    let victim = summary.volumes[0];
    let stored: BTreeSet<ChunkID> = archive
        .open_volume(victim)
        .unwrap()
        .entries()
        .iter()
        .map(|e| e.chunk_id())
        .collect();
    let manifest = archive.load_manifest(1).await.unwrap();
    let affected: BTreeSet<String> = manifest
        .live_entries()
        .filter(|e| e.chunks.iter().any(|c| stored.contains(c)))
        .map(|e| e.path.clone())
        .collect();
    assert!(!affected.is_empty());
    assert!(affected.len() < expected.len());

    let path = archive.volume_path(victim);
    let len = fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 16)
        .unwrap();

    let target = dir.path().join("restored");
    let result = restore(&archive, &target, None).await;
    let failed: BTreeSet<String> = result.failed.iter().map(|f| f.path.clone()).collect();
    assert_eq!(failed, affected);
    assert!(result.failed.iter().all(|f| f.reason.contains(&f.path)));

    let restored = files(&target);
    for (path, content) in &expected {
        if affected.contains(path) {
            assert!(!restored.contains_key(path), "{path} should not be restored");
        } else {
            assert_eq!(&restored[path], content, "{path}");
        }
    }
    // no partial files are left behind
    assert!(restored.keys().all(|p| !p.ends_with(".cairn-part")));

    let report = Verifier::new(&archive).run().await.unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.corrupt_volumes.len(), 1);
    assert_eq!(report.corrupt_volumes[0].volume, victim);
    let unresolved: BTreeSet<ChunkID> = report.unresolved_references.iter().map(|r| r.chunk).collect();
    assert_eq!(unresolved, stored);
    assert_eq!(report, Verifier::new(&archive).run().await.unwrap());
}

#[tokio::test]
async fn backup_after_damage_stores_lost_chunks_again() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "only.bin", &noise(7, 4000));
    let archive = new_archive(&dir.path().join("archive")).await;
    let first = backup(&archive, &src).await;
    let written = first.chunks_written;

    for volume in &first.volumes {
        fs::write(archive.volume_path(*volume), b"garbage").unwrap();
    }
    // unchanged by size and mtime, but its chunks are gone
    let second = backup(&archive, &src).await;
    assert_eq!(second.chunks_written, written);

    let target = dir.path().join("restored");
    let result = restore(&archive, &target, None).await;
    assert!(!result.is_partial(), "{:?}", result.failed);
    assert_eq!(fs::read(target.join("only.bin")).unwrap(), noise(7, 4000));
}

#[tokio::test]
async fn tampered_manifest_is_reported_and_blocks_latest_restore() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "a", b"alpha");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;
    write(&src, "b", b"beta");
    backup(&archive, &src).await;

    let path = archive
        .manifests_dir()
        .join(cairn_core::Manifest::file_name(2));
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let report = Verifier::new(&archive).run().await.unwrap();
    assert_eq!(report.broken_manifests.len(), 1);
    assert_eq!(report.broken_manifests[0].increment, 2);

    let latest = cairn_core::RestoreEngine::new(&archive, Default::default())
        .run(&dir.path().join("latest"))
        .await;
    assert!(matches!(latest, Err(Error::ManifestChain(_))));

    let target = dir.path().join("first");
    let summary = restore(&archive, &target, Some(1)).await;
    assert!(!summary.is_partial());
    assert_eq!(fs::read(target.join("a")).unwrap(), b"alpha");
}
