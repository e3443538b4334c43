mod common;

use cairn_core::source::{Scan, SourceEntry};
use cairn_core::{BackupController, ChangeDetection, Error, LocalTreeSource, Result, TreeSource};
use common::{backup, files, new_archive, options, restore, source, write};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn set_mtime(path: &Path, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

/// Rewrites `rel` with same-sized content and puts its mtime back.
fn rewrite_in_place(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    let mtime = fs::metadata(&path).unwrap().modified().unwrap();
    fs::write(&path, content).unwrap();
    set_mtime(&path, mtime);
}

#[tokio::test]
async fn simple_policy_trusts_size_and_mtime() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "data.bin", b"original");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    rewrite_in_place(&src, "data.bin", b"replaced");
    let second = backup(&archive, &src).await;
    assert_eq!(second.files_unchanged, 1);
    assert_eq!(second.bytes_read, 0);
    assert_eq!(second.chunks_written, 0);
}

#[tokio::test]
async fn hashing_policy_detects_same_size_rewrites() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "data.bin", b"original");
    write(&src, "other.bin", b"untouched");
    let archive = new_archive(&dir.path().join("archive")).await;
    BackupController::new(&archive, options(ChangeDetection::Hashing))
        .run(source(&src))
        .await
        .unwrap();

    rewrite_in_place(&src, "data.bin", b"replaced");
    let second = BackupController::new(&archive, options(ChangeDetection::Hashing))
        .run(source(&src))
        .await
        .unwrap();
    assert_eq!(second.files_changed, 1);
    assert_eq!(second.files_unchanged, 1);
    assert_eq!(second.chunks_written, 1);

    let first = archive.load_manifest(1).await.unwrap();
    let manifest = archive.load_manifest(2).await.unwrap();
    assert_eq!(manifest.entry("other.bin"), first.entry("other.bin"));
    assert_ne!(
        manifest.entry("data.bin").unwrap().content_hash,
        first.entry("data.bin").unwrap().content_hash
    );

    let target = dir.path().join("restored");
    restore(&archive, &target, None).await;
    assert_eq!(fs::read(target.join("data.bin")).unwrap(), b"replaced");
}

#[tokio::test]
async fn touched_file_is_recorded_without_new_chunks() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "notes.txt", b"some notes");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    let later = fs::metadata(src.join("notes.txt")).unwrap().modified().unwrap() + Duration::from_secs(3600);
    set_mtime(&src.join("notes.txt"), later);
    let second = backup(&archive, &src).await;
    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.files_metadata_changed, 1);

    let first = archive.load_manifest(1).await.unwrap();
    let manifest = archive.load_manifest(2).await.unwrap();
    let before = first.entry("notes.txt").unwrap();
    let after = manifest.entry("notes.txt").unwrap();
    assert_eq!(after.chunks, before.chunks);
    assert_eq!(after.mtime, before.mtime + 3600);
    assert_eq!(after.origin, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn permission_change_is_metadata_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "script.sh", b"#!/bin/sh\necho hi\n");
    fs::set_permissions(src.join("script.sh"), fs::Permissions::from_mode(0o644)).unwrap();
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    fs::set_permissions(src.join("script.sh"), fs::Permissions::from_mode(0o755)).unwrap();
    let second = backup(&archive, &src).await;
    assert_eq!(second.files_metadata_changed, 1);
    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.bytes_read, 0);

    let first = archive.load_manifest(1).await.unwrap();
    let manifest = archive.load_manifest(2).await.unwrap();
    assert_ne!(manifest.entry("script.sh").unwrap().metadata, first.entry("script.sh").unwrap().metadata);
    assert_eq!(manifest.entry("script.sh").unwrap().chunks, first.entry("script.sh").unwrap().chunks);
}

/// Local source whose `open` fails for one path.
struct FlakySource {
    inner: LocalTreeSource,
    broken: String,
}

impl TreeSource for FlakySource {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn scan(&self) -> Result<Scan> {
        self.inner.scan()
    }

    fn open(&self, entry: &SourceEntry) -> Result<Box<dyn Read + Send>> {
        if entry.path == self.broken {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "locked by another process",
            )));
        }
        self.inner.open(entry)
    }
}

#[tokio::test]
async fn unreadable_file_keeps_its_prior_version() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "db/journal", b"version one");
    write(&src, "readme", b"read me");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    write(&src, "db/journal", b"version two, longer");
    write(&src, "readme", b"read me again");
    let flaky = Arc::new(FlakySource {
        inner: LocalTreeSource::new(&src, cairn_core::metadata::detect()),
        broken: "db/journal".to_string(),
    });
    let second = BackupController::new(&archive, options(ChangeDetection::Simple))
        .run(flaky)
        .await
        .unwrap();
    assert!(second.is_partial());
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].path, "db/journal");
    assert_eq!(second.deleted, 0);

    let manifest = archive.load_manifest(2).await.unwrap();
    assert!(manifest.entry("db/journal").is_none());
    assert_eq!(manifest.tombstones().count(), 0);

    let target = dir.path().join("restored");
    restore(&archive, &target, None).await;
    let restored = files(&target);
    assert_eq!(restored["db/journal"], b"version one");
    assert_eq!(restored["readme"], b"read me again");

    // the next clean run picks up the current content
    backup(&archive, &src).await;
    let target = dir.path().join("restored-3");
    restore(&archive, &target, None).await;
    assert_eq!(fs::read(target.join("db/journal")).unwrap(), b"version two, longer");
}
