mod common;

use cairn_core::{
    Archive, BackupController, CancelHandle, ChangeDetection, Error, Progress, RestoreEngine,
    RestoreOptions,
};
use cairn_core::metadata::NoopMetadata;
use common::{backup, files, new_archive, noise, options, restore, source, write};
use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[tokio::test]
async fn duplicate_content_is_stored_once_across_runs_and_paths() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let payload = noise(42, 20_000);
    write(&src, "original/big.bin", &payload);
    let archive = new_archive(&dir.path().join("archive")).await;
    let first = backup(&archive, &src).await;
    assert!(first.chunks_written > 1);

    write(&src, "copies/one.bin", &payload);
    write(&src, "copies/deeper/two.bin", &payload);
    let second = backup(&archive, &src).await;
    assert_eq!(second.files_new, 2);
    assert_eq!(second.chunks_written, 0);
    assert!(second.volumes.is_empty());
    assert_eq!(second.chunks_deduplicated, 2 * first.chunks_written);

    let manifest = archive.load_manifest(2).await.unwrap();
    let original = &manifest.entry("original/big.bin").unwrap().chunks;
    assert_eq!(&manifest.entry("copies/one.bin").unwrap().chunks, original);
    assert_eq!(&manifest.entry("copies/deeper/two.bin").unwrap().chunks, original);

    let target = dir.path().join("restored");
    restore(&archive, &target, None).await;
    let restored = files(&target);
    assert_eq!(restored.len(), 3);
    assert!(restored.values().all(|c| c == &payload));
}

#[tokio::test]
async fn cancelled_backup_writes_no_manifest() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "a.txt", b"alpha");
    let archive = new_archive(&dir.path().join("archive")).await;

    let cancel = CancelHandle::new();
    cancel.cancel();
    let result = BackupController::new(&archive, options(ChangeDetection::Simple))
        .with_cancel(cancel)
        .run(source(&src))
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(archive.list_manifests().await.unwrap().is_empty());

    let summary = backup(&archive, &src).await;
    assert_eq!(summary.increment, 1);
}

#[tokio::test]
async fn backup_cancelled_midway_leaves_archive_usable() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    for i in 0..40u64 {
        write(&src, &format!("f{i:02}.bin"), &noise(i, 2000));
    }
    let archive = new_archive(&dir.path().join("archive")).await;

    let controller = BackupController::new(
        &archive,
        cairn_core::BackupOptions {
            threads: 1,
            ..options(ChangeDetection::Simple)
        },
    );
    let cancel = controller.cancel_handle();
    let controller = controller.with_progress(Arc::new(move |event: Progress| {
        if matches!(event, Progress::FileDone { .. }) {
            cancel.cancel();
        }
    }));
    let result = controller.run(source(&src)).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(archive.list_manifests().await.unwrap().is_empty());

    let summary = backup(&archive, &src).await;
    assert_eq!(summary.increment, 1);
    assert_eq!(summary.files_new, 40);
    let report = cairn_core::Verifier::new(&archive).run().await.unwrap();
    assert!(report.is_clean(), "{report:?}");

    let target = dir.path().join("restored");
    restore(&archive, &target, None).await;
    assert_eq!(files(&target), files(&src));
}

#[tokio::test]
async fn restore_filter_and_dry_run() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "docs/a.txt", b"aaaa");
    write(&src, "docs/sub/b.txt", b"bb");
    write(&src, "docsmore/c.txt", b"c");
    write(&src, "top.txt", b"top");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    let target = dir.path().join("restored");
    let dry = RestoreEngine::new(
        &archive,
        RestoreOptions {
            paths: vec!["docs".to_string()],
            dry_run: true,
            ..RestoreOptions::default()
        },
    )
    .run(&target)
    .await
    .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.files, 2);
    assert_eq!(dry.directories, 2);
    assert_eq!(dry.bytes, 6);
    assert!(!target.exists());

    let real = RestoreEngine::new(
        &archive,
        RestoreOptions {
            paths: vec!["docs".to_string()],
            ..RestoreOptions::default()
        },
    )
    .run(&target)
    .await
    .unwrap();
    assert_eq!(real.files, dry.files);
    assert_eq!(real.bytes, dry.bytes);
    assert_eq!(
        files(&target).keys().collect::<Vec<_>>(),
        vec!["docs/a.txt", "docs/sub/b.txt"]
    );
}

#[tokio::test]
async fn restore_reports_progress_for_every_file() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    for i in 0..5u64 {
        write(&src, &format!("n{i}"), &noise(i, 500));
    }
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    let done = Arc::new(AtomicUsize::new(0));
    let planned = Arc::new(Mutex::new(None));
    let progress = {
        let done = Arc::clone(&done);
        let planned = Arc::clone(&planned);
        Arc::new(move |event: Progress| match event {
            Progress::Planned { entries } => *planned.lock().unwrap() = Some(entries),
            Progress::FileDone { .. } => {
                done.fetch_add(1, Ordering::SeqCst);
            }
            Progress::FileFailed { .. } => {}
        })
    };
    RestoreEngine::new(&archive, RestoreOptions::default())
        .with_progress(progress)
        .run(&dir.path().join("restored"))
        .await
        .unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 5);
    assert_eq!(*planned.lock().unwrap(), Some(5));
}

#[tokio::test]
async fn archive_reopens_with_password_only() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "x", b"x marks the spot");
    let path = dir.path().join("archive");
    {
        let archive = new_archive(&path).await;
        backup(&archive, &src).await;
    }

    assert!(matches!(
        Archive::open(&path, "not the password").await,
        Err(Error::InvalidPassword)
    ));
    let archive = Archive::open(&path, common::PASSWORD).await.unwrap();
    let target = dir.path().join("restored");
    restore(&archive, &target, None).await;
    assert_eq!(fs::read(target.join("x")).unwrap(), b"x marks the spot");
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_are_restored_as_links() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "target.txt", b"pointed at");
    std::os::unix::fs::symlink("target.txt", src.join("link")).unwrap();
    std::os::unix::fs::symlink("/nonexistent/elsewhere", src.join("dangling")).unwrap();
    let archive = new_archive(&dir.path().join("archive")).await;
    let summary = backup(&archive, &src).await;
    assert_eq!(summary.symlinks, 2);

    let target = dir.path().join("restored");
    let restored = restore(&archive, &target, None).await;
    assert_eq!(restored.symlinks, 2);
    assert_eq!(fs::read_link(target.join("link")).unwrap(), std::path::Path::new("target.txt"));
    assert_eq!(
        fs::read_link(target.join("dangling")).unwrap(),
        std::path::Path::new("/nonexistent/elsewhere")
    );
    assert_eq!(fs::read(target.join("link")).unwrap(), b"pointed at");
}

#[tokio::test]
async fn restore_filter_on_nested_file_brings_its_directories() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "docs/deep/a.txt", b"hello");
    write(&src, "docs/deep/b.txt", b"other");
    write(&src, "docs/c.txt", b"sibling");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    let target = dir.path().join("restored");
    let summary = RestoreEngine::new(
        &archive,
        RestoreOptions {
            paths: vec!["docs/deep/a.txt".to_string()],
            ..RestoreOptions::default()
        },
    )
    .run(&target)
    .await
    .unwrap();
    assert!(!summary.is_partial(), "{:?}", summary.failed);
    assert_eq!(summary.files, 1);
    assert_eq!(summary.directories, 2);
    let expected: BTreeMap<String, Vec<u8>> =
        [("docs/deep/a.txt".to_string(), b"hello".to_vec())].into();
    assert_eq!(files(&target), expected);
}

#[tokio::test]
async fn restore_cancelled_midway_leaves_only_complete_files() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    for i in 0..20u64 {
        write(&src, &format!("f{i:02}.bin"), &noise(i + 100, 24_000));
    }
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    let cancel = CancelHandle::new();
    let progress = {
        let cancel = cancel.clone();
        Arc::new(move |event: Progress| {
            if matches!(event, Progress::FileDone { .. }) {
                cancel.cancel();
            }
        })
    };
    let target = dir.path().join("restored");
    let result = RestoreEngine::new(
        &archive,
        RestoreOptions {
            threads: 1,
            ..RestoreOptions::default()
        },
    )
    .with_metadata(Arc::new(NoopMetadata))
    .with_cancel(cancel)
    .with_progress(progress)
    .run(&target)
    .await;
    assert!(matches!(result, Err(Error::Cancelled)));

    let restored = files(&target);
    let original = files(&src);
    assert!(!restored.is_empty());
    assert!(restored.len() < original.len());
    for (path, content) in &restored {
        assert!(!path.ends_with(".cairn-part"), "leftover {path}");
        assert_eq!(&original[path], content, "{path}");
    }
}

#[tokio::test]
async fn restore_delete_missing_removes_stale_entries_in_scope() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    write(&src, "b.txt", b"bee");
    write(&src, "keep/a.txt", b"ay");
    let archive = new_archive(&dir.path().join("archive")).await;
    backup(&archive, &src).await;

    let target = dir.path().join("restored");
    restore(&archive, &target, None).await;
    write(&target, "stale.txt", b"old");
    write(&target, "keep/old/x", b"older");

    let run = |paths: Vec<String>, dry_run: bool| {
        let archive = &archive;
        let target = &target;
        async move {
            RestoreEngine::new(
                archive,
                RestoreOptions {
                    paths,
                    dry_run,
                    delete_missing: true,
                    ..RestoreOptions::default()
                },
            )
            .with_metadata(Arc::new(NoopMetadata))
            .run(target)
            .await
            .unwrap()
        }
    };

    let dry = run(Vec::new(), true).await;
    assert_eq!(dry.deleted, vec!["keep/old", "stale.txt"]);
    assert!(target.join("stale.txt").exists());
    assert!(target.join("keep/old/x").exists());

    let scoped = run(vec!["keep".to_string()], false).await;
    assert_eq!(scoped.deleted, vec!["keep/old"]);
    assert!(!target.join("keep/old").exists());
    assert!(target.join("stale.txt").exists());

    let full = run(Vec::new(), false).await;
    assert_eq!(full.deleted, vec!["stale.txt"]);
    assert!(!full.is_partial());
    let expected: BTreeMap<String, Vec<u8>> = [
        ("b.txt".to_string(), b"bee".to_vec()),
        ("keep/a.txt".to_string(), b"ay".to_vec()),
    ]
    .into();
    assert_eq!(files(&target), expected);
}
