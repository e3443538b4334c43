use super::{Outcome, cancel_on_ctrl_c, format_bytes, open_archive, spinner, spinner_progress};
use crate::Cli;
use crate::config::JobConfig;
use anyhow::{Result, anyhow};
use cairn_core::{BackupController, BackupOptions, ChangeDetection, LocalTreeSource, metadata};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Directory to back up")]
    source: Option<PathBuf>,

    #[arg(long, help = "Number of parallel file jobs")]
    threads: Option<usize>,

    #[arg(long, help = "Compare file content hashes instead of modification times")]
    hashing: bool,

    #[arg(long, help = "Exclude paths matching a gitignore-style pattern")]
    exclude: Vec<String>,

    #[arg(long, help = "Metadata capture (auto, posix, portable, none)")]
    metadata: Option<String>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &Cli, job: &JobConfig) -> Result<Outcome> {
        let source = self
            .source
            .clone()
            .or_else(|| job.backup.source.clone())
            .ok_or_else(|| anyhow!("A source directory must be specified"))?;
        if !source.is_dir() {
            return Err(anyhow!("Source is not a directory: {}", source.display()));
        }

        let archive = open_archive(cli, job).await?;

        let mut options = BackupOptions::default();
        if let Some(threads) = self.threads.or(job.backup.threads) {
            options.threads = threads;
        }
        options.change_detection = if self.hashing {
            ChangeDetection::Hashing
        } else {
            job.backup.change_detection.unwrap_or_default()
        };

        let adapter = match self.metadata.as_deref().or(job.backup.metadata.as_deref()) {
            Some(name) => metadata::by_name(name)?,
            None => metadata::detect(),
        };
        let excludes = job.backup.exclude.iter().chain(&self.exclude).cloned();
        let tree = Arc::new(LocalTreeSource::new(&source, adapter).with_excludes(excludes)?);

        info!("Backing up {} ({:?} change detection)", source.display(), options.change_detection);
        let pb = spinner(cli.quiet, "Scanning files...");
        let controller = BackupController::new(&archive, options);
        cancel_on_ctrl_c(controller.cancel_handle());
        let summary = controller
            .with_progress(spinner_progress(&pb, "Backing up"))
            .run(tree)
            .await;
        pb.finish_and_clear();
        let summary = summary?;

        println!("Increment {} complete", summary.increment);
        println!(
            "Files: {} new, {} changed, {} metadata only, {} unchanged",
            summary.files_new, summary.files_changed, summary.files_metadata_changed, summary.files_unchanged
        );
        println!("Directories: {}, symlinks: {}", summary.directories, summary.symlinks);
        println!("Deleted: {}", summary.deleted);
        println!(
            "Read {}, stored {} in {} new chunks ({} deduplicated)",
            format_bytes(summary.bytes_read),
            format_bytes(summary.bytes_stored),
            summary.chunks_written,
            summary.chunks_deduplicated
        );
        println!("Duration: {:.1}s", summary.duration_secs);
        if summary.is_partial() {
            println!("{} entries could not be backed up:", summary.failed.len());
            for failed in &summary.failed {
                println!("  {}: {}", failed.path, failed.reason);
            }
        }
        Ok(Outcome::from_partial(summary.is_partial()))
    }
}
