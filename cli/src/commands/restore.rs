use super::{Outcome, cancel_on_ctrl_c, format_bytes, open_archive, spinner, spinner_progress};
use crate::Cli;
use crate::config::JobConfig;
use anyhow::Result;
use cairn_core::{CancelHandle, RestoreEngine, RestoreOptions, metadata};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Target directory for restore")]
    target: PathBuf,

    #[arg(long, help = "Increment to restore (default: latest)")]
    increment: Option<u32>,

    #[arg(long = "path", help = "Restore only this path and everything below it")]
    paths: Vec<String>,

    #[arg(long, help = "Number of parallel file jobs")]
    threads: Option<usize>,

    #[arg(long, help = "Metadata application (auto, posix, portable, none)")]
    metadata: Option<String>,

    #[arg(long, help = "Show what would be restored without writing anything")]
    dry_run: bool,

    #[arg(long, help = "Delete files in the target that are not in the increment")]
    delete_missing: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &Cli, job: &JobConfig) -> Result<Outcome> {
        let archive = open_archive(cli, job).await?;

        let mut options = RestoreOptions {
            increment: self.increment,
            paths: self.paths.clone(),
            dry_run: self.dry_run,
            delete_missing: self.delete_missing || job.restore.delete_missing.unwrap_or(false),
            ..RestoreOptions::default()
        };
        if let Some(threads) = self.threads.or(job.restore.threads) {
            options.threads = threads;
        }
        let adapter = match self.metadata.as_deref().or(job.restore.metadata.as_deref()) {
            Some(name) => metadata::by_name(name)?,
            None => metadata::detect(),
        };

        info!("Restoring into {}", self.target.display());
        let cancel = CancelHandle::new();
        cancel_on_ctrl_c(cancel.clone());
        let pb = spinner(cli.quiet || self.dry_run, "Resolving increments...");
        let summary = RestoreEngine::new(&archive, options)
            .with_metadata(adapter)
            .with_cancel(cancel)
            .with_progress(spinner_progress(&pb, "Restoring"))
            .run(&self.target)
            .await;
        pb.finish_and_clear();
        let summary = summary?;

        if summary.dry_run {
            println!(
                "Would restore increment {}: {} files ({}), {} directories, {} symlinks",
                summary.increment,
                summary.files,
                format_bytes(summary.bytes),
                summary.directories,
                summary.symlinks
            );
            for path in &summary.deleted {
                println!("Would delete {path}");
            }
            return Ok(Outcome::Complete);
        }

        println!("Restored increment {} to {}", summary.increment, self.target.display());
        println!(
            "Files: {} ({}), directories: {}, symlinks: {}",
            summary.files,
            format_bytes(summary.bytes),
            summary.directories,
            summary.symlinks
        );
        if !summary.deleted.is_empty() {
            println!("Deleted {} entries not in the increment", summary.deleted.len());
        }
        println!("Duration: {:.1}s", summary.duration_secs);
        if summary.is_partial() {
            println!("{} entries could not be restored:", summary.failed.len());
            for failed in &summary.failed {
                println!("  {}: {}", failed.path, failed.reason);
            }
        }
        Ok(Outcome::from_partial(summary.is_partial()))
    }
}
