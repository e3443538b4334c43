pub mod backup;
pub mod increments;
pub mod init;
pub mod ls;
pub mod restore;
pub mod verify;

use crate::Cli;
use crate::config::JobConfig;
use anyhow::{Result, anyhow};
use cairn_core::{Archive, CancelHandle, Progress, ProgressFn};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How a command finished, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// Finished, but some files failed or problems were found.
    Partial,
}

impl Outcome {
    pub fn from_partial(partial: bool) -> Self {
        if partial { Outcome::Partial } else { Outcome::Complete }
    }
}

pub fn archive_path(cli: &Cli, job: &JobConfig) -> Result<PathBuf> {
    cli.archive
        .clone()
        .or_else(|| job.archive.clone())
        .ok_or_else(|| anyhow!("Archive path required (--archive or CAIRN_ARCHIVE)"))
}

pub fn password(cli: &Cli) -> Result<String> {
    match &cli.password {
        Some(password) => Ok(password.clone()),
        None => rpassword::prompt_password("Enter archive password: ")
            .map_err(|e| anyhow!("Password required: {e}")),
    }
}

pub async fn open_archive(cli: &Cli, job: &JobConfig) -> Result<Archive> {
    let path = archive_path(cli, job)?;
    let password = password(cli)?;
    info!("Opening archive at: {}", path.display());
    Ok(Archive::open(&path, &password).await?)
}

/// Cancels `handle` on the first Ctrl-C.
pub fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight work");
            handle.cancel();
        }
    });
}

pub fn spinner(quiet: bool, message: &str) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(message.to_string());
    pb
}

/// Feeds per-file progress events into a spinner.
pub fn spinner_progress(pb: &ProgressBar, verb: &'static str) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |event: Progress| match event {
        Progress::Planned { entries } => {
            pb.set_length(entries as u64);
            pb.set_message(format!("{verb} {entries} entries"));
        }
        Progress::FileDone { path, .. } => {
            pb.inc(1);
            pb.set_message(format!("{verb} {path}"));
        }
        Progress::FileFailed { path } => {
            pb.inc(1);
            pb.println(format!("failed: {path}"));
        }
    })
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
