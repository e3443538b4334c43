use super::{Outcome, open_archive};
use crate::Cli;
use crate::config::JobConfig;
use anyhow::Result;
use cairn_core::{EntryKind, FileEntry};
use chrono::DateTime;
use clap::Args;

#[derive(Args)]
pub struct LsCommand {
    #[arg(long, help = "Increment to list (default: latest)")]
    increment: Option<u32>,

    #[arg(help = "Only list this path and everything below it")]
    path: Option<String>,

    #[arg(short, long, help = "Show size, time and origin increment")]
    long: bool,
}

impl LsCommand {
    pub async fn run(&self, cli: &Cli, job: &JobConfig) -> Result<Outcome> {
        let archive = open_archive(cli, job).await?;
        let chain = archive.load_chain().await?;
        let mut tree = chain.tree_at(self.increment)?;
        if let Some(prefix) = &self.path {
            tree = tree.filter_prefix(prefix);
        }

        for entry in &tree {
            if self.long {
                println!("{}", long_line(entry));
            } else {
                println!("{}", entry.path);
            }
        }
        Ok(Outcome::Complete)
    }
}

fn long_line(entry: &FileEntry) -> String {
    let kind = match entry.kind {
        EntryKind::File => '-',
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::Tombstone => 'x',
    };
    let time = DateTime::from_timestamp(entry.mtime, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} {:>12} {} #{:<5} {}",
        kind, entry.size, time, entry.origin, entry.path
    );
    if let Some(target) = &entry.symlink_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}
