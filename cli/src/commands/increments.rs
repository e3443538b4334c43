use super::{Outcome, format_bytes, open_archive};
use crate::Cli;
use crate::config::JobConfig;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct IncrementsCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,
}

#[derive(Serialize)]
struct IncrementRow {
    sequence: u32,
    previous: Option<u32>,
    created_at: Option<DateTime<Utc>>,
    hostname: Option<String>,
    source: Option<String>,
    entries: usize,
    new_entries: usize,
    deleted: usize,
    failed: usize,
    size: u64,
    /// Set when the manifest could not be read.
    error: Option<String>,
}

impl IncrementsCommand {
    pub async fn run(&self, cli: &Cli, job: &JobConfig) -> Result<Outcome> {
        let archive = open_archive(cli, job).await?;
        let chain = archive.load_chain().await?;

        let mut rows: Vec<IncrementRow> = chain
            .iter()
            .map(|m| IncrementRow {
                sequence: m.sequence,
                previous: m.previous,
                created_at: Some(m.created_at),
                hostname: Some(m.hostname.clone()),
                source: Some(m.source.clone()),
                entries: m.live_entries().count(),
                new_entries: m.new_entries().count(),
                deleted: m.tombstones().count(),
                failed: m.failed.len(),
                size: m.total_size(),
                error: None,
            })
            .collect();
        rows.extend(chain.broken().iter().map(|(&sequence, reason)| IncrementRow {
            sequence,
            previous: None,
            created_at: None,
            hostname: None,
            source: None,
            entries: 0,
            new_entries: 0,
            deleted: 0,
            failed: 0,
            size: 0,
            error: Some(reason.clone()),
        }));
        rows.sort_by_key(|r| r.sequence);

        match self.format.as_deref().unwrap_or("table") {
            "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
            "table" => print_table(&rows),
            other => return Err(anyhow!("Unsupported format: {}. Supported: table, json", other)),
        }
        Ok(Outcome::from_partial(!chain.broken().is_empty()))
    }
}

fn print_table(rows: &[IncrementRow]) {
    if rows.is_empty() {
        println!("No increments found");
        return;
    }
    println!(
        "{:>6}  {:<20}  {:<16}  {:>8}  {:>6}  {:>7}  {:>6}  {:>10}",
        "SEQ", "TIME", "HOST", "ENTRIES", "NEW", "DELETED", "FAILED", "SIZE"
    );
    for row in rows {
        if let Some(error) = &row.error {
            println!("{:>6}  unreadable: {}", row.sequence, error);
            continue;
        }
        println!(
            "{:>6}  {:<20}  {:<16}  {:>8}  {:>6}  {:>7}  {:>6}  {:>10}",
            row.sequence,
            row.created_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            row.hostname.as_deref().unwrap_or(""),
            row.entries,
            row.new_entries,
            row.deleted,
            row.failed,
            format_bytes(row.size)
        );
    }
    println!("{} increments", rows.len());
}
