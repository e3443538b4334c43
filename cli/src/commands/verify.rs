use super::{Outcome, open_archive, spinner};
use crate::Cli;
use crate::config::JobConfig;
use anyhow::Result;
use cairn_core::Verifier;
use clap::Args;

#[derive(Args)]
pub struct VerifyCommand {
    #[arg(long, help = "Print the full report as JSON")]
    json: bool,
}

impl VerifyCommand {
    pub async fn run(&self, cli: &Cli, job: &JobConfig) -> Result<Outcome> {
        let archive = open_archive(cli, job).await?;

        let pb = spinner(cli.quiet || self.json, "Verifying volumes...");
        let report = Verifier::new(&archive).run().await;
        pb.finish_and_clear();
        let report = report?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(Outcome::from_partial(!report.is_clean()));
        }

        println!(
            "Checked {} manifests, {} volumes, {} chunks, {} references",
            report.manifests_checked, report.volumes_checked, report.chunks_checked, report.references_checked
        );
        for problem in &report.broken_manifests {
            println!("Broken manifest {}: {}", problem.increment, problem.reason);
        }
        for problem in &report.corrupt_volumes {
            println!("Corrupt volume {}: {}", problem.volume, problem.reason);
        }
        for problem in &report.corrupt_chunks {
            println!(
                "Corrupt chunk {} in {}: {}",
                problem.chunk.short_string(),
                problem.volume,
                problem.reason
            );
        }
        for reference in &report.unresolved_references {
            println!(
                "Unresolved chunk {} referenced by {} in increment {}",
                reference.chunk.short_string(),
                reference.path,
                reference.increment
            );
        }
        if !report.orphaned_chunks.is_empty() {
            println!("{} orphaned chunks (not referenced by any increment)", report.orphaned_chunks.len());
        }

        if report.is_clean() {
            println!("No problems found");
        } else {
            println!("Archive has problems");
        }
        Ok(Outcome::from_partial(!report.is_clean()))
    }
}
