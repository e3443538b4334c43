mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    Outcome, backup::BackupCommand, increments::IncrementsCommand, init::InitCommand, ls::LsCommand,
    restore::RestoreCommand, verify::VerifyCommand,
};
use config::JobConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "cairn",
    about = "Deduplicating, incremental, encrypted backups",
    long_about = "Cairn stores encrypted, deduplicated increments of a directory tree in a local archive and restores any of them"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "CAIRN_ARCHIVE", help = "Archive directory")]
    archive: Option<PathBuf>,

    #[arg(long, global = true, env = "CAIRN_PASSWORD", hide_env_values = true, help = "Archive password")]
    password: Option<String>,

    #[arg(long, global = true, help = "Job configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a new archive")]
    Init(InitCommand),

    #[command(about = "Back up a directory as a new increment")]
    Backup(BackupCommand),

    #[command(about = "Restore an increment into a directory")]
    Restore(RestoreCommand),

    #[command(about = "Check archive integrity")]
    Verify(VerifyCommand),

    #[command(about = "List increments")]
    Increments(IncrementsCommand),

    #[command(about = "List entries of an increment")]
    Ls(LsCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match run(&cli).await {
        Ok(Outcome::Complete) => ExitCode::SUCCESS,
        Ok(Outcome::Partial) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<Outcome> {
    let job = JobConfig::load(cli.config.as_deref())?;
    debug!("Starting cairn");

    match cli.command {
        Commands::Init(ref cmd) => cmd.run(cli, &job).await,
        Commands::Backup(ref cmd) => cmd.run(cli, &job).await,
        Commands::Restore(ref cmd) => cmd.run(cli, &job).await,
        Commands::Verify(ref cmd) => cmd.run(cli, &job).await,
        Commands::Increments(ref cmd) => cmd.run(cli, &job).await,
        Commands::Ls(ref cmd) => cmd.run(cli, &job).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("cairn={level},cairn_core={level},cairn_cli={level}")));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
    }
}
