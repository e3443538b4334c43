use super::{Outcome, archive_path, format_bytes};
use crate::Cli;
use crate::config::JobConfig;
use anyhow::{Result, anyhow};
use cairn_core::chunker::ChunkerLimits;
use cairn_core::compress::Compression;
use cairn_core::{Archive, ArchiveSettings};
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, default_value = "zlib", help = "Compression algorithm (zlib, none)")]
    compression: String,

    #[arg(long, default_value_t = 256, help = "Maximum volume size in MiB")]
    volume_size: u64,

    #[arg(long, default_value_t = 4096, help = "Average chunk size in KiB")]
    chunk_size: u32,
}

impl InitCommand {
    pub async fn run(&self, cli: &Cli, job: &JobConfig) -> Result<Outcome> {
        let path = archive_path(cli, job)?;
        let password = match &cli.password {
            Some(password) => password.clone(),
            None => {
                let first = rpassword::prompt_password("Enter new archive password: ")?;
                let second = rpassword::prompt_password("Repeat password: ")?;
                if first != second {
                    return Err(anyhow!("Passwords do not match"));
                }
                first
            }
        };
        if password.is_empty() {
            return Err(anyhow!("Password must not be empty"));
        }

        let settings = self.settings()?;
        info!("Initializing archive at: {}", path.display());
        let archive = Archive::init(&path, &password, settings).await?;
        let config = archive.config();

        println!("Initialized archive {} at {}", config.id, path.display());
        println!(
            "Chunks: {} average, volumes up to {}, compression {:?}",
            format_bytes(u64::from(config.chunker.avg_size)),
            format_bytes(config.volume_size),
            config.compression
        );
        Ok(Outcome::Complete)
    }

    fn settings(&self) -> Result<ArchiveSettings> {
        let avg = self
            .chunk_size
            .checked_mul(1024)
            .ok_or_else(|| anyhow!("Chunk size {} KiB is too large", self.chunk_size))?;
        let settings = ArchiveSettings {
            compression: Compression::from_name(&self.compression)?,
            chunker: ChunkerLimits::new(avg),
            volume_size: self.volume_size.saturating_mul(1024 * 1024),
            ..ArchiveSettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(chunk_size: u32) -> InitCommand {
        InitCommand {
            compression: "zlib".to_string(),
            volume_size: 256,
            chunk_size,
        }
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = command(4096).settings().unwrap();
        assert_eq!(settings.chunker.avg_size, 4 * 1024 * 1024);
    }

    #[test]
    fn test_oversized_chunk_size_is_rejected() {
        assert!(command(2_000_000).settings().is_err());
        assert!(command(u32::MAX).settings().is_err());
    }
}
