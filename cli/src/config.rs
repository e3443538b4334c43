//! Job configuration for the `cairn` binary.
//!
//! Read from `--config <file>` when given, otherwise from `config.toml` in
//! the per-user configuration directory if it exists. Command line flags
//! and environment variables take precedence over every value here.

use anyhow::{Context, Result};
use cairn_core::ChangeDetection;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub archive: Option<PathBuf>,
    pub backup: BackupJob,
    pub restore: RestoreJob,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupJob {
    pub source: Option<PathBuf>,
    pub threads: Option<usize>,
    pub change_detection: Option<ChangeDetection>,
    /// Gitignore-style patterns relative to the source.
    pub exclude: Vec<String>,
    /// `auto`, `posix`, `portable` or `none`.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreJob {
    pub threads: Option<usize>,
    pub metadata: Option<String>,
    pub delete_missing: Option<bool>,
}

impl JobConfig {
    /// Loads `explicit`, or the per-user file when present. A missing
    /// explicit file is an error; a missing per-user file is not.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        debug!("Loading job configuration from {}", path.display());
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "cairn", "cairn").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_job() {
        let job = JobConfig::parse(
            r#"
archive = "/srv/archive"

[backup]
source = "/home/alice"
threads = 8
change_detection = "hashing"
exclude = [".cache", "node_modules"]
metadata = "posix"

[restore]
threads = 2
delete_missing = true
"#,
        )
        .unwrap();

        assert_eq!(job.archive, Some(PathBuf::from("/srv/archive")));
        assert_eq!(job.backup.threads, Some(8));
        assert_eq!(job.backup.change_detection, Some(ChangeDetection::Hashing));
        assert_eq!(job.backup.exclude, vec![".cache", "node_modules"]);
        assert_eq!(job.restore.threads, Some(2));
        assert_eq!(job.restore.metadata, None);
        assert_eq!(job.restore.delete_missing, Some(true));
    }

    #[test]
    fn test_empty_job_is_default() {
        assert_eq!(JobConfig::parse("").unwrap(), JobConfig::default());
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(JobConfig::parse("archiv = \"/typo\"").is_err());
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(JobConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.toml");
        fs::write(&path, "[backup]\nthreads = 3\n").unwrap();
        let job = JobConfig::load(Some(&path)).unwrap();
        assert_eq!(job.backup.threads, Some(3));
    }
}
