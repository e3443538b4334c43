use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Integrity check failed for chunk {chunk}: {reason}")]
    Integrity { chunk: String, reason: String },

    #[error("Volume {volume} is corrupt: {reason}")]
    CorruptVolume { volume: String, reason: String },

    #[error("Manifest chain is broken: {0}")]
    ManifestChain(String),

    #[error("Failed to restore {path}: {reason}")]
    FileRestore { path: String, reason: String },

    #[error("Backup aborted by storage failure: {0}")]
    BackupIo(String),

    #[error("Archive not found at {path}")]
    ArchiveNotFound { path: String },

    #[error("Archive already exists at {path}")]
    ArchiveExists { path: String },

    #[error("Invalid archive format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Manifest could not be parsed: {0}")]
    ManifestParse(String),

    #[error("Chunk not found: {id}")]
    ChunkNotFound { id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that leave no consistent foundation for the rest of a backup run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, Error::BackupIo(_) | Error::Cancelled)
    }

    pub fn corrupt_volume(volume: impl ToString, reason: impl Into<String>) -> Self {
        Error::CorruptVolume {
            volume: volume.to_string(),
            reason: reason.into(),
        }
    }

    pub fn integrity(chunk: impl ToString, reason: impl Into<String>) -> Self {
        Error::Integrity {
            chunk: chunk.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::BackupIo("disk full".into()).is_fatal_to_run());
        assert!(Error::Cancelled.is_fatal_to_run());
        assert!(!Error::Io(std::io::Error::other("vanished")).is_fatal_to_run());
        assert!(!Error::integrity("abcd", "hash mismatch").is_fatal_to_run());
    }
}
