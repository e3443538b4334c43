pub mod archive;
pub mod backup;
pub mod cancel;
pub mod change;
pub mod chunker;
pub mod codec;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod index;
pub mod manifest;
pub mod metadata;
pub mod progress;
pub mod restore;
pub mod source;
pub mod tree;
pub mod types;
pub mod verify;
pub mod volume;

pub use archive::{Archive, ArchiveSettings};
pub use backup::{BackupController, BackupOptions, BackupSummary};
pub use cancel::CancelHandle;
pub use change::ChangeDetection;
pub use error::{Error, Result};
pub use manifest::{FailedEntry, Manifest};
pub use progress::{Progress, ProgressFn};
pub use restore::{RestoreEngine, RestoreOptions, RestoreSummary};
pub use source::{LocalTreeSource, TreeSource};
pub use tree::{LogicalTree, ManifestChain};
pub use types::*;
pub use verify::{Verifier, VerifyReport};
