use crate::source::SourceEntry;
use crate::{ChunkID, EntryKind, FileEntry};
use serde::{Deserialize, Serialize};

/// How a regular file is judged unchanged against its prior entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetection {
    /// Type, size and modification time.
    #[default]
    Simple,
    /// Type, size and whole-file content hash. Survives clock skew at the
    /// cost of reading every file.
    Hashing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    New,
    Unchanged,
    MetadataChanged,
    ContentChanged,
    Deleted,
}

impl Change {
    /// Whether the prior chunk references can be kept.
    pub fn keeps_content(self) -> bool {
        matches!(self, Change::Unchanged | Change::MetadataChanged)
    }
}

impl ChangeDetection {
    /// Whether the content of `current` must be read before it can be classified.
    pub fn needs_content(self, prior: Option<&FileEntry>, current: &SourceEntry) -> bool {
        if current.kind != EntryKind::File {
            return false;
        }
        match self {
            ChangeDetection::Hashing => true,
            ChangeDetection::Simple => !self.classify(prior, current, None).keeps_content(),
        }
    }

    /// Classifies `current` against the prior entry at the same path.
    /// `content_hash` is the hash of the file as just read, if it was read.
    pub fn classify(
        self,
        prior: Option<&FileEntry>,
        current: &SourceEntry,
        content_hash: Option<&ChunkID>,
    ) -> Change {
        let Some(prior) = prior.filter(|p| !p.is_tombstone()) else {
            return Change::New;
        };
        if prior.kind != current.kind {
            return Change::ContentChanged;
        }

        let content_same = match current.kind {
            EntryKind::File => {
                if prior.size != current.size {
                    false
                } else {
                    match self {
                        ChangeDetection::Simple => match content_hash {
                            Some(hash) => prior.content_hash.as_ref() == Some(hash),
                            None => prior.mtime == current.mtime,
                        },
                        ChangeDetection::Hashing => match content_hash {
                            Some(hash) => prior.content_hash.as_ref() == Some(hash),
                            None => false,
                        },
                    }
                }
            }
            EntryKind::Symlink => prior.symlink_target == current.symlink_target,
            EntryKind::Directory => true,
            EntryKind::Tombstone => false,
        };

        if !content_same {
            Change::ContentChanged
        } else if prior.mtime == current.mtime && prior.metadata == current.metadata {
            Change::Unchanged
        } else {
            Change::MetadataChanged
        }
    }
}
