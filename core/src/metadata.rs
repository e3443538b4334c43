//! Platform metadata capability.
//!
//! The core stores the blob produced by [`MetadataAdapter::capture`] without
//! interpreting it and hands it back to [`MetadataAdapter::apply`] on restore.
//! One adapter is chosen per process with [`detect`].

use crate::{Error, FileEntry, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
enum MetadataBlob {
    Posix { mode: u32, uid: u32, gid: u32 },
    Portable { readonly: bool },
}

impl MetadataBlob {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(blob: &[u8]) -> Result<Option<Self>> {
        if blob.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(blob)
            .map(Some)
            .map_err(|e| Error::Other(format!("unreadable metadata blob: {e}")))
    }
}

pub trait MetadataAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produces the opaque blob stored with an entry.
    fn capture(&self, path: &Path, meta: &fs::Metadata) -> Result<Vec<u8>>;

    /// Restores the entry's blob and modification time onto `path`.
    fn apply(&self, path: &Path, entry: &FileEntry) -> Result<()>;
}

/// Picks the adapter for the running platform.
pub fn detect() -> Arc<dyn MetadataAdapter> {
    #[cfg(unix)]
    {
        Arc::new(PosixMetadata)
    }
    #[cfg(not(unix))]
    {
        Arc::new(PortableMetadata)
    }
}

/// Looks an adapter up by name, as given in job configuration.
pub fn by_name(name: &str) -> Result<Arc<dyn MetadataAdapter>> {
    match name {
        "auto" => Ok(detect()),
        #[cfg(unix)]
        "posix" => Ok(Arc::new(PosixMetadata)),
        "portable" => Ok(Arc::new(PortableMetadata)),
        "none" => Ok(Arc::new(NoopMetadata)),
        other => Err(Error::InvalidConfig(format!("unknown metadata adapter: {other}"))),
    }
}

fn set_mtime(path: &Path, entry: &FileEntry) -> Result<()> {
    if entry.is_symlink() || entry.is_tombstone() {
        return Ok(());
    }
    #[cfg(not(unix))]
    if entry.is_dir() {
        return Ok(());
    }
    let time = if entry.mtime >= 0 {
        UNIX_EPOCH + Duration::from_secs(entry.mtime as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(entry.mtime.unsigned_abs())
    };
    let file = File::options().read(true).open(path)?;
    file.set_modified(time)?;
    Ok(())
}

#[cfg(unix)]
pub struct PosixMetadata;

#[cfg(unix)]
impl MetadataAdapter for PosixMetadata {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn capture(&self, _path: &Path, meta: &fs::Metadata) -> Result<Vec<u8>> {
        use std::os::unix::fs::MetadataExt;
        MetadataBlob::Posix {
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
        }
        .encode()
    }

    fn apply(&self, path: &Path, entry: &FileEntry) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        set_mtime(path, entry)?;
        match MetadataBlob::decode(&entry.metadata)? {
            Some(MetadataBlob::Posix { mode, uid, gid }) => {
                if let Err(e) = std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
                    if e.kind() != std::io::ErrorKind::PermissionDenied {
                        return Err(e.into());
                    }
                    debug!("Keeping current owner of {}: {}", path.display(), e);
                }
                if !entry.is_symlink() {
                    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
                }
            }
            Some(MetadataBlob::Portable { readonly }) => {
                if !entry.is_symlink() {
                    let mut perms = fs::metadata(path)?.permissions();
                    perms.set_readonly(readonly);
                    fs::set_permissions(path, perms)?;
                }
            }
            None => {}
        }
        Ok(())
    }
}

/// Read-only flag and modification time only.
pub struct PortableMetadata;

impl MetadataAdapter for PortableMetadata {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn capture(&self, _path: &Path, meta: &fs::Metadata) -> Result<Vec<u8>> {
        MetadataBlob::Portable {
            readonly: meta.permissions().readonly(),
        }
        .encode()
    }

    fn apply(&self, path: &Path, entry: &FileEntry) -> Result<()> {
        set_mtime(path, entry)?;
        if entry.is_symlink() {
            return Ok(());
        }
        let readonly = match MetadataBlob::decode(&entry.metadata)? {
            Some(MetadataBlob::Portable { readonly }) => readonly,
            Some(MetadataBlob::Posix { mode, .. }) => mode & 0o222 == 0,
            None => return Ok(()),
        };
        // directories keep their permissions so restored children stay writable
        if entry.is_file() {
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_readonly(readonly);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

/// Captures and restores nothing.
pub struct NoopMetadata;

impl MetadataAdapter for NoopMetadata {
    fn name(&self) -> &'static str {
        "none"
    }

    fn capture(&self, _path: &Path, _meta: &fs::Metadata) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn apply(&self, _path: &Path, _entry: &FileEntry) -> Result<()> {
        Ok(())
    }
}

/// Modification time recorded for a restored path, in whole seconds.
pub fn modified_secs(path: &Path) -> Result<i64> {
    Ok(crate::source::mtime_secs(&fs::symlink_metadata(path)?))
}
