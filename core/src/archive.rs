use crate::chunker::{Chunker, ChunkerLimits};
use crate::codec::ChunkCodec;
use crate::compress::Compression;
use crate::crypto::{CipherId, DataKeys, Encryptor, MasterKey};
use crate::index::DedupIndex;
use crate::manifest::{EncryptionParams, Manifest};
use crate::tree::ManifestChain;
use crate::volume::VolumeReader;
use crate::{ArchiveConfig, Error, KdfParams, Result, VolumeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const ARCHIVE_FORMAT_VERSION: u32 = 1;
pub const CONFIG_FILE: &str = "config";
pub const VOLUMES_DIR: &str = "volumes";
pub const MANIFESTS_DIR: &str = "manifests";

const DEFAULT_VOLUME_SIZE: u64 = 256 * 1024 * 1024;

/// Parameters fixed when an archive is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub compression: Compression,
    pub chunker: ChunkerLimits,
    pub volume_size: u64,
    pub kdf_params: KdfParams,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            chunker: ChunkerLimits::default(),
            volume_size: DEFAULT_VOLUME_SIZE,
            kdf_params: KdfParams::default(),
        }
    }
}

impl ArchiveSettings {
    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        if self.kdf_params.salt.len() != KdfParams::SALT_LEN {
            return Err(Error::InvalidConfig(format!(
                "KDF salt must be {} bytes",
                KdfParams::SALT_LEN
            )));
        }
        // a volume must hold at least one maximal chunk
        if self.volume_size < u64::from(self.chunker.max_size) * 2 {
            return Err(Error::InvalidConfig(format!(
                "volume size {} is too small for {} byte chunks",
                self.volume_size, self.chunker.max_size
            )));
        }
        Ok(())
    }
}

/// A problem found while rebuilding the dedup index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusableVolume {
    pub volume: VolumeId,
    pub reason: String,
}

/// A local archive: configuration, volumes and manifests.
///
/// # Layout
///
/// ```text
/// archive/
/// ├── config          # ArchiveConfig with the wrapped data key
/// ├── volumes/        # iXXXXXXXX-vYYYY.vol chunk containers
/// └── manifests/      # one NNNNNNNN.manifest per increment
/// ```
///
/// # Examples
///
/// ```no_run
/// use cairn_core::{Archive, ArchiveSettings};
///
/// #[tokio::main]
/// async fn main() -> cairn_core::Result<()> {
///     let archive = Archive::init("./backups", "my-password", ArchiveSettings::default()).await?;
///     let archive = Archive::open("./backups", "my-password").await?;
///     Ok(())
/// }
/// ```
pub struct Archive {
    path: PathBuf,
    config: ArchiveConfig,
    keys: DataKeys,
    manifest_encryptor: Encryptor,
}

impl Archive {
    /// Creates a new archive at `path`.
    ///
    /// A random data key is generated and stored wrapped under a key derived
    /// from `password`.
    ///
    /// # Errors
    ///
    /// * `Error::ArchiveExists` - a config file is already present
    /// * `Error::InvalidConfig` - the settings are out of range
    pub async fn init<P: AsRef<Path>>(path: P, password: &str, settings: ArchiveSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        settings.validate()?;

        if fs::try_exists(path.join(CONFIG_FILE)).await? {
            return Err(Error::ArchiveExists {
                path: path.display().to_string(),
            });
        }

        fs::create_dir_all(path.join(VOLUMES_DIR)).await?;
        fs::create_dir_all(path.join(MANIFESTS_DIR)).await?;

        let kek = MasterKey::derive_from_password(password, &settings.kdf_params)?;
        let data_key = MasterKey::generate();
        let wrapped_key = Encryptor::new(kek.as_bytes())?.encrypt(data_key.as_bytes())?;

        let config = ArchiveConfig {
            version: ARCHIVE_FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            kdf_params: settings.kdf_params,
            wrapped_key,
            cipher: CipherId::XChaCha20Poly1305,
            compression: settings.compression,
            chunker: settings.chunker,
            volume_size: settings.volume_size,
            created_at: chrono::Utc::now(),
        };
        let config_json = serde_json::to_vec_pretty(&config)?;
        write_atomic(&path.join(CONFIG_FILE), &config_json).await?;

        info!("Initialized archive {} at {}", config.id, path.display());
        Self::from_parts(path, config, &data_key)
    }

    /// Opens an existing archive and unwraps its data key.
    ///
    /// # Errors
    ///
    /// * `Error::ArchiveNotFound` - no config file at `path`
    /// * `Error::InvalidPassword` - the data key does not unwrap
    /// * `Error::InvalidFormatVersion` - written by an unknown version
    pub async fn open<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config_path = path.join(CONFIG_FILE);
        if !fs::try_exists(&config_path).await? {
            return Err(Error::ArchiveNotFound {
                path: path.display().to_string(),
            });
        }

        let config_data = fs::read(&config_path).await?;
        let config: ArchiveConfig = serde_json::from_slice(&config_data)?;
        if config.version != ARCHIVE_FORMAT_VERSION {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }
        config.chunker.validate()?;

        let kek = MasterKey::derive_from_password(password, &config.kdf_params)?;
        let data_key = Encryptor::new(kek.as_bytes())?
            .decrypt(&config.wrapped_key)
            .map_err(|_| Error::InvalidPassword)?;
        let data_key = MasterKey::from_bytes(&data_key)?;

        debug!("Opened archive {} at {}", config.id, path.display());
        Self::from_parts(path, config, &data_key)
    }

    fn from_parts(path: PathBuf, config: ArchiveConfig, data_key: &MasterKey) -> Result<Self> {
        let keys = DataKeys::derive(data_key);
        let manifest_encryptor = Encryptor::new(&keys.manifest_key)?;
        Ok(Self {
            path,
            config,
            keys,
            manifest_encryptor,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.path.join(VOLUMES_DIR)
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.path.join(MANIFESTS_DIR)
    }

    pub fn salt(&self) -> [u8; 32] {
        self.config.kdf_params.salt_array()
    }

    pub fn encryption_params(&self) -> EncryptionParams {
        EncryptionParams {
            cipher: self.config.cipher,
            compression: self.config.compression,
        }
    }

    /// A fresh codec. Each codec starts its own IV session.
    pub fn codec(&self) -> Result<ChunkCodec> {
        ChunkCodec::new(
            &self.keys,
            self.config.compression,
            self.config.chunker.max_size as usize,
        )
    }

    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::new(self.config.chunker)
    }

    pub fn volume_path(&self, id: VolumeId) -> PathBuf {
        self.volumes_dir().join(id.file_name())
    }

    pub fn volume_opener(&self) -> VolumeOpener {
        VolumeOpener {
            dir: self.volumes_dir(),
            salt: self.salt(),
            cipher: self.config.cipher,
            compression: self.config.compression,
        }
    }

    /// Opens and validates one finalized volume. Blocking.
    pub fn open_volume(&self, id: VolumeId) -> Result<VolumeReader> {
        self.volume_opener().open(id)
    }

    /// Finalized volumes, ordered by id. Unfinalized `.part` files are ignored.
    pub async fn list_volumes(&self) -> Result<Vec<VolumeId>> {
        let mut entries = fs::read_dir(self.volumes_dir()).await?;
        let mut volumes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(VolumeId::from_file_name) {
                volumes.push(id);
            }
        }
        volumes.sort();
        Ok(volumes)
    }

    /// First unused volume sequence for `increment`, counting abandoned
    /// `.part` files so an earlier aborted run is never overwritten.
    pub async fn next_volume_sequence(&self, increment: u32) -> Result<u32> {
        let mut entries = fs::read_dir(self.volumes_dir()).await?;
        let mut highest = 0u32;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let name = name.strip_suffix(".part").unwrap_or(name);
            if let Some(id) = VolumeId::from_file_name(name) {
                if id.increment == increment {
                    highest = highest.max(id.sequence);
                }
            }
        }
        Ok(highest + 1)
    }

    /// Rebuilds the dedup index from the footer of every finalized volume.
    ///
    /// Volumes that fail validation are left out of the index and returned
    /// alongside it; chunks that only lived there become unresolvable.
    pub async fn build_index(&self) -> Result<(DedupIndex, Vec<UnusableVolume>)> {
        let volumes = self.list_volumes().await?;
        let opener = self.volume_opener();

        tokio::task::spawn_blocking(move || {
            let index = DedupIndex::new();
            let mut unusable = Vec::new();
            for id in volumes {
                let opened = opener.open(id).and_then(|reader| {
                    let size = std::fs::metadata(opener.path(id))?.len();
                    Ok((reader, size))
                });
                match opened {
                    Ok((reader, size)) => index.add_volume(&reader, size),
                    Err(e) => {
                        warn!("Skipping volume {}: {}", id, e);
                        unusable.push(UnusableVolume {
                            volume: id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            debug!("Rebuilt dedup index with {} chunks", index.len());
            Ok((index, unusable))
        })
        .await
        .map_err(|e| Error::Other(format!("index rebuild task failed: {e}")))?
    }

    /// Sequence numbers of every manifest file, ascending.
    pub async fn list_manifests(&self) -> Result<Vec<u32>> {
        let mut entries = fs::read_dir(self.manifests_dir()).await?;
        let mut sequences = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(seq) = entry
                .file_name()
                .to_str()
                .and_then(Manifest::sequence_from_file_name)
            {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    pub async fn load_manifest(&self, sequence: u32) -> Result<Manifest> {
        let path = self.manifests_dir().join(Manifest::file_name(sequence));
        let data = fs::read(&path).await?;
        let manifest = Manifest::parse(&data, &self.manifest_encryptor)?;
        if manifest.sequence != sequence {
            return Err(Error::ManifestChain(format!(
                "manifest file {} claims to be increment {}",
                sequence, manifest.sequence
            )));
        }
        if manifest.archive_id != self.config.id {
            return Err(Error::ManifestChain(format!(
                "manifest {} belongs to archive {}",
                sequence, manifest.archive_id
            )));
        }
        Ok(manifest)
    }

    /// Writes a finalized manifest. Existing increments are never overwritten.
    pub async fn save_manifest(&self, manifest: &mut Manifest) -> Result<()> {
        let data = manifest.to_bytes(&self.manifest_encryptor)?;
        let path = self.manifests_dir().join(Manifest::file_name(manifest.sequence));
        if fs::try_exists(&path).await? {
            return Err(Error::ManifestChain(format!(
                "increment {} already exists",
                manifest.sequence
            )));
        }
        write_atomic(&path, &data).await?;
        info!("Saved manifest {}", manifest.summary());
        Ok(())
    }

    /// Loads every manifest into an arena. Unreadable manifests are recorded
    /// as broken rather than failing the whole load.
    pub async fn load_chain(&self) -> Result<ManifestChain> {
        let mut chain = ManifestChain::new();
        for sequence in self.list_manifests().await? {
            match self.load_manifest(sequence).await {
                Ok(manifest) => chain.insert(manifest),
                Err(e) => {
                    warn!("Manifest {} is unreadable: {}", sequence, e);
                    chain.mark_broken(sequence, e.to_string());
                }
            }
        }
        Ok(chain)
    }
}

/// Opens volumes of one archive, checking that their headers belong to it.
#[derive(Debug, Clone)]
pub struct VolumeOpener {
    dir: PathBuf,
    salt: [u8; 32],
    cipher: CipherId,
    compression: Compression,
}

impl VolumeOpener {
    pub fn path(&self, id: VolumeId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    pub fn open(&self, id: VolumeId) -> Result<VolumeReader> {
        let reader = VolumeReader::open(&self.path(id), id)?;
        let header = reader.header();
        if header.salt != self.salt {
            return Err(Error::corrupt_volume(id, "volume belongs to a different archive"));
        }
        if header.cipher != self.cipher || header.compression != self.compression {
            return Err(Error::corrupt_volume(id, "volume uses unexpected codec parameters"));
        }
        Ok(reader)
    }
}

/// Lazily opened, shared volume readers. A volume is validated at most
/// once; a failure is remembered and returned to every later caller.
pub struct VolumeCache {
    opener: VolumeOpener,
    slots: Mutex<HashMap<VolumeId, Arc<OnceLock<std::result::Result<Arc<VolumeReader>, String>>>>>,
}

impl VolumeCache {
    pub fn new(opener: VolumeOpener) -> Self {
        Self {
            opener,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: VolumeId) -> Result<Arc<VolumeReader>> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(slots.entry(id).or_default())
        };
        slot.get_or_init(|| {
            self.opener
                .open(id)
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
        .map_err(|reason| Error::CorruptVolume {
            volume: id.to_string(),
            reason,
        })
    }
}

/// Writes `data` to `<path>.part`, syncs it, then renames it into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let mut file = fs::File::create(&partial).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&partial, path).await?;
    Ok(())
}
