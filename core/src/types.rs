use crate::chunker::ChunkerLimits;
use crate::compress::Compression;
use crate::crypto::CipherId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identity of a chunk: keyed BLAKE3 digest of its plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkID(blake3::Hash);

impl ChunkID {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn from_data(key: &[u8; 32], data: &[u8]) -> Self {
        Self(blake3::keyed_hash(key, data))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for ChunkID {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl PartialOrd for ChunkID {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkID {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl FromStr for ChunkID {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self::from_bytes(array))
    }
}

impl Serialize for ChunkID {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkID {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChunkID::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ChunkID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A volume is addressed by the increment that wrote it and its sequence
/// number within that increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId {
    pub increment: u32,
    pub sequence: u32,
}

impl VolumeId {
    pub const EXTENSION: &'static str = "vol";
    pub const PARTIAL_EXTENSION: &'static str = "vol.part";

    pub fn new(increment: u32, sequence: u32) -> Self {
        Self { increment, sequence }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self, Self::EXTENSION)
    }

    pub fn partial_file_name(&self) -> String {
        format!("{}.{}", self, Self::PARTIAL_EXTENSION)
    }

    /// Parses a finalized volume file name such as `i00000003-v0001.vol`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".vol")?;
        let (inc, seq) = stem.strip_prefix('i')?.split_once("-v")?;
        Some(Self {
            increment: inc.parse().ok()?,
            sequence: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{:08}-v{:04}", self.increment, self.sequence)
    }
}

/// Where the encoded bytes of a chunk live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub volume: VolumeId,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Tombstone,
}

/// One filesystem object as of one increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative, `/`-separated path without leading or trailing separators.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: i64,
    /// Opaque platform metadata produced by the metadata adapter.
    #[serde(with = "b64", default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkID>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    /// Keyed digest of the whole file content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ChunkID>,
    /// Increment in which this version of the entry was first recorded.
    pub origin: u32,
}

impl FileEntry {
    pub fn tombstone(path: impl Into<String>, increment: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::Tombstone,
            size: 0,
            mtime: 0,
            metadata: Vec::new(),
            chunks: Vec::new(),
            symlink_target: None,
            content_hash: None,
            origin: increment,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, EntryKind::Tombstone)
    }
}

/// Persistent, immutable configuration of one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub version: u32,
    pub id: String,
    pub kdf_params: KdfParams,
    #[serde(with = "b64")]
    pub wrapped_key: Vec<u8>,
    pub cipher: CipherId,
    pub compression: Compression,
    pub chunker: ChunkerLimits,
    pub volume_size: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
}

impl KdfParams {
    pub const SALT_LEN: usize = 32;

    /// Salt as the fixed-size array carried in every volume header.
    pub fn salt_array(&self) -> [u8; 32] {
        let mut salt = [0u8; Self::SALT_LEN];
        let len = self.salt.len().min(Self::SALT_LEN);
        salt[..len].copy_from_slice(&self.salt[..len]);
        salt
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; Self::SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations: 2,
            memory: 65536,
            parallelism: 4,
            salt,
        }
    }
}

/// Serde adapter storing byte vectors as base64 strings.
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_hex_roundtrip() {
        let id = ChunkID::from_data(&[7u8; 32], b"hello");
        let parsed: ChunkID = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short_string().len(), 8);
    }

    #[test]
    fn test_chunk_id_is_keyed() {
        let a = ChunkID::from_data(&[1u8; 32], b"hello");
        let b = ChunkID::from_data(&[2u8; 32], b"hello");
        assert_ne!(a, b);
        assert_eq!(a, ChunkID::from_data(&[1u8; 32], b"hello"));
    }

    #[test]
    fn test_volume_file_names() {
        let id = VolumeId::new(3, 12);
        assert_eq!(id.file_name(), "i00000003-v0012.vol");
        assert_eq!(id.partial_file_name(), "i00000003-v0012.vol.part");
        assert_eq!(VolumeId::from_file_name(&id.file_name()), Some(id));
        assert_eq!(VolumeId::from_file_name(&id.partial_file_name()), None);
        assert_eq!(VolumeId::from_file_name("notes.txt"), None);
    }

    #[test]
    fn test_file_entry_serialization_skips_empty_fields() {
        let entry = FileEntry::tombstone("docs/old.txt", 4);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("chunks"));
        assert!(!json.contains("metadata"));
        let back: FileEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert!(back.is_tombstone());
    }
}
