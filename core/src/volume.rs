//! Physical volume format.
//!
//! ```text
//! header  : "CAIRNVOL" | version u16 | increment u32 | sequence u32 |
//!           cipher u8 | compression u8 | salt [32]
//! record* : encoded length u32 | iv [24] | encoded bytes
//! footer  : table (bincode Vec<FooterEntry>) | table length u64 |
//!           chunk count u32 | blake3 checksum [32] | "CAIRNEND"
//! ```
//!
//! The checksum covers every byte that precedes it. Volumes are written
//! under a `.vol.part` name and renamed into place only once the footer is
//! on disk, so a `.vol` file without a valid footer is corrupt, never "in
//! progress".

use crate::codec::EncodedChunk;
use crate::compress::Compression;
use crate::crypto::{CipherId, NONCE_LEN};
use crate::{ChunkID, ChunkLocation, Error, Result, VolumeId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const VOLUME_MAGIC: &[u8; 8] = b"CAIRNVOL";
pub const FOOTER_MAGIC: &[u8; 8] = b"CAIRNEND";
pub const VOLUME_FORMAT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 8 + 2 + 4 + 4 + 1 + 1 + 32;
pub const RECORD_PREFIX_SIZE: usize = 4 + NONCE_LEN;
/// Table length, chunk count, checksum and magic.
pub const TRAILER_SIZE: usize = 8 + 4 + 32 + 8;
/// Serialized size of one [`FooterEntry`] in the bincode table.
const FOOTER_ENTRY_SIZE: u64 = 32 + 8 + 4 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHeader {
    pub version: u16,
    pub volume: VolumeId,
    pub cipher: CipherId,
    pub compression: Compression,
    pub salt: [u8; 32],
}

impl VolumeHeader {
    pub fn new(volume: VolumeId, cipher: CipherId, compression: Compression, salt: [u8; 32]) -> Self {
        Self {
            version: VOLUME_FORMAT_VERSION,
            volume,
            cipher,
            compression,
            salt,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(VOLUME_MAGIC);
        out[8..10].copy_from_slice(&self.version.to_le_bytes());
        out[10..14].copy_from_slice(&self.volume.increment.to_le_bytes());
        out[14..18].copy_from_slice(&self.volume.sequence.to_le_bytes());
        out[18] = self.cipher.as_u8();
        out[19] = self.compression.as_u8();
        out[20..52].copy_from_slice(&self.salt);
        out
    }

    pub fn parse(bytes: &[u8], volume: &str) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || &bytes[0..8] != VOLUME_MAGIC {
            return Err(Error::corrupt_volume(volume, "bad header magic"));
        }
        let version = u16::from_le_bytes([bytes[8], bytes[9]]);
        if version != VOLUME_FORMAT_VERSION {
            return Err(Error::corrupt_volume(
                volume,
                format!("unsupported format version {version}"),
            ));
        }
        let increment = u32::from_le_bytes(le4(&bytes[10..14]));
        let sequence = u32::from_le_bytes(le4(&bytes[14..18]));
        let cipher = CipherId::from_u8(bytes[18])
            .ok_or_else(|| Error::corrupt_volume(volume, format!("unknown cipher id {}", bytes[18])))?;
        let compression = Compression::from_u8(bytes[19]).ok_or_else(|| {
            Error::corrupt_volume(volume, format!("unknown compression id {}", bytes[19]))
        })?;
        let mut salt = [0u8; 32];
        salt.copy_from_slice(&bytes[20..52]);

        Ok(Self {
            version,
            volume: VolumeId::new(increment, sequence),
            cipher,
            compression,
            salt,
        })
    }
}

/// One row of a volume's trailing chunk table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterEntry {
    pub chunk: [u8; 32],
    /// Start of the record (its length prefix) within the volume.
    pub offset: u64,
    pub length: u32,
    pub plaintext_length: u32,
    pub compressed_length: u32,
}

impl FooterEntry {
    pub fn chunk_id(&self) -> ChunkID {
        ChunkID::from_bytes(self.chunk)
    }

    pub fn location(&self, volume: VolumeId) -> ChunkLocation {
        ChunkLocation {
            volume,
            offset: self.offset,
            length: self.length,
        }
    }
}

/// Summary of a volume whose footer has been durably written.
#[derive(Debug, Clone)]
pub struct FinalizedVolume {
    pub id: VolumeId,
    pub path: PathBuf,
    pub size: u64,
    pub entries: Vec<FooterEntry>,
    pub checksum: [u8; 32],
}

/// Encoded bytes of one record as read back from a volume.
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub iv: [u8; NONCE_LEN],
    pub data: Vec<u8>,
}

/// Append-only writer for a single volume. Exactly one writer owns a
/// volume's append cursor.
pub struct VolumeWriter {
    id: VolumeId,
    partial_path: PathBuf,
    final_path: PathBuf,
    out: BufWriter<File>,
    hasher: blake3::Hasher,
    position: u64,
    entries: Vec<FooterEntry>,
}

impl VolumeWriter {
    pub fn create(dir: &Path, header: VolumeHeader) -> Result<Self> {
        let id = header.volume;
        let partial_path = dir.join(id.partial_file_name());
        let final_path = dir.join(id.file_name());
        if final_path.exists() {
            return Err(Error::Other(format!("volume {id} already exists")));
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial_path)?;

        let mut writer = Self {
            id,
            partial_path,
            final_path,
            out: BufWriter::new(file),
            hasher: blake3::Hasher::new(),
            position: 0,
            entries: Vec::new(),
        };
        writer.write_hashed(&header.to_bytes())?;
        debug!("Opened volume {}", id);
        Ok(writer)
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.position
    }

    pub fn chunk_count(&self) -> usize {
        self.entries.len()
    }

    /// Size the finalized volume would have after appending `encoded_len` more bytes.
    pub fn projected_size(&self, encoded_len: usize) -> u64 {
        let entries = self.entries.len() as u64 + 1;
        self.position
            + (RECORD_PREFIX_SIZE + encoded_len) as u64
            + 8
            + entries * FOOTER_ENTRY_SIZE
            + TRAILER_SIZE as u64
    }

    /// Appends one record and returns its offset within the volume.
    pub fn append_chunk(&mut self, chunk: &EncodedChunk) -> Result<u64> {
        let offset = self.position;
        self.write_hashed(&chunk.encoded_len().to_le_bytes())?;
        self.write_hashed(&chunk.iv)?;
        self.write_hashed(&chunk.data)?;
        self.entries.push(FooterEntry {
            chunk: *chunk.id.as_bytes(),
            offset,
            length: chunk.encoded_len(),
            plaintext_length: chunk.plaintext_len,
            compressed_length: chunk.compressed_len,
        });
        Ok(offset)
    }

    /// Writes the footer, syncs, and moves the volume to its final name.
    pub fn finalize(mut self) -> Result<FinalizedVolume> {
        let table = bincode::serialize(&self.entries)
            .map_err(|e| Error::Other(format!("failed to encode volume table: {e}")))?;
        self.write_hashed(&table)?;
        self.write_hashed(&(table.len() as u64).to_le_bytes())?;
        self.write_hashed(&(self.entries.len() as u32).to_le_bytes())?;

        let checksum = *self.hasher.finalize().as_bytes();
        self.out.write_all(&checksum)?;
        self.out.write_all(FOOTER_MAGIC)?;
        self.position += (checksum.len() + FOOTER_MAGIC.len()) as u64;

        let file = self
            .out
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.partial_path, &self.final_path)?;
        sync_dir(self.final_path.parent());

        debug!(
            "Finalized volume {} ({} chunks, {} bytes)",
            self.id,
            self.entries.len(),
            self.position
        );
        Ok(FinalizedVolume {
            id: self.id,
            path: self.final_path,
            size: self.position,
            entries: self.entries,
            checksum,
        })
    }

    fn write_hashed(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }
}

/// A sequence of volumes for one backup run. Rolls over to a new volume
/// whenever the next chunk would push the current one past the size cap.
pub struct VolumeSet {
    dir: PathBuf,
    increment: u32,
    next_sequence: u32,
    max_volume_size: u64,
    cipher: CipherId,
    compression: Compression,
    salt: [u8; 32],
    current: Option<VolumeWriter>,
    finalized: Vec<FinalizedVolume>,
}

impl VolumeSet {
    pub fn new(
        dir: impl Into<PathBuf>,
        increment: u32,
        first_sequence: u32,
        max_volume_size: u64,
        cipher: CipherId,
        compression: Compression,
        salt: [u8; 32],
    ) -> Self {
        Self {
            dir: dir.into(),
            increment,
            next_sequence: first_sequence,
            max_volume_size,
            cipher,
            compression,
            salt,
            current: None,
            finalized: Vec::new(),
        }
    }

    pub fn append(&mut self, chunk: &EncodedChunk) -> Result<ChunkLocation> {
        let len = chunk.data.len();
        let full = match &self.current {
            Some(writer) => {
                writer.chunk_count() > 0 && writer.projected_size(len) > self.max_volume_size
            }
            None => false,
        };
        if full {
            self.finalize_current()?;
        }
        let writer = match self.current.take() {
            Some(writer) => writer,
            None => self.open_next()?,
        };
        let writer = self.current.insert(writer);
        let offset = writer.append_chunk(chunk)?;
        Ok(ChunkLocation {
            volume: writer.id(),
            offset,
            length: chunk.encoded_len(),
        })
    }

    pub fn finalized(&self) -> &[FinalizedVolume] {
        &self.finalized
    }

    /// Finalizes the open volume (if any) and returns every volume of the run.
    pub fn finish(mut self) -> Result<Vec<FinalizedVolume>> {
        self.finalize_current()?;
        Ok(self.finalized)
    }

    fn open_next(&mut self) -> Result<VolumeWriter> {
        let id = VolumeId::new(self.increment, self.next_sequence);
        self.next_sequence += 1;
        let header = VolumeHeader::new(id, self.cipher, self.compression, self.salt);
        VolumeWriter::create(&self.dir, header)
    }

    fn finalize_current(&mut self) -> Result<()> {
        if let Some(writer) = self.current.take() {
            let volume = writer.finalize()?;
            self.finalized.push(volume);
        }
        Ok(())
    }
}

/// Read handle on a finalized volume. Reads are positioned, so one reader
/// can be shared by any number of threads.
#[derive(Debug)]
pub struct VolumeReader {
    id: VolumeId,
    file: File,
    header: VolumeHeader,
    entries: Vec<FooterEntry>,
    table_start: u64,
    checksum: [u8; 32],
}

impl VolumeReader {
    /// Opens a volume and validates its footer and whole-volume checksum.
    pub fn open(path: &Path, expected: VolumeId) -> Result<Self> {
        let name = expected.to_string();
        let mut file = File::open(path)
            .map_err(|e| Error::corrupt_volume(&name, format!("cannot open: {e}")))?;
        let len = file.metadata()?.len();
        if len < (HEADER_SIZE + TRAILER_SIZE) as u64 {
            return Err(Error::corrupt_volume(&name, "truncated"));
        }

        let mut trailer = [0u8; TRAILER_SIZE];
        read_exact_at(&file, &mut trailer, len - TRAILER_SIZE as u64)?;
        if &trailer[44..52] != FOOTER_MAGIC {
            return Err(Error::corrupt_volume(&name, "missing footer"));
        }
        let table_len = u64::from_le_bytes(le8(&trailer[0..8]));
        let count = u32::from_le_bytes(le4(&trailer[8..12]));
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&trailer[12..44]);

        let table_start = (len - TRAILER_SIZE as u64)
            .checked_sub(table_len)
            .filter(|start| *start >= HEADER_SIZE as u64)
            .ok_or_else(|| Error::corrupt_volume(&name, "footer table out of bounds"))?;

        let hashed_len = len - (32 + FOOTER_MAGIC.len()) as u64;
        let mut hasher = blake3::Hasher::new();
        file.seek(SeekFrom::Start(0))?;
        let copied = std::io::copy(&mut (&mut file).take(hashed_len), &mut hasher)?;
        if copied != hashed_len || *hasher.finalize().as_bytes() != checksum {
            return Err(Error::corrupt_volume(&name, "checksum mismatch"));
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut header_bytes, 0)?;
        let header = VolumeHeader::parse(&header_bytes, &name)?;
        if header.volume != expected {
            return Err(Error::corrupt_volume(
                &name,
                format!("header names volume {}", header.volume),
            ));
        }

        let mut table = vec![0u8; table_len as usize];
        read_exact_at(&file, &mut table, table_start)?;
        let entries: Vec<FooterEntry> = bincode::deserialize(&table)
            .map_err(|e| Error::corrupt_volume(&name, format!("unreadable chunk table: {e}")))?;
        if entries.len() != count as usize {
            return Err(Error::corrupt_volume(&name, "chunk count mismatch"));
        }
        for entry in &entries {
            let end = entry.offset + RECORD_PREFIX_SIZE as u64 + entry.length as u64;
            if entry.offset < HEADER_SIZE as u64 || end > table_start {
                return Err(Error::corrupt_volume(&name, "chunk record out of bounds"));
            }
        }

        Ok(Self {
            id: expected,
            file,
            header,
            entries,
            table_start,
            checksum,
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn entries(&self) -> &[FooterEntry] {
        &self.entries
    }

    pub fn checksum(&self) -> &[u8; 32] {
        &self.checksum
    }

    pub fn read_chunk(&self, offset: u64, length: u32) -> Result<EncodedRecord> {
        let end = offset + RECORD_PREFIX_SIZE as u64 + length as u64;
        if offset < HEADER_SIZE as u64 || end > self.table_start {
            return Err(Error::corrupt_volume(
                self.id,
                format!("read of {length} bytes at {offset} is out of bounds"),
            ));
        }
        let mut buf = vec![0u8; RECORD_PREFIX_SIZE + length as usize];
        read_exact_at(&self.file, &mut buf, offset)?;

        let stored = u32::from_le_bytes(le4(&buf[0..4]));
        if stored != length {
            return Err(Error::corrupt_volume(
                self.id,
                format!("record at {offset} has length {stored}, expected {length}"),
            ));
        }
        let mut iv = [0u8; NONCE_LEN];
        iv.copy_from_slice(&buf[4..RECORD_PREFIX_SIZE]);
        buf.drain(..RECORD_PREFIX_SIZE);
        Ok(EncodedRecord { iv, data: buf })
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut std::mem::take(&mut buf)[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn sync_dir(dir: Option<&Path>) {
    #[cfg(unix)]
    {
        if let Some(handle) = dir.and_then(|d| File::open(d).ok()) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}
