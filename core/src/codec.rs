//! Chunk codec: identity hashing, compression and authenticated encryption.
//!
//! Encoding compresses first and encrypts second. Each chunk is sealed under
//! a fresh IV from the codec's [`IvSequence`], and its [`ChunkID`] is bound
//! into the AEAD as associated data so a record cannot be passed off as a
//! different chunk.

use crate::compress::Compression;
use crate::crypto::{DataKeys, Encryptor, IvSequence, NONCE_LEN};
use crate::{ChunkID, Error, Result};

#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub id: ChunkID,
    pub iv: [u8; NONCE_LEN],
    pub data: Vec<u8>,
    pub plaintext_len: u32,
    pub compressed_len: u32,
}

impl EncodedChunk {
    pub fn encoded_len(&self) -> u32 {
        self.data.len() as u32
    }
}

pub struct ChunkCodec {
    chunk_id_key: [u8; 32],
    encryptor: Encryptor,
    compression: Compression,
    max_plaintext_len: usize,
    ivs: IvSequence,
}

impl ChunkCodec {
    pub fn new(keys: &DataKeys, compression: Compression, max_plaintext_len: usize) -> Result<Self> {
        Ok(Self {
            chunk_id_key: keys.chunk_id_key,
            encryptor: Encryptor::new(&keys.encryption_key)?,
            compression,
            max_plaintext_len,
            ivs: IvSequence::new(),
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn chunk_id(&self, plaintext: &[u8]) -> ChunkID {
        ChunkID::from_data(&self.chunk_id_key, plaintext)
    }

    /// Incremental hasher producing the same keyed digest as [`ChunkCodec::chunk_id`].
    pub fn content_hasher(&self) -> blake3::Hasher {
        blake3::Hasher::new_keyed(&self.chunk_id_key)
    }

    pub fn encode(&self, plaintext: &[u8]) -> Result<EncodedChunk> {
        let id = self.chunk_id(plaintext);
        self.encode_with_id(id, plaintext)
    }

    /// Encodes `plaintext` whose identity has already been computed.
    pub fn encode_with_id(&self, id: ChunkID, plaintext: &[u8]) -> Result<EncodedChunk> {
        if plaintext.len() > self.max_plaintext_len {
            return Err(Error::Other(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                plaintext.len(),
                self.max_plaintext_len
            )));
        }
        let compressed = self.compression.compress(plaintext)?;
        let iv = self.ivs.next_iv()?;
        let data = self.encryptor.encrypt_with_nonce(&iv, &compressed, id.as_bytes())?;

        Ok(EncodedChunk {
            id,
            iv,
            data,
            plaintext_len: plaintext.len() as u32,
            compressed_len: compressed.len() as u32,
        })
    }

    /// Reverses [`ChunkCodec::encode`], failing with [`Error::Integrity`] when the
    /// ciphertext was tampered with or the plaintext does not hash to `expected`.
    pub fn decode(&self, encoded: &[u8], iv: &[u8; NONCE_LEN], expected: &ChunkID) -> Result<Vec<u8>> {
        let compressed = self
            .encryptor
            .decrypt_with_nonce(iv, encoded, expected.as_bytes())
            .map_err(|_| Error::integrity(expected, "authentication failed"))?;
        let plaintext = self
            .compression
            .decompress(&compressed, self.max_plaintext_len)
            .map_err(|e| Error::integrity(expected, e.to_string()))?;

        let actual = self.chunk_id(&plaintext);
        if actual != *expected {
            return Err(Error::integrity(
                expected,
                format!("plaintext hashes to {}", actual.short_string()),
            ));
        }
        Ok(plaintext)
    }
}
