use crate::{Error, KdfParams, Result};
use argon2::Argon2;
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

const CHUNK_ID_CONTEXT: &str = "cairn 2024-06 chunk identity key";
const ENCRYPTION_CONTEXT: &str = "cairn 2024-06 chunk encryption key";
const MANIFEST_CONTEXT: &str = "cairn 2024-06 manifest encryption key";

/// Cipher identifier recorded in the archive config and every volume header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherId {
    XChaCha20Poly1305,
}

impl CipherId {
    pub fn as_u8(self) -> u8 {
        match self {
            CipherId::XChaCha20Poly1305 => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CipherId::XChaCha20Poly1305),
            _ => None,
        }
    }
}

pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Derives the key-encryption key from the operator secret.
    pub fn derive_from_password(password: &str, params: &KdfParams) -> Result<Self> {
        if params.algorithm != "argon2id" {
            return Err(Error::Encryption(format!(
                "Unsupported KDF algorithm: {}",
                params.algorithm
            )));
        }

        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(
                params.memory,
                params.iterations,
                params.parallelism,
                Some(KEY_LEN),
            )
            .map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(password.as_bytes(), &params.salt, &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Encryption("Key must be 32 bytes".to_string()))?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

/// Sub-keys derived from the archive data key.
pub struct DataKeys {
    pub chunk_id_key: [u8; KEY_LEN],
    pub encryption_key: [u8; KEY_LEN],
    pub manifest_key: [u8; KEY_LEN],
}

impl DataKeys {
    pub fn derive(data_key: &MasterKey) -> Self {
        Self {
            chunk_id_key: blake3::derive_key(CHUNK_ID_CONTEXT, data_key.as_bytes()),
            encryption_key: blake3::derive_key(ENCRYPTION_CONTEXT, data_key.as_bytes()),
            manifest_key: blake3::derive_key(MANIFEST_CONTEXT, data_key.as_bytes()),
        }
    }
}

pub struct Encryptor {
    cipher: XChaCha20Poly1305,
}

impl Encryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| Error::Encryption("Key must be 32 bytes".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypts with a fresh random nonce and prepends it to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self.encrypt_with_nonce(&nonce, plaintext, &[])?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(Error::Encryption("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        self.decrypt_with_nonce(&nonce, encrypted, &[])
    }

    /// Encrypts `plaintext` under an explicit nonce, authenticating `aad` alongside it.
    pub fn encrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|e| Error::Encryption(e.to_string()))
    }

    pub fn decrypt_with_nonce(
        &self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

/// Hands out chunk IVs: a random per-session prefix followed by a
/// big-endian counter. A sequence never yields the same IV twice.
pub struct IvSequence {
    prefix: [u8; 16],
    counter: AtomicU64,
}

impl IvSequence {
    pub fn new() -> Self {
        let mut prefix = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut prefix);
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_iv(&self) -> Result<[u8; NONCE_LEN]> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        if counter == u64::MAX {
            return Err(Error::Encryption("IV counter exhausted".to_string()));
        }
        let mut iv = [0u8; NONCE_LEN];
        iv[..16].copy_from_slice(&self.prefix);
        iv[16..].copy_from_slice(&counter.to_be_bytes());
        Ok(iv)
    }

    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

impl Default for IvSequence {
    fn default() -> Self {
        Self::new()
    }
}
