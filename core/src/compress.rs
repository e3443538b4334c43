use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression applied to chunk plaintext before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zlib,
}

impl Compression {
    pub fn as_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zlib => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Compression::None),
            1 => Some(Compression::Zlib),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Compression::None),
            "zlib" => Ok(Compression::Zlib),
            other => Err(Error::InvalidConfig(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
        }
    }

    /// Inflates `data`, refusing to produce more than `max_len` bytes.
    pub fn decompress(self, data: &[u8], max_len: usize) -> Result<Vec<u8>> {
        match self {
            Compression::None => {
                if data.len() > max_len {
                    return Err(Error::Other(format!(
                        "stored chunk exceeds declared size ({} > {max_len})",
                        data.len()
                    )));
                }
                Ok(data.to_vec())
            }
            Compression::Zlib => {
                let decoder = flate2::read::ZlibDecoder::new(data);
                let mut result = Vec::with_capacity(max_len);
                decoder
                    .take(max_len as u64 + 1)
                    .read_to_end(&mut result)
                    .map_err(|e| Error::Other(format!("zlib: {e}")))?;
                if result.len() > max_len {
                    return Err(Error::Other(format!(
                        "decompressed chunk exceeds declared size of {max_len} bytes"
                    )));
                }
                Ok(result)
            }
        }
    }
}
