use crate::{Error, Result};
use fastcdc::v2020::{FastCDC, StreamCDC};
use serde::{Deserialize, Serialize};
use std::io::Read;

// Bounds accepted by the FastCDC 2020 implementation.
const MIN_SIZE_RANGE: (u32, u32) = (64, 1024 * 1024);
const AVG_SIZE_RANGE: (u32, u32) = (256, 4 * 1024 * 1024);
const MAX_SIZE_RANGE: (u32, u32) = (1024, 16 * 1024 * 1024);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerLimits {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkerLimits {
    pub fn new(avg_size: u32) -> Self {
        Self {
            min_size: avg_size / 4,
            avg_size,
            max_size: avg_size.saturating_mul(4),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: u32, (lo, hi): (u32, u32)| v >= lo && v <= hi;
        if !in_range(self.min_size, MIN_SIZE_RANGE)
            || !in_range(self.avg_size, AVG_SIZE_RANGE)
            || !in_range(self.max_size, MAX_SIZE_RANGE)
        {
            return Err(Error::InvalidConfig(format!(
                "chunk sizes out of range: min={} avg={} max={}",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        if !(self.min_size <= self.avg_size && self.avg_size <= self.max_size) {
            return Err(Error::InvalidConfig(
                "chunk sizes must satisfy min <= avg <= max".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ChunkerLimits {
    fn default() -> Self {
        Self::new(4 * 1024 * 1024)
    }
}

pub struct Chunker {
    limits: ChunkerLimits,
}

impl Chunker {
    pub fn new(limits: ChunkerLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self { limits })
    }

    pub fn limits(&self) -> ChunkerLimits {
        self.limits
    }

    pub fn chunk_data(&self, data: &[u8]) -> Vec<Chunk> {
        let ChunkerLimits { min_size, avg_size, max_size } = self.limits;
        FastCDC::new(data, min_size, avg_size, max_size)
            .map(|chunk| Chunk {
                offset: chunk.offset as u64,
                data: data[chunk.offset..chunk.offset + chunk.length].to_vec(),
            })
            .collect()
    }

    /// Streams chunks out of `reader`, holding at most one maximum-size
    /// chunk in memory at a time.
    pub fn chunk_reader<R: Read>(&self, reader: R) -> impl Iterator<Item = Result<Chunk>> + use<R> {
        let ChunkerLimits { min_size, avg_size, max_size } = self.limits;
        StreamCDC::new(reader, min_size, avg_size, max_size).map(|item| match item {
            Ok(chunk) => Ok(Chunk {
                offset: chunk.offset,
                data: chunk.data,
            }),
            Err(fastcdc::v2020::Error::IoError(e)) => Err(Error::Io(e)),
            Err(e) => Err(Error::Other(format!("chunking failed: {e:?}"))),
        })
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            limits: ChunkerLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
