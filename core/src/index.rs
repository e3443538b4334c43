use crate::volume::{FinalizedVolume, VolumeReader};
use crate::{ChunkID, ChunkLocation, VolumeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub size: u64,
    pub chunk_count: u32,
}

/// In-memory map from chunk identity to its physical location.
///
/// The index is derived entirely from the trailing tables of finalized
/// volumes and is never persisted on its own. Lookups take a shared lock and
/// `record` an exclusive one, so readers never see a half-inserted entry.
#[derive(Debug, Default)]
pub struct DedupIndex {
    chunks: RwLock<HashMap<ChunkID, ChunkLocation>>,
    volumes: RwLock<BTreeMap<VolumeId, VolumeInfo>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &ChunkID) -> Option<ChunkLocation> {
        self.chunks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .copied()
    }

    pub fn contains(&self, id: &ChunkID) -> bool {
        self.lookup(id).is_some()
    }

    /// Records a chunk location. The first recorded location wins; returns
    /// `false` when the chunk was already known.
    pub fn record(&self, id: ChunkID, location: ChunkLocation) -> bool {
        let mut chunks = self
            .chunks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if chunks.contains_key(&id) {
            return false;
        }
        chunks.insert(id, location);
        true
    }

    /// Merges the footer table of an opened volume.
    pub fn add_volume(&self, reader: &VolumeReader, size: u64) {
        self.merge_entries(
            reader.id(),
            size,
            reader.entries().iter().map(|e| (e.chunk_id(), e.location(reader.id()))),
        );
    }

    /// Registers a volume finalized during the current run. Its chunks were
    /// recorded as they were appended, so only the volume itself is new.
    pub fn add_finalized(&self, volume: &FinalizedVolume) {
        self.merge_entries(
            volume.id,
            volume.size,
            volume.entries.iter().map(|e| (e.chunk_id(), e.location(volume.id))),
        );
    }

    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.volumes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .copied()
            .collect()
    }

    /// Point-in-time copy of every known chunk.
    pub fn snapshot(&self) -> HashMap<ChunkID, ChunkLocation> {
        self.chunks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn merge_entries(
        &self,
        volume: VolumeId,
        size: u64,
        entries: impl Iterator<Item = (ChunkID, ChunkLocation)>,
    ) {
        let mut count = 0u32;
        {
            let mut chunks = self
                .chunks
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (id, location) in entries {
                chunks.entry(id).or_insert(location);
                count += 1;
            }
        }
        self.volumes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                volume,
                VolumeInfo {
                    id: volume,
                    size,
                    chunk_count: count,
                },
            );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id(n: u8) -> ChunkID {
        ChunkID::from_bytes([n; 32])
    }

    fn loc(seq: u32, offset: u64) -> ChunkLocation {
        ChunkLocation {
            volume: VolumeId::new(1, seq),
            offset,
            length: 10,
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let index = DedupIndex::new();
        assert!(index.lookup(&id(1)).is_none());
        assert!(index.record(id(1), loc(1, 52)));
        assert_eq!(index.lookup(&id(1)), Some(loc(1, 52)));
        assert!(index.contains(&id(1)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_first_location_wins() {
        let index = DedupIndex::new();
        assert!(index.record(id(1), loc(1, 52)));
        assert!(!index.record(id(1), loc(2, 90)));
        assert_eq!(index.lookup(&id(1)), Some(loc(1, 52)));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let index = Arc::new(DedupIndex::new());
        let writer = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for n in 0..200u8 {
                    index.record(id(n), loc(1, n as u64));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for n in 0..200u8 {
                        if let Some(found) = index.lookup(&id(n)) {
                            assert_eq!(found, loc(1, n as u64));
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(index.len(), 200);
    }
}
