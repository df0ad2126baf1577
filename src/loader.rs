//! Incremental Loader
//!
//! Moves block group bytes into bank slots in bus-sized chunks, either all
//! at once (preloading) or a few blocks at a time so a transfer never
//! outlasts the slack of the current wait window.

use crate::constants::{BLOCK_SIZE, BUS_CHUNK_BYTES};
use crate::hardware::HardwareSink;
use crate::reference::{BlockGroup, GroupId};
use crate::{PlayerError, Result};
use tracing::{debug, info};

/// Result of one incremental transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProgress {
    /// Every byte of the group has been transferred
    Complete,
    /// More blocks remain; `blocks_loaded` is the new offset
    Partial {
        /// Blocks transferred so far
        blocks_loaded: u16,
    },
}

/// A claimed slot range whose bytes are still being transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLoad {
    /// Group being loaded
    pub group: GroupId,
    /// First slot claimed by the group
    pub slot: u8,
    /// Blocks already transferred
    pub blocks_loaded: u16,
}

impl PendingLoad {
    /// Start a load at offset zero
    pub fn new(group: GroupId, slot: u8) -> Self {
        PendingLoad {
            group,
            slot,
            blocks_loaded: 0,
        }
    }
}

/// Chunked block group transfer
#[derive(Debug, Clone, Copy)]
pub struct Loader {
    chunk_bytes: usize,
}

impl Default for Loader {
    fn default() -> Self {
        Loader {
            chunk_bytes: BUS_CHUNK_BYTES,
        }
    }
}

impl Loader {
    /// Loader with a custom chunk size (a multiple of 64, at most 256)
    pub fn new(chunk_bytes: usize) -> Result<Self> {
        if chunk_bytes == 0 || chunk_bytes > BUS_CHUNK_BYTES || chunk_bytes % BLOCK_SIZE != 0 {
            return Err(PlayerError::ConfigError(format!(
                "chunk size {} is not a multiple of {} up to {}",
                chunk_bytes, BLOCK_SIZE, BUS_CHUNK_BYTES
            )));
        }
        Ok(Loader { chunk_bytes })
    }

    /// Bytes per bus transfer
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Transfer a whole group starting at `slot`
    pub fn load_all<S: HardwareSink + ?Sized>(
        &self,
        sink: &mut S,
        group: &BlockGroup,
        slot: u8,
    ) -> Result<()> {
        let data = group_bytes(group)?;
        self.transfer(sink, data, slot, 0)?;
        info!(
            "Loaded {} bytes into ${:04X} [{}]",
            data.len(),
            crate::constants::block_address(u16::from(slot)),
            slot
        );
        Ok(())
    }

    /// Transfer up to `block_budget` more blocks of a group
    ///
    /// # Errors
    /// Returns [`PlayerError::Invariant`] when `blocks_loaded` is already at
    /// or past the end of the group, and propagates sink failures.
    pub fn load_increment<S: HardwareSink + ?Sized>(
        &self,
        sink: &mut S,
        group: &BlockGroup,
        slot: u8,
        blocks_loaded: u16,
        block_budget: u16,
    ) -> Result<LoadProgress> {
        let data = group_bytes(group)?;
        let offset = usize::from(blocks_loaded) * BLOCK_SIZE;
        if offset >= data.len() {
            return Err(PlayerError::Invariant(format!(
                "load offset {} is past end of {} byte group",
                offset,
                data.len()
            )));
        }

        let len = (data.len() - offset).min(usize::from(block_budget) * BLOCK_SIZE);
        if len > 0 {
            self.transfer(sink, &data[offset..offset + len], slot, blocks_loaded)?;
        }

        if offset + len == data.len() {
            debug!("Incremental load into [{}] complete", slot);
            Ok(LoadProgress::Complete)
        } else {
            Ok(LoadProgress::Partial {
                blocks_loaded: blocks_loaded + block_budget,
            })
        }
    }

    fn transfer<S: HardwareSink + ?Sized>(
        &self,
        sink: &mut S,
        data: &[u8],
        slot: u8,
        first_block: u16,
    ) -> Result<()> {
        let slots_per_chunk = self.chunk_bytes / BLOCK_SIZE;
        for (i, chunk) in data.chunks(self.chunk_bytes).enumerate() {
            let target = usize::from(slot) + usize::from(first_block) + i * slots_per_chunk;
            let target = u8::try_from(target).map_err(|_| {
                PlayerError::Invariant(format!("transfer target slot {} out of range", target))
            })?;
            sink.write_bytes(target, chunk)?;
        }
        Ok(())
    }
}

fn group_bytes(group: &BlockGroup) -> Result<&[u8]> {
    if group.is_retired() || group.data().is_empty() {
        return Err(PlayerError::Invariant(format!(
            "block group {:?} has no bytes to load",
            group.key()
        )));
    }
    Ok(group.data())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedApu;
    use crate::reference::ReferenceTrace;
    use crate::sample_store::SampleStore;

    fn trace_with_group(len: usize) -> (ReferenceTrace, GroupId, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let mut store = SampleStore::new();
        store.write(0, 0xC000, &bytes).unwrap();
        let mut trace = ReferenceTrace::new();
        let id = trace.add_reference(&store, 0, 0, len).unwrap();
        (trace, id, bytes)
    }

    #[test]
    fn test_load_all_chunks_by_four_slots() {
        let (trace, id, bytes) = trace_with_group(600);
        let mut apu = SimulatedApu::new();
        Loader::default().load_all(&mut apu, trace.group(id), 8).unwrap();

        let slots: Vec<(u8, usize)> = apu.transfers().iter().map(|t| (t.slot, t.len)).collect();
        assert_eq!(slots, vec![(8, 256), (12, 256), (16, 88)]);
        assert_eq!(apu.slot_bytes(8, 600), bytes.as_slice());
    }

    #[test]
    fn test_increment_partial_then_complete() {
        let (trace, id, bytes) = trace_with_group(10 * 64 + 10);
        let group = trace.group(id);
        let loader = Loader::default();
        let mut apu = SimulatedApu::new();

        let progress = loader.load_increment(&mut apu, group, 20, 0, 3).unwrap();
        assert_eq!(progress, LoadProgress::Partial { blocks_loaded: 3 });
        let progress = loader.load_increment(&mut apu, group, 20, 3, 0).unwrap();
        assert_eq!(progress, LoadProgress::Partial { blocks_loaded: 3 });
        let progress = loader.load_increment(&mut apu, group, 20, 3, 5).unwrap();
        assert_eq!(progress, LoadProgress::Partial { blocks_loaded: 8 });
        let progress = loader.load_increment(&mut apu, group, 20, 8, 120).unwrap();
        assert_eq!(progress, LoadProgress::Complete);

        assert_eq!(apu.bytes_transferred(), bytes.len());
        assert_eq!(apu.slot_bytes(20, bytes.len()), bytes.as_slice());
    }

    #[test]
    fn test_increment_offset_past_end() {
        let (trace, id, _) = trace_with_group(128);
        let mut apu = SimulatedApu::new();
        assert!(matches!(
            Loader::default().load_increment(&mut apu, trace.group(id), 8, 2, 1),
            Err(PlayerError::Invariant(_))
        ));
    }

    #[test]
    fn test_small_chunks() {
        let (trace, id, _) = trace_with_group(200);
        let mut apu = SimulatedApu::new();
        Loader::new(64).unwrap().load_all(&mut apu, trace.group(id), 8).unwrap();
        assert_eq!(apu.transfers().len(), 4);
        assert!(Loader::new(100).is_err());
    }
}
