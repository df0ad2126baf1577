//! Sample Store
//!
//! Holds the full 32 KiB DPCM sample region as seen by the trace, together
//! with the trace time at which every 64-byte block was last written.
//!
//! Bytes are kept in block order rather than CPU address order: position 0
//! is $C000 (block 0), position $4000 is $8000 (block 256). In that layout
//! the DPCM wrap from $FFFF to $8000 is contiguous and only the end of the
//! buffer wraps back to the start, so every copy splits into at most two
//! contiguous pieces.

use crate::constants::{
    block_for_address, BLOCK_COUNT, BLOCK_SIZE, SAMPLE_REGION_SIZE, SAMPLE_REGION_START,
};
use crate::{PlayerError, Result};
use tracing::debug;

/// Trace-time stamped copy of the DPCM sample region
#[derive(Clone)]
pub struct SampleStore {
    data: Box<[u8]>,
    block_times: Box<[u32]>,
}

impl SampleStore {
    /// Create an empty store; every block starts stamped at time 0
    pub fn new() -> Self {
        SampleStore {
            data: vec![0u8; SAMPLE_REGION_SIZE].into_boxed_slice(),
            block_times: vec![0u32; BLOCK_COUNT].into_boxed_slice(),
        }
    }

    /// Copy a sample payload into the store and stamp the touched blocks
    ///
    /// Bytes addressed below $8000 are dropped; a payload running past $FFFF
    /// continues at $8000. At most one full region (32 KiB) is kept.
    ///
    /// # Errors
    /// Returns [`PlayerError::InvalidPayload`] for an empty payload or one
    /// lying entirely below the sample region.
    pub fn write(&mut self, trace_time: u32, address: u16, bytes: &[u8]) -> Result<()> {
        let invalid = || PlayerError::InvalidPayload {
            address,
            len: bytes.len(),
        };
        if bytes.is_empty() {
            return Err(invalid());
        }

        let mut start = u32::from(address);
        let mut payload = bytes;
        if start < SAMPLE_REGION_START {
            let skip = (SAMPLE_REGION_START - start) as usize;
            if skip >= payload.len() {
                return Err(invalid());
            }
            payload = &payload[skip..];
            start = SAMPLE_REGION_START;
        }
        let payload = &payload[..payload.len().min(SAMPLE_REGION_SIZE)];

        let first_block = block_for_address(start as u16).ok_or_else(invalid)?;
        let position = usize::from(first_block) * BLOCK_SIZE + (start as usize % BLOCK_SIZE);
        self.copy_in(position, payload);

        let last_position = position + payload.len() - 1;
        let block_span = last_position / BLOCK_SIZE - position / BLOCK_SIZE + 1;
        for i in 0..block_span {
            let block = (usize::from(first_block) + i) % BLOCK_COUNT;
            self.block_times[block] = self.block_times[block].max(trace_time);
        }

        debug!(
            "[{}] sample data: ${:04X} + ${:04X} -> blocks {}..+{}",
            trace_time,
            start,
            payload.len(),
            first_block,
            block_span
        );
        Ok(())
    }

    /// Latest write time over the blocks spanned by `byte_length` bytes at `block`
    ///
    /// # Errors
    /// Returns [`PlayerError::OutOfRange`] when the span would run past the
    /// last addressable block.
    pub fn last_write_time(&self, block: u16, byte_length: usize) -> Result<u32> {
        let span = self.block_span(block, byte_length)?;
        Ok(self.block_times[span].iter().copied().max().unwrap_or(0))
    }

    /// Copy `byte_length` bytes starting at `block` into `out`
    ///
    /// `out` must hold at least `byte_length` bytes.
    pub fn read(&self, block: u16, byte_length: usize, out: &mut [u8]) -> Result<()> {
        if usize::from(block) >= BLOCK_COUNT || byte_length > SAMPLE_REGION_SIZE {
            return Err(PlayerError::OutOfRange {
                block,
                len: byte_length,
            });
        }
        if out.len() < byte_length {
            return Err(format!(
                "read buffer holds {} bytes, {} requested",
                out.len(),
                byte_length
            )
            .into());
        }

        let position = usize::from(block) * BLOCK_SIZE;
        let first = byte_length.min(SAMPLE_REGION_SIZE - position);
        out[..first].copy_from_slice(&self.data[position..position + first]);
        if first < byte_length {
            out[first..byte_length].copy_from_slice(&self.data[..byte_length - first]);
        }
        Ok(())
    }

    /// Stamp recorded for a single block
    pub fn block_time(&self, block: u16) -> Option<u32> {
        self.block_times.get(usize::from(block)).copied()
    }

    fn block_span(&self, block: u16, byte_length: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::from(block);
        let count = byte_length.div_ceil(BLOCK_SIZE).max(1);
        if start >= BLOCK_COUNT || start + count > BLOCK_COUNT {
            return Err(PlayerError::OutOfRange {
                block,
                len: byte_length,
            });
        }
        Ok(start..start + count)
    }

    fn copy_in(&mut self, position: usize, payload: &[u8]) {
        let first = payload.len().min(SAMPLE_REGION_SIZE - position);
        self.data[position..position + first].copy_from_slice(&payload[..first]);
        if first < payload.len() {
            let rest = payload.len() - first;
            self.data[..rest].copy_from_slice(&payload[first..]);
        }
    }
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let written = self.block_times.iter().filter(|&&t| t > 0).count();
        f.debug_struct("SampleStore")
            .field("stamped_blocks", &written)
            .finish()
    }
}
