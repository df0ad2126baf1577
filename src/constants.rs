//! NES APU Sample Window Constants
//!
//! Address map, block geometry and timing figures shared by the sample
//! store, bank cache and scheduler.

/// First CPU address of the DPCM-reachable sample region
pub const SAMPLE_REGION_START: u32 = 0x8000;

/// Size of the sample region in bytes ($8000-$FFFF)
pub const SAMPLE_REGION_SIZE: usize = 0x8000;

/// Bytes per addressing unit of the DPCM address register
pub const BLOCK_SIZE: usize = 64;

/// Number of blocks covering the sample region
pub const BLOCK_COUNT: usize = SAMPLE_REGION_SIZE / BLOCK_SIZE;

/// Block 0 is at $C000; blocks 256..511 cover $8000-$BFFF
pub const BLOCK_ZERO_ADDRESS: u32 = 0xC000;

/// Bytes per DPCM length register unit
pub const SAMPLE_LENGTH_UNIT: usize = 16;

/// Samples per second of VGM trace time
pub const VGM_SAMPLE_RATE: u32 = 44_100;

/// Lowest bank slot writable through the data bus
pub const SLOT_FIRST: u8 = 8;

/// Highest bank slot writable through the data bus
pub const SLOT_LAST: u8 = 127;

/// Largest single transfer accepted by the data bus
pub const BUS_CHUNK_BYTES: usize = 256;

/// Measured cost of moving one 64-byte block over the bus (3000-3500 us)
pub const TRANSFER_MICROS_PER_BLOCK: u64 = 3_500;

/// Cap on blocks moved in one wait window
pub const MAX_BLOCKS_PER_INCREMENT: u16 = 120;

/// Settle delay between a voice reset and a continuous-mode restart
pub const RESTART_SETTLE_MILLIS: u64 = 500;

/// Idle time before the amplifier is switched off
pub const IDLE_SHUTOFF_MILLIS: u64 = 1_000;

/// Number of blocks needed to hold `len` bytes, rounded up
#[inline]
pub fn blocks_for_len(len: usize) -> u16 {
    len.div_ceil(BLOCK_SIZE) as u16
}

/// Block identifier containing a CPU address in the sample region
///
/// Returns `None` for addresses below $8000.
#[inline]
pub fn block_for_address(address: u16) -> Option<u16> {
    let address = u32::from(address);
    if address < SAMPLE_REGION_START {
        return None;
    }
    let region = SAMPLE_REGION_SIZE as u32;
    let offset = (address + region - BLOCK_ZERO_ADDRESS) % region;
    Some((offset as usize / BLOCK_SIZE) as u16)
}

/// CPU address of the first byte of a block (or bank slot)
#[inline]
pub fn block_address(block: u16) -> u16 {
    let offset = (usize::from(block) % BLOCK_COUNT) * BLOCK_SIZE;
    let address = (BLOCK_ZERO_ADDRESS as usize - SAMPLE_REGION_START as usize + offset)
        % SAMPLE_REGION_SIZE
        + SAMPLE_REGION_START as usize;
    address as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_for_len_rounds_up() {
        assert_eq!(blocks_for_len(0), 0);
        assert_eq!(blocks_for_len(1), 1);
        assert_eq!(blocks_for_len(64), 1);
        assert_eq!(blocks_for_len(65), 2);
        assert_eq!(blocks_for_len(4080), 64);
    }

    #[test]
    fn test_block_address_map() {
        assert_eq!(block_for_address(0xC000), Some(0));
        assert_eq!(block_for_address(0xFFC0), Some(255));
        assert_eq!(block_for_address(0x8000), Some(256));
        assert_eq!(block_for_address(0xBFFF), Some(511));
        assert_eq!(block_for_address(0x7FFF), None);

        assert_eq!(block_address(0), 0xC000);
        assert_eq!(block_address(8), 0xC200);
        assert_eq!(block_address(255), 0xFFC0);
        assert_eq!(block_address(256), 0x8000);
        assert_eq!(block_address(511), 0xBFC0);
    }
}
