//! Player configuration
//!
//! Timing calibration and slot window settings. Defaults describe the
//! reference board: 44.1 kHz trace time, bank slots 8..=127, 256-byte bus
//! transfers costing about 3.5 ms per 64-byte block.

use crate::constants::{
    BLOCK_SIZE, BUS_CHUNK_BYTES, IDLE_SHUTOFF_MILLIS, MAX_BLOCKS_PER_INCREMENT,
    RESTART_SETTLE_MILLIS, SLOT_FIRST, SLOT_LAST, TRANSFER_MICROS_PER_BLOCK, VGM_SAMPLE_RATE,
};
use crate::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;

/// What happens when the trace reaches its end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Play once and stop
    #[default]
    Once,
    /// Jump to the trace's loop point when it has one
    Loop,
    /// Reset the APU and restart from the beginning
    Continuous,
}

/// Player configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Trace samples per second
    pub sample_rate: u32,
    /// First bank slot the cache may use
    pub slot_first: u8,
    /// Last bank slot the cache may use
    pub slot_last: u8,
    /// Bytes per bus transfer (a multiple of 64)
    pub bus_chunk_bytes: usize,
    /// Calibrated cost of transferring one 64-byte block
    pub transfer_micros_per_block: u64,
    /// Cap on blocks transferred in one wait window
    pub max_blocks_per_increment: u16,
    /// Pause after a voice reset before a continuous-mode restart
    pub restart_settle_millis: u64,
    /// Idle time before the player service powers the amplifier down
    pub idle_shutoff_millis: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            sample_rate: VGM_SAMPLE_RATE,
            slot_first: SLOT_FIRST,
            slot_last: SLOT_LAST,
            bus_chunk_bytes: BUS_CHUNK_BYTES,
            transfer_micros_per_block: TRANSFER_MICROS_PER_BLOCK,
            max_blocks_per_increment: MAX_BLOCKS_PER_INCREMENT,
            restart_settle_millis: RESTART_SETTLE_MILLIS,
            idle_shutoff_millis: IDLE_SHUTOFF_MILLIS,
        }
    }
}

impl PlayerConfig {
    /// Calibration for a 1 MHz bus clock
    pub fn fast_bus() -> Self {
        PlayerConfig {
            transfer_micros_per_block: 900,
            ..Default::default()
        }
    }

    /// Restrict the cache to a slot window
    pub fn with_slots(mut self, slots: RangeInclusive<u8>) -> Self {
        self.slot_first = *slots.start();
        self.slot_last = *slots.end();
        self
    }

    /// Slot window as a range
    pub fn slots(&self) -> RangeInclusive<u8> {
        self.slot_first..=self.slot_last
    }

    /// Number of slots in the window
    pub fn slot_count(&self) -> u16 {
        u16::from(self.slot_last) - u16::from(self.slot_first) + 1
    }

    /// Real time covered by `samples` of trace time
    pub fn wait_micros(&self, samples: u64) -> u64 {
        samples * 1_000_000 / u64::from(self.sample_rate)
    }

    /// Blocks that fit in `micros` of spare time, capped per increment
    pub fn block_budget(&self, micros: u64) -> u16 {
        let blocks = micros / self.transfer_micros_per_block;
        blocks.min(u64::from(self.max_blocks_per_increment)) as u16
    }

    /// Check the settings against the hardware limits
    ///
    /// # Errors
    /// Returns [`PlayerError::ConfigError`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(PlayerError::ConfigError(
                "sample_rate must be non-zero".to_string(),
            ));
        }
        if self.slot_first < SLOT_FIRST
            || self.slot_last > SLOT_LAST
            || self.slot_first > self.slot_last
        {
            return Err(PlayerError::ConfigError(format!(
                "slot window {}..={} outside {}..={}",
                self.slot_first, self.slot_last, SLOT_FIRST, SLOT_LAST
            )));
        }
        if self.bus_chunk_bytes == 0
            || self.bus_chunk_bytes > BUS_CHUNK_BYTES
            || self.bus_chunk_bytes % BLOCK_SIZE != 0
        {
            return Err(PlayerError::ConfigError(format!(
                "bus_chunk_bytes must be a multiple of {} up to {}",
                BLOCK_SIZE, BUS_CHUNK_BYTES
            )));
        }
        if self.transfer_micros_per_block == 0 {
            return Err(PlayerError::ConfigError(
                "transfer_micros_per_block must be non-zero".to_string(),
            ));
        }
        if self.max_blocks_per_increment == 0 {
            return Err(PlayerError::ConfigError(
                "max_blocks_per_increment must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)
            .map_err(|e| PlayerError::ConfigError(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PlayerError::ConfigError(format!("cannot serialize: {}", e)))
    }
}
