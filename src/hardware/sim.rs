//! Simulated bus-attached APU
//!
//! Models the register file, the 128-slot sample bank and the transfer
//! limits of the real device, and records every operation so playback can
//! be inspected. Attached to a [`VirtualClock`] it also charges the bus
//! cost of each call to the clock.

use super::{silence_voices, ApuChannels, ApuRegister, HardwareSink};
use crate::constants::{BLOCK_SIZE, BUS_CHUNK_BYTES, SLOT_FIRST, SLOT_LAST};
use crate::timing::{Clock, VirtualClock};
use crate::{PlayerError, Result};

/// Slots addressable by the bank (0..=127)
const BANK_SLOTS: usize = SLOT_LAST as usize + 1;

/// A recorded register write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApuWrite {
    /// CPU address of the register
    pub register: u16,
    /// Value written
    pub value: u8,
    /// Clock time of the write (0 without a clock)
    pub at: u64,
}

/// A recorded bank transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTransfer {
    /// First slot written
    pub slot: u8,
    /// Bytes written
    pub len: usize,
    /// Clock time of the transfer (0 without a clock)
    pub at: u64,
}

#[derive(Debug, Clone)]
struct BusTiming {
    clock: VirtualClock,
    register_micros: u64,
    block_micros: u64,
}

/// In-memory NES APU
#[derive(Debug, Clone)]
pub struct SimulatedApu {
    registers: [u8; 0x100],
    bank: Vec<u8>,
    writes: Vec<ApuWrite>,
    transfers: Vec<SlotTransfer>,
    amplifier: bool,
    resets: usize,
    timing: Option<BusTiming>,
    fail_after: Option<usize>,
    operations: usize,
}

impl SimulatedApu {
    /// Create a silent device with an empty bank
    pub fn new() -> Self {
        SimulatedApu {
            registers: [0; 0x100],
            bank: vec![0; BANK_SLOTS * BLOCK_SIZE],
            writes: Vec::new(),
            transfers: Vec::new(),
            amplifier: false,
            resets: 0,
            timing: None,
            fail_after: None,
            operations: 0,
        }
    }

    /// Charge every call to `clock`
    pub fn with_clock(
        mut self,
        clock: VirtualClock,
        register_micros: u64,
        block_micros: u64,
    ) -> Self {
        self.timing = Some(BusTiming {
            clock,
            register_micros,
            block_micros,
        });
        self
    }

    /// Fail every bus operation after `operations` successful ones
    pub fn fail_after(mut self, operations: usize) -> Self {
        self.fail_after = Some(operations);
        self
    }

    /// Last value written to a register
    pub fn register(&self, address: u16) -> u8 {
        self.registers[usize::from(address & 0xFF)]
    }

    /// Channels enabled through the status register
    pub fn enabled_channels(&self) -> ApuChannels {
        ApuChannels::from_register(self.register(ApuRegister::Status.address()))
    }

    /// Bank contents starting at `slot`
    pub fn slot_bytes(&self, slot: u8, len: usize) -> &[u8] {
        let start = usize::from(slot) * BLOCK_SIZE;
        let end = (start + len).min(self.bank.len());
        &self.bank[start..end]
    }

    /// All register writes in order
    pub fn writes(&self) -> &[ApuWrite] {
        &self.writes
    }

    /// Values written to one register, in order
    pub fn writes_to(&self, register: u16) -> Vec<u8> {
        self.writes
            .iter()
            .filter(|w| w.register == register)
            .map(|w| w.value)
            .collect()
    }

    /// All bank transfers in order
    pub fn transfers(&self) -> &[SlotTransfer] {
        &self.transfers
    }

    /// Total bytes moved into the bank
    pub fn bytes_transferred(&self) -> usize {
        self.transfers.iter().map(|t| t.len).sum()
    }

    /// Amplifier state
    pub fn amplifier_enabled(&self) -> bool {
        self.amplifier
    }

    /// Number of voice resets
    pub fn reset_count(&self) -> usize {
        self.resets
    }

    fn begin_operation(&mut self) -> Result<u64> {
        if let Some(limit) = self.fail_after {
            if self.operations >= limit {
                return Err(PlayerError::HardwareError("bus write not acknowledged".to_string()));
            }
        }
        self.operations += 1;
        Ok(self.timing.as_ref().map_or(0, |t| t.clock.now_micros()))
    }

    fn charge(&self, micros: impl Fn(&BusTiming) -> u64) {
        if let Some(timing) = &self.timing {
            timing.clock.advance(micros(timing));
        }
    }
}

impl Default for SimulatedApu {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareSink for SimulatedApu {
    fn write_register(&mut self, register: u16, value: u8) -> Result<()> {
        if !(0x4000..=0x40FF).contains(&register) {
            return Err(PlayerError::HardwareError(format!(
                "register ${:04X} outside the APU",
                register
            )));
        }
        let at = self.begin_operation()?;
        self.registers[usize::from(register & 0xFF)] = value;
        self.writes.push(ApuWrite {
            register,
            value,
            at,
        });
        self.charge(|t| t.register_micros);
        Ok(())
    }

    fn write_bytes(&mut self, slot: u8, bytes: &[u8]) -> Result<()> {
        if !(SLOT_FIRST..=SLOT_LAST).contains(&slot) {
            return Err(PlayerError::HardwareError(format!(
                "slot {} outside the writable bank",
                slot
            )));
        }
        if bytes.is_empty() || bytes.len() > BUS_CHUNK_BYTES {
            return Err(PlayerError::HardwareError(format!(
                "transfer of {} bytes (1..={} allowed)",
                bytes.len(),
                BUS_CHUNK_BYTES
            )));
        }
        let start = usize::from(slot) * BLOCK_SIZE;
        if start + bytes.len() > self.bank.len() {
            return Err(PlayerError::HardwareError(format!(
                "transfer at slot {} runs past the bank",
                slot
            )));
        }

        let at = self.begin_operation()?;
        self.bank[start..start + bytes.len()].copy_from_slice(bytes);
        self.transfers.push(SlotTransfer {
            slot,
            len: bytes.len(),
            at,
        });
        let blocks = bytes.len().div_ceil(BLOCK_SIZE) as u64;
        self.charge(|t| t.block_micros * blocks);
        Ok(())
    }

    fn set_amplifier_enabled(&mut self, enabled: bool) -> Result<()> {
        self.begin_operation()?;
        self.amplifier = enabled;
        Ok(())
    }

    fn reset_voices(&mut self) -> Result<()> {
        self.resets += 1;
        silence_voices(self)
    }
}
