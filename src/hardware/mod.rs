//! NES APU hardware interface
//!
//! The player reaches the APU through a [`HardwareSink`]: single register
//! writes plus bulk transfers into the 64-byte bank slots of the sample
//! window. The bus is shared with other devices, so [`SharedBus`] takes the
//! lock around every individual call.

pub mod sim;

pub use sim::{ApuWrite, SimulatedApu, SlotTransfer};

use crate::Result;
use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Memory-mapped APU registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum ApuRegister {
    /// Pulse 1 duty, envelope and volume
    Pulse1Control = 0x4000,
    /// Pulse 1 sweep unit
    Pulse1Sweep = 0x4001,
    /// Pulse 1 timer low byte
    Pulse1TimerLow = 0x4002,
    /// Pulse 1 length counter and timer high bits
    Pulse1TimerHigh = 0x4003,
    /// Pulse 2 duty, envelope and volume
    Pulse2Control = 0x4004,
    /// Pulse 2 sweep unit
    Pulse2Sweep = 0x4005,
    /// Pulse 2 timer low byte
    Pulse2TimerLow = 0x4006,
    /// Pulse 2 length counter and timer high bits
    Pulse2TimerHigh = 0x4007,
    /// Triangle linear counter
    TriangleControl = 0x4008,
    /// Triangle timer low byte
    TriangleTimerLow = 0x400A,
    /// Triangle length counter and timer high bits
    TriangleTimerHigh = 0x400B,
    /// Noise envelope and volume
    NoiseControl = 0x400C,
    /// Noise mode and period
    NoisePeriod = 0x400E,
    /// Noise length counter
    NoiseLength = 0x400F,
    /// DMC IRQ, loop flag and rate
    DmcControl = 0x4010,
    /// DMC direct output level
    DmcLoad = 0x4011,
    /// DMC sample start block
    DmcAddress = 0x4012,
    /// DMC sample length in 16-byte units
    DmcLength = 0x4013,
    /// Channel enable and status
    Status = 0x4015,
    /// Frame counter mode
    FrameCounter = 0x4017,
}

impl ApuRegister {
    /// Register at a CPU address, if it is one of the named APU registers
    pub fn from_address(address: u16) -> Option<Self> {
        <Self as FromPrimitive>::from_u16(address)
    }

    /// CPU address of the register
    pub fn address(self) -> u16 {
        self as u16
    }

    /// Whether the register belongs to the DPCM channel
    pub fn is_dmc(self) -> bool {
        matches!(
            self,
            ApuRegister::DmcControl
                | ApuRegister::DmcLoad
                | ApuRegister::DmcAddress
                | ApuRegister::DmcLength
        )
    }
}

bitflags! {
    /// Channel enable bits of the status register ($4015)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ApuChannels: u8 {
        /// Pulse 1
        const PULSE1 = 0x01;
        /// Pulse 2
        const PULSE2 = 0x02;
        /// Triangle
        const TRIANGLE = 0x04;
        /// Noise
        const NOISE = 0x08;
        /// DPCM sample channel
        const DMC = 0x10;
    }
}

impl ApuChannels {
    /// Decode a status register value
    pub fn from_register(value: u8) -> Self {
        ApuChannels::from_bits_truncate(value)
    }
}

/// Register writes that silence every channel
const SILENCE_SEQUENCE: [(ApuRegister, u8); 8] = [
    (ApuRegister::Status, 0x00),
    (ApuRegister::DmcControl, 0x00),
    (ApuRegister::DmcLoad, 0x00),
    (ApuRegister::Pulse1Control, 0x30),
    (ApuRegister::Pulse2Control, 0x30),
    (ApuRegister::TriangleControl, 0x80),
    (ApuRegister::NoiseControl, 0x30),
    (ApuRegister::FrameCounter, 0x40),
];

/// Write the silencing register sequence to a sink
pub fn silence_voices<S: HardwareSink + ?Sized>(sink: &mut S) -> Result<()> {
    for (register, value) in SILENCE_SEQUENCE {
        sink.write_register(register.address(), value)?;
    }
    Ok(())
}

/// Bus-attached NES APU
pub trait HardwareSink {
    /// Write one APU register
    fn write_register(&mut self, register: u16, value: u8) -> Result<()>;

    /// Copy up to one bus chunk into consecutive bank slots starting at `slot`
    fn write_bytes(&mut self, slot: u8, bytes: &[u8]) -> Result<()>;

    /// Switch the output amplifier
    fn set_amplifier_enabled(&mut self, enabled: bool) -> Result<()>;

    /// Return every voice to silence
    fn reset_voices(&mut self) -> Result<()> {
        silence_voices(self)
    }
}

impl<S: HardwareSink + ?Sized> HardwareSink for &mut S {
    fn write_register(&mut self, register: u16, value: u8) -> Result<()> {
        (**self).write_register(register, value)
    }

    fn write_bytes(&mut self, slot: u8, bytes: &[u8]) -> Result<()> {
        (**self).write_bytes(slot, bytes)
    }

    fn set_amplifier_enabled(&mut self, enabled: bool) -> Result<()> {
        (**self).set_amplifier_enabled(enabled)
    }

    fn reset_voices(&mut self) -> Result<()> {
        (**self).reset_voices()
    }
}

impl<S: HardwareSink + ?Sized> HardwareSink for Box<S> {
    fn write_register(&mut self, register: u16, value: u8) -> Result<()> {
        (**self).write_register(register, value)
    }

    fn write_bytes(&mut self, slot: u8, bytes: &[u8]) -> Result<()> {
        (**self).write_bytes(slot, bytes)
    }

    fn set_amplifier_enabled(&mut self, enabled: bool) -> Result<()> {
        (**self).set_amplifier_enabled(enabled)
    }

    fn reset_voices(&mut self) -> Result<()> {
        (**self).reset_voices()
    }
}

/// Sink shared with other bus users; each call holds the bus lock
#[derive(Debug, Default)]
pub struct SharedBus<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedBus<S> {
    fn clone(&self) -> Self {
        SharedBus {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> SharedBus<S> {
    /// Wrap a sink
    pub fn new(sink: S) -> Self {
        SharedBus {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Take the bus for a sequence of operations
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }
}

impl<S: HardwareSink> HardwareSink for SharedBus<S> {
    fn write_register(&mut self, register: u16, value: u8) -> Result<()> {
        self.inner.lock().write_register(register, value)
    }

    fn write_bytes(&mut self, slot: u8, bytes: &[u8]) -> Result<()> {
        self.inner.lock().write_bytes(slot, bytes)
    }

    fn set_amplifier_enabled(&mut self, enabled: bool) -> Result<()> {
        self.inner.lock().set_amplifier_enabled(enabled)
    }

    fn reset_voices(&mut self) -> Result<()> {
        self.inner.lock().reset_voices()
    }
}
