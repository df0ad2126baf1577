#![allow(dead_code)]

use std::cell::Cell;

use vgm_apu_player::hardware::SimulatedApu;
use vgm_apu_player::scheduler::PlaybackSession;
use vgm_apu_player::timing::{Clock, StopSignal, VirtualClock};
use vgm_apu_player::trace::{CommandTrace, TraceCommand};
use vgm_apu_player::PlayerConfig;

pub type SimSession<C = VirtualClock> = PlaybackSession<CommandTrace, SimulatedApu, C>;

pub fn write(register: u16, value: u8) -> TraceCommand {
    TraceCommand::RegisterWrite { register, value }
}

/// Sample payload of `len` bytes counting up from `seed`
pub fn payload(address: u16, len: usize, seed: u8) -> TraceCommand {
    TraceCommand::SamplePayload {
        address,
        data: sample_bytes(len, seed),
    }
}

pub fn sample_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// DPCM address and length writes followed by a channel enable
pub fn trigger(block: u8, length_units: u8) -> Vec<TraceCommand> {
    vec![write(0x4012, block), write(0x4013, length_units), write(0x4015, 0x1F)]
}

/// Simulated APU charging `register_micros` per write and the configured cost per block
pub fn device(config: &PlayerConfig, register_micros: u64) -> (SimulatedApu, VirtualClock) {
    let clock = VirtualClock::new();
    let apu = SimulatedApu::new().with_clock(
        clock.clone(),
        register_micros,
        config.transfer_micros_per_block,
    );
    (apu, clock)
}

pub fn session(trace: CommandTrace, config: PlayerConfig) -> (SimSession, VirtualClock) {
    let (apu, clock) = device(&config, 0);
    let session = PlaybackSession::new(trace, apu, clock.clone(), config).unwrap();
    (session, clock)
}

/// Virtual clock that raises a stop on its `stop_on`-th sleep
pub struct StoppingClock {
    inner: VirtualClock,
    stop: StopSignal,
    stop_on: u32,
    sleeps: Cell<u32>,
}

impl StoppingClock {
    pub fn new(inner: VirtualClock, stop: StopSignal, stop_on: u32) -> Self {
        StoppingClock {
            inner,
            stop,
            stop_on,
            sleeps: Cell::new(0),
        }
    }
}

impl Clock for StoppingClock {
    fn now_micros(&self) -> u64 {
        self.inner.now_micros()
    }

    fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool {
        let sleeps = self.sleeps.get() + 1;
        self.sleeps.set(sleeps);
        if sleeps >= self.stop_on {
            self.stop.stop();
        }
        self.inner.sleep_until(deadline, stop)
    }
}

pub fn stopping_session(
    trace: CommandTrace,
    config: PlayerConfig,
    stop_on: u32,
) -> SimSession<StoppingClock> {
    let (apu, clock) = device(&config, 0);
    let stop = StopSignal::new();
    let clock = StoppingClock::new(clock, stop.clone(), stop_on);
    PlaybackSession::new(trace, apu, clock, config)
        .unwrap()
        .with_stop_signal(stop)
}

pub const VGM_DATA_OFFSET: usize = 0xC0;

/// Minimal VGM 1.61 file for the NES APU around `commands`
///
/// `loop_at` is an offset into `commands`.
pub fn vgm_file(commands: &[u8], loop_at: Option<usize>, total_samples: u32) -> Vec<u8> {
    let mut data = vec![0u8; VGM_DATA_OFFSET];
    data[..4].copy_from_slice(b"Vgm ");
    let eof = (VGM_DATA_OFFSET + commands.len() - 4) as u32;
    data[0x04..0x08].copy_from_slice(&eof.to_le_bytes());
    data[0x08..0x0C].copy_from_slice(&0x161u32.to_le_bytes());
    data[0x18..0x1C].copy_from_slice(&total_samples.to_le_bytes());
    if let Some(offset) = loop_at {
        let relative = (VGM_DATA_OFFSET + offset - 0x1C) as u32;
        data[0x1C..0x20].copy_from_slice(&relative.to_le_bytes());
    }
    data[0x34..0x38].copy_from_slice(&((VGM_DATA_OFFSET - 0x34) as u32).to_le_bytes());
    data[0x84..0x88].copy_from_slice(&1_789_772u32.to_le_bytes());
    data.extend_from_slice(commands);
    data
}

/// VGM data block writing `bytes` to CPU address `address`
pub fn vgm_ram_write(address: u16, bytes: &[u8]) -> Vec<u8> {
    let mut block = vec![0x67, 0x66, 0xC2];
    block.extend_from_slice(&((bytes.len() + 2) as u32).to_le_bytes());
    block.extend_from_slice(&address.to_le_bytes());
    block.extend_from_slice(bytes);
    block
}

/// VGM NES APU register write
pub fn vgm_apu_write(register: u16, value: u8) -> [u8; 3] {
    [0xB4, (register - 0x4000) as u8, value]
}
