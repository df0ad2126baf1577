//! Trace Scanner
//!
//! First pass over a trace. Sample payloads are copied into a
//! [`SampleStore`]; writes to the DPCM address and length registers are
//! latched and committed as a [`Reference`](crate::reference::Reference)
//! when the command group closes (at the next wait or the end of the trace).

use crate::constants::{BLOCK_SIZE, SAMPLE_LENGTH_UNIT};
use crate::hardware::ApuRegister;
use crate::reference::ReferenceTrace;
use crate::sample_store::SampleStore;
use crate::timing::StopSignal;
use crate::trace::{PayloadMode, TraceCommand, TraceSource};
use crate::Result;
use tracing::{debug, error, info, warn};

/// Result of scanning a whole trace
#[derive(Debug, Clone, Default)]
pub struct ScannedTrace {
    /// Sample region as written by the trace
    pub store: SampleStore,
    /// Deduplicated sample usage
    pub references: ReferenceTrace,
    /// Trace time at the end of the trace
    pub total_samples: u64,
    /// Trace time of the loop point, when the scan passed it
    pub loop_time: Option<u64>,
    /// Whether the trace carried any sample payload
    pub has_payloads: bool,
    /// Payloads rejected as malformed
    pub rejected_payloads: usize,
    /// Commands for other chips that were ignored
    pub unsupported_commands: usize,
}

impl ScannedTrace {
    /// Whether playback needs the bank cache at all
    pub fn has_sample_dependency(&self) -> bool {
        self.references.has_references()
    }
}

/// DPCM register state latched between command group boundaries
#[derive(Debug, Clone, Copy, Default)]
struct PendingSample {
    block: u16,
    byte_len: usize,
    dirty: bool,
}

impl PendingSample {
    fn latch(&mut self, register: ApuRegister, value: u8) {
        match register {
            ApuRegister::DmcAddress => self.block = u16::from(value),
            ApuRegister::DmcLength => self.byte_len = usize::from(value) * SAMPLE_LENGTH_UNIT,
            _ => return,
        }
        self.dirty = true;
    }

    fn take(&mut self) -> Option<(u16, usize)> {
        if self.dirty && self.byte_len > 0 {
            self.dirty = false;
            Some((self.block, self.byte_len))
        } else {
            None
        }
    }
}

/// Scan `source` from the start and rewind it afterwards
///
/// Returns `None` when `stop` was raised during the scan. Malformed
/// payloads and references are logged and skipped; a decode error ends the
/// scan as if the trace ended there.
pub fn scan<T: TraceSource + ?Sized>(
    source: &mut T,
    stop: &StopSignal,
) -> Result<Option<ScannedTrace>> {
    info!("Scanning trace");
    source.seek_start()?;

    let mut scanned = ScannedTrace::default();
    let mut pending = PendingSample::default();
    let mut time: u64 = 0;

    loop {
        if stop.is_stopped() {
            info!("Scan interrupted");
            return Ok(None);
        }
        if scanned.loop_time.is_none() && source.at_loop_point() {
            scanned.loop_time = Some(time);
        }

        let command = match source.next_command(PayloadMode::Load) {
            Ok(command) => command,
            Err(e) => {
                error!("Scan ended early: {}", e);
                TraceCommand::End
            }
        };

        match &command {
            TraceCommand::SamplePayload { address, data } => {
                if accept_payload(&mut scanned.store, time, *address, data) {
                    scanned.has_payloads = true;
                } else {
                    scanned.rejected_payloads += 1;
                }
            }
            TraceCommand::RegisterWrite { register, value } => {
                let dmc = ApuRegister::from_address(*register).filter(|r| r.is_dmc());
                if let Some(register) = dmc {
                    pending.latch(register, *value);
                }
            }
            TraceCommand::Unsupported(opcode) => {
                debug!("Ignoring command {:02X}", opcode);
                scanned.unsupported_commands += 1;
            }
            TraceCommand::Wait(_) | TraceCommand::End => {}
        }

        if command.closes_group() {
            if let Some((block, byte_len)) = pending.take() {
                let trace_time = u32::try_from(time).unwrap_or(u32::MAX);
                if let Err(e) = scanned
                    .references
                    .add_reference(&scanned.store, trace_time, block, byte_len)
                {
                    warn!("Unable to add sample reference at t={}: {}", time, e);
                }
            }
        }

        match command {
            TraceCommand::Wait(samples) => time += u64::from(samples),
            TraceCommand::End => break,
            _ => {}
        }
    }

    scanned.total_samples = time;
    if scanned.has_sample_dependency() {
        scanned.references.log_block_groups();
    } else if scanned.has_payloads {
        info!("Trace has unreferenced sample data");
    }

    source.seek_start()?;
    Ok(Some(scanned))
}

fn accept_payload(store: &mut SampleStore, time: u64, address: u16, data: &[u8]) -> bool {
    if data.is_empty() {
        error!("Invalid block length at ${:04X}", address);
        return false;
    }
    if usize::from(address) % BLOCK_SIZE != 0 {
        error!("Invalid block address ${:04X}", address);
        return false;
    }
    let trace_time = u32::try_from(time).unwrap_or(u32::MAX);
    match store.write(trace_time, address, data) {
        Ok(()) => true,
        Err(e) => {
            error!("Unable to load data block into map: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CommandTrace;

    fn write(register: u16, value: u8) -> TraceCommand {
        TraceCommand::RegisterWrite { register, value }
    }

    fn payload(address: u16, len: usize, fill: u8) -> TraceCommand {
        TraceCommand::SamplePayload {
            address,
            data: vec![fill; len],
        }
    }

    #[test]
    fn test_reference_committed_at_wait() {
        let mut trace = CommandTrace::new(vec![
            payload(0xC000, 256, 1),
            write(0x4012, 0),
            write(0x4013, 8),
            write(0x4015, 0x1F),
            TraceCommand::Wait(100),
            TraceCommand::Wait(50),
        ]);
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();

        let refs = scanned.references.references();
        assert_eq!(refs.len(), 1);
        assert_eq!((refs[0].time, refs[0].byte_len), (0, 128));
        assert_eq!(scanned.total_samples, 150);
        assert_eq!(trace.position(), 0);
    }

    #[test]
    fn test_zero_length_is_not_committed() {
        let mut trace = CommandTrace::new(vec![
            payload(0xC000, 64, 1),
            write(0x4012, 0),
            TraceCommand::Wait(10),
        ]);
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
        assert!(!scanned.has_sample_dependency());
        assert!(scanned.has_payloads);
    }

    #[test]
    fn test_other_channels_do_not_recommit() {
        let mut trace = CommandTrace::new(vec![
            payload(0xC000, 64, 1),
            write(0x4012, 0),
            write(0x4013, 4),
            write(0x4015, 0x1F),
            TraceCommand::Wait(10),
            write(0x4000, 0x3F),
            write(0x4015, 0x1F),
            TraceCommand::Wait(10),
            write(0x4010, 0x0F),
            TraceCommand::Wait(10),
        ]);
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();

        let refs = scanned.references.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].time, 0);
    }

    #[test]
    fn test_commit_at_end_of_trace() {
        let mut trace = CommandTrace::new(vec![
            payload(0xC000, 64, 1),
            TraceCommand::Wait(10),
            write(0x4012, 0),
            write(0x4013, 4),
            TraceCommand::End,
        ]);
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
        assert_eq!(scanned.references.references()[0].time, 10);
    }

    #[test]
    fn test_rejects_misaligned_and_empty_payloads() {
        let mut trace = CommandTrace::new(vec![
            payload(0xC010, 64, 1),
            payload(0xC000, 0, 1),
            payload(0x6000, 64, 1),
            TraceCommand::Unsupported(0x50),
        ]);
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
        assert_eq!(scanned.rejected_payloads, 3);
        assert_eq!(scanned.unsupported_commands, 1);
        assert!(!scanned.has_payloads);
    }

    #[test]
    fn test_stop_interrupts_scan() {
        let stop = StopSignal::new();
        stop.stop();
        let mut trace = CommandTrace::new(vec![TraceCommand::Wait(1)]);
        assert!(scan(&mut trace, &stop).unwrap().is_none());
    }

    #[test]
    fn test_records_loop_time() {
        let mut trace = CommandTrace::new(vec![
            TraceCommand::Wait(100),
            TraceCommand::Wait(20),
            TraceCommand::Wait(5),
        ])
        .with_loop(2);
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
        assert_eq!(scanned.loop_time, Some(120));
        assert_eq!(scanned.total_samples, 125);
    }

    #[test]
    fn test_largest_register_reference_fits() {
        let mut trace = CommandTrace::new(vec![
            payload(0xFFC0, 64, 1),
            write(0x4012, 0xFF),
            write(0x4013, 0xFF),
            TraceCommand::Wait(1),
        ]);
        // Block 255 + 4080 bytes continues at $8000
        let scanned = scan(&mut trace, &StopSignal::new()).unwrap().unwrap();
        assert_eq!(scanned.references.references().len(), 1);
        assert_eq!(scanned.references.references()[0].byte_len, 4080);
    }
}
