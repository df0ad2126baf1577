//! Playback Scheduler
//!
//! Replays a trace against a [`HardwareSink`] in real time. Register writes
//! are issued as they are decoded; every wait window is measured against an
//! absolute deadline so bus time spent on register I/O and on sample
//! transfers is subtracted from the sleep, and an overrun shortens the next
//! window instead of delaying the audio further.
//!
//! Sample bank management happens at command group boundaries: once the
//! group that used the head [`Reference`] has been dispatched, the next
//! reference's block group is made resident and its bytes trickle into the
//! bank during the following wait windows.

use crate::cache::{BankCache, Residency};
use crate::config::{PlayerConfig, RepeatMode};
use crate::hardware::{ApuRegister, HardwareSink};
use crate::loader::{LoadProgress, Loader, PendingLoad};
use crate::reference::{GroupId, GroupKey, Reference};
use crate::scanner::{scan, ScannedTrace};
use crate::timing::{Clock, StopSignal};
use crate::trace::{PayloadMode, TraceCommand, TraceSource};
use crate::{PlayerError, Result};
use tracing::{debug, error, info, warn};

/// Phase of a playback session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing prepared
    #[default]
    Idle,
    /// Scanning the trace and filling the bank
    Preloading,
    /// Dispatching commands
    Playing,
    /// Jumping back to the loop point
    Looping,
    /// Waiting out the settle delay before a continuous restart
    Restarting,
    /// Playback ended
    Stopped,
}

/// How a call to [`PlaybackSession::play`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The trace ran to its end
    Finished,
    /// A stop was requested
    Stopped,
}

/// Counters collected while playing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Commands decoded
    pub commands: u64,
    /// Register writes issued
    pub register_writes: u64,
    /// Sample address writes rewritten to a bank slot
    pub remapped_writes: u64,
    /// Remapped writes issued while the group was still loading
    pub partial_writes: u64,
    /// Sample address writes left at their logical value
    pub unmapped_writes: u64,
    /// Groups transferred before playback started
    pub preloaded_groups: u64,
    /// Incremental transfers issued
    pub load_increments: u64,
    /// Blocks moved by incremental transfers
    pub blocks_loaded: u64,
    /// Groups that found no room in the bank
    pub cache_failures: u64,
    /// Wait windows that ended after their deadline
    pub late_windows: u64,
    /// Largest overrun of a deadline
    pub max_lateness_micros: u64,
    /// Jumps to the loop point
    pub loops: u32,
    /// Continuous-mode restarts
    pub restarts: u32,
}

/// Bank state of one scanned pass over the trace
#[derive(Debug)]
struct Track {
    scanned: ScannedTrace,
    cache: BankCache,
    head: Option<Reference>,
    loads: Vec<PendingLoad>,
}

impl Track {
    fn new(scanned: ScannedTrace, config: &PlayerConfig) -> Self {
        Track {
            scanned,
            cache: BankCache::from_config(config),
            head: None,
            loads: Vec::new(),
        }
    }

    fn has_sample_dependency(&self) -> bool {
        self.scanned.has_sample_dependency()
    }

    fn is_loading(&self, id: GroupId) -> bool {
        self.loads.iter().any(|load| load.group == id)
    }

    /// Slots of groups whose bytes are completely in the bank
    fn placements(&self) -> Vec<(GroupKey, u8)> {
        self.scanned
            .references
            .groups()
            .filter(|(id, _)| !self.is_loading(*id))
            .filter_map(|(_, group)| Some((group.key(), group.slot()?)))
            .collect()
    }

    /// Fill the bank for playback starting at trace time `from`
    ///
    /// Without `preload` only the adopted groups and the first claim are
    /// set up; every transfer is left to the wait windows.
    fn prime<S: HardwareSink + ?Sized>(
        &mut self,
        from: u64,
        placements: &[(GroupKey, u8)],
        preload: Option<(&Loader, &mut S)>,
        stats: &mut PlaybackStats,
    ) -> Result<()> {
        let references = &mut self.scanned.references;
        if from > 0 {
            let skipped = references.skip_until(from)?;
            debug!("Skipped {} reference(s) before t={}", skipped, from);
        }
        self.cache.adopt(references, placements);
        if let Some((loader, sink)) = preload {
            let loaded = self.cache.preload(references, loader, sink)?;
            stats.preloaded_groups += loaded as u64;
        }

        self.head = self.scanned.references.take_next()?;
        if let Some(head) = self.head {
            self.claim(head.group, None, trace_time(from), stats)?;
        }
        Ok(())
    }

    fn claim(
        &mut self,
        group: GroupId,
        active: Option<GroupId>,
        now: u32,
        stats: &mut PlaybackStats,
    ) -> Result<()> {
        match self
            .cache
            .ensure_resident(&mut self.scanned.references, group, active, now)
        {
            Ok(Residency::Resident { .. }) => Ok(()),
            Ok(Residency::Claimed { slot, evicted }) => {
                self.loads.retain(|load| !evicted.contains(&load.group));
                self.loads.push(PendingLoad::new(group, slot));
                Ok(())
            }
            Err(PlayerError::CacheExhausted { blocks }) => {
                warn!("Load abandoned: no room for {} blocks at t={}", blocks, now);
                stats.cache_failures += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Move past the head reference once its command group went out at `now`
    fn advance(&mut self, now: u64, stats: &mut PlaybackStats) -> Result<()> {
        let Some(current) = self.head else {
            return Ok(());
        };
        if u64::from(current.time) != now {
            return Ok(());
        }

        self.head = self.scanned.references.take_next()?;
        self.scanned.references.retire_if_spent(current.group);
        if let Some(next) = self.head {
            self.claim(next.group, Some(current.group), trace_time(now), stats)?;
        }
        Ok(())
    }

    /// Bank slot replacing a sample address written at `now`
    fn map_address(&self, now: u64, stats: &mut PlaybackStats) -> Option<u8> {
        let head = self.head?;
        if u64::from(head.time) != now {
            return None;
        }
        match self.scanned.references.group(head.group).slot() {
            Some(slot) => {
                if self.is_loading(head.group) {
                    debug!("Playing partially loaded group at [{}]", slot);
                    stats.partial_writes += 1;
                }
                stats.remapped_writes += 1;
                Some(slot)
            }
            None => {
                warn!("Referenced block not loaded at t={}", now);
                stats.unmapped_writes += 1;
                None
            }
        }
    }

    /// Pending load to continue next, the head group's first
    fn next_load(&self) -> Option<usize> {
        if self.loads.is_empty() {
            return None;
        }
        let head = self.head.map(|reference| reference.group);
        self.loads
            .iter()
            .position(|load| Some(load.group) == head)
            .or(Some(0))
    }

    /// Spend the time left before `deadline` on pending loads
    fn load_window<S: HardwareSink + ?Sized, C: Clock + ?Sized>(
        &mut self,
        loader: &Loader,
        sink: &mut S,
        clock: &C,
        config: &PlayerConfig,
        deadline: u64,
        stats: &mut PlaybackStats,
    ) -> Result<()> {
        while let Some(index) = self.next_load() {
            let now = clock.now_micros();
            if now >= deadline {
                break;
            }
            let budget = config.block_budget(deadline - now);
            if budget == 0 {
                break;
            }

            let load = self.loads[index];
            let group = self.scanned.references.group(load.group);
            let total = group.block_size();
            let progress =
                loader.load_increment(sink, group, load.slot, load.blocks_loaded, budget)?;
            stats.load_increments += 1;

            match progress {
                LoadProgress::Complete => {
                    stats.blocks_loaded += u64::from(total - load.blocks_loaded);
                    self.loads.remove(index);
                }
                LoadProgress::Partial { blocks_loaded } => {
                    stats.blocks_loaded += u64::from(blocks_loaded - load.blocks_loaded);
                    self.loads[index].blocks_loaded = blocks_loaded;
                }
            }
        }
        Ok(())
    }
}

fn trace_time(time: u64) -> u32 {
    u32::try_from(time).unwrap_or(u32::MAX)
}

/// One track being played on one device
///
/// ```no_run
/// use vgm_apu_player::hardware::SimulatedApu;
/// use vgm_apu_player::scheduler::PlaybackSession;
/// use vgm_apu_player::timing::MonotonicClock;
/// use vgm_apu_player::trace::{CommandTrace, TraceCommand};
/// use vgm_apu_player::PlayerConfig;
///
/// let trace = CommandTrace::new(vec![TraceCommand::Wait(735)]);
/// let mut session = PlaybackSession::new(
///     trace,
///     SimulatedApu::new(),
///     MonotonicClock::new(),
///     PlayerConfig::default(),
/// )?;
/// session.prepare()?;
/// session.play()?;
/// # Ok::<(), vgm_apu_player::PlayerError>(())
/// ```
pub struct PlaybackSession<T, S, C> {
    trace: T,
    sink: S,
    clock: C,
    config: PlayerConfig,
    repeat: RepeatMode,
    loader: Loader,
    stop: StopSignal,
    track: Option<Track>,
    state: SessionState,
    stats: PlaybackStats,
    /// Trace time of the command group being dispatched
    time: u64,
    /// Clock time at which the current pass started
    origin: u64,
    /// Samples waited since `origin`
    elapsed: u64,
}

impl<T: TraceSource, S: HardwareSink, C: Clock> PlaybackSession<T, S, C> {
    /// Create a session
    ///
    /// # Errors
    /// Returns [`PlayerError::ConfigError`] when `config` does not validate.
    pub fn new(trace: T, sink: S, clock: C, config: PlayerConfig) -> Result<Self> {
        config.validate()?;
        let loader = Loader::new(config.bus_chunk_bytes)?;
        Ok(PlaybackSession {
            trace,
            sink,
            clock,
            config,
            repeat: RepeatMode::default(),
            loader,
            stop: StopSignal::new(),
            track: None,
            state: SessionState::Idle,
            stats: PlaybackStats::default(),
            time: 0,
            origin: 0,
            elapsed: 0,
        })
    }

    /// Set the end-of-trace behavior
    pub fn with_repeat(mut self, repeat: RepeatMode) -> Self {
        self.repeat = repeat;
        self
    }

    /// Share an existing stop signal
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Handle that stops this session from another thread
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Current phase
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counters of the last playback
    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Scan results while a track is prepared
    pub fn scanned(&self) -> Option<&ScannedTrace> {
        self.track.as_ref().map(|track| &track.scanned)
    }

    /// Bank cache while a track is prepared
    pub fn cache(&self) -> Option<&BankCache> {
        self.track.as_ref().map(|track| &track.cache)
    }

    /// The device
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Give back the trace and the device
    pub fn into_parts(self) -> (T, S) {
        (self.trace, self.sink)
    }

    /// Scan the trace and preload the bank
    ///
    /// Returns whether playback depends on sample data at all. A stop
    /// request during the scan leaves the session unprepared and
    /// returns `false`.
    pub fn prepare(&mut self) -> Result<bool> {
        self.track = None;
        self.stats = PlaybackStats::default();
        if !self.rescan(0, true)? {
            self.state = SessionState::Stopped;
            return Ok(false);
        }
        let dependent = self
            .track
            .as_ref()
            .is_some_and(Track::has_sample_dependency);
        if !dependent {
            info!("Trace has no sample dependency");
        }
        Ok(dependent)
    }

    /// Play the trace until it ends or a stop is requested
    ///
    /// Prepares the session first when [`prepare`](Self::prepare) has not
    /// been called. Voices are silenced when playback ends, however it
    /// ends, and the block groups are released.
    ///
    /// # Errors
    /// Hardware failures and internal invariant violations end playback
    /// and are returned.
    pub fn play(&mut self) -> Result<PlaybackOutcome> {
        if self.track.is_none() {
            self.prepare()?;
            if self.track.is_none() {
                return self.finish(Ok(PlaybackOutcome::Stopped));
            }
        }

        info!("Starting playback");
        self.state = SessionState::Playing;
        self.time = 0;
        self.begin_pass();
        let result = self.run();
        self.finish(result)
    }

    fn run(&mut self) -> Result<PlaybackOutcome> {
        loop {
            if self.stop.is_stopped() {
                info!("Playback stopped");
                return Ok(PlaybackOutcome::Stopped);
            }

            let command = match self.trace.next_command(PayloadMode::Skip) {
                Ok(command) => command,
                Err(e) => {
                    error!("Trace decoding failed: {}", e);
                    return Ok(PlaybackOutcome::Finished);
                }
            };
            self.stats.commands += 1;

            match command {
                TraceCommand::RegisterWrite { register, value } => {
                    self.write_register(register, value)?;
                }
                TraceCommand::Wait(samples) => {
                    if !self.wait(samples)? {
                        info!("Playback stopped");
                        return Ok(PlaybackOutcome::Stopped);
                    }
                }
                TraceCommand::End => {
                    if let Some(outcome) = self.end_of_trace()? {
                        return Ok(outcome);
                    }
                }
                TraceCommand::SamplePayload { .. } | TraceCommand::Unsupported(_) => {}
            }
        }
    }

    fn write_register(&mut self, register: u16, value: u8) -> Result<()> {
        let mut value = value;
        if ApuRegister::from_address(register) == Some(ApuRegister::DmcAddress) {
            if let Some(track) = self.track.as_ref() {
                if let Some(slot) = track.map_address(self.time, &mut self.stats) {
                    value = slot;
                }
            }
        }
        self.sink.write_register(register, value)?;
        self.stats.register_writes += 1;
        Ok(())
    }

    /// Returns `false` when the sleep was interrupted
    fn wait(&mut self, samples: u32) -> Result<bool> {
        if let Some(track) = self.track.as_mut() {
            track.advance(self.time, &mut self.stats)?;
        }
        self.time += u64::from(samples);
        self.elapsed += u64::from(samples);
        let deadline = self.origin + self.config.wait_micros(self.elapsed);

        if let Some(track) = self.track.as_mut() {
            track.load_window(
                &self.loader,
                &mut self.sink,
                &self.clock,
                &self.config,
                deadline,
                &mut self.stats,
            )?;
        }

        let now = self.clock.now_micros();
        if now > deadline {
            self.stats.late_windows += 1;
            self.stats.max_lateness_micros = self.stats.max_lateness_micros.max(now - deadline);
        }
        Ok(self.clock.sleep_until(deadline, &self.stop))
    }

    /// Returns the outcome when playback is over
    fn end_of_trace(&mut self) -> Result<Option<PlaybackOutcome>> {
        match self.repeat {
            RepeatMode::Loop if self.trace.has_loop() => {
                if self.elapsed == 0 {
                    warn!("Loop does not advance time, stopping");
                    return Ok(Some(PlaybackOutcome::Finished));
                }
                self.state = SessionState::Looping;
                info!("Seeking to start of loop");

                let dependent = self
                    .track
                    .as_ref()
                    .is_some_and(Track::has_sample_dependency);
                let loop_time = self.track.as_ref().and_then(|track| track.scanned.loop_time);
                match loop_time {
                    Some(time) => {
                        if dependent && !self.rescan(time, false)? {
                            return Ok(Some(PlaybackOutcome::Stopped));
                        }
                        self.time = time;
                    }
                    None if dependent => warn!("Loop point not found, samples play unmapped"),
                    None => {}
                }
                self.trace.seek_loop()?;
                self.stats.loops += 1;
            }
            RepeatMode::Continuous => {
                self.state = SessionState::Restarting;
                info!("Restarting playback");
                self.sink.reset_voices()?;
                let settle = self.clock.now_micros() + self.config.restart_settle_millis * 1_000;
                if !self.clock.sleep_until(settle, &self.stop) || !self.rescan(0, true)? {
                    return Ok(Some(PlaybackOutcome::Stopped));
                }
                self.time = 0;
                self.stats.restarts += 1;
            }
            _ => return Ok(Some(PlaybackOutcome::Finished)),
        }

        self.state = SessionState::Playing;
        self.begin_pass();
        Ok(None)
    }

    /// Scan the trace again and prime the bank for trace time `from`
    ///
    /// Groups fully loaded under the previous scan keep their slots; the
    /// rest of the bank is filled synchronously only with `preload`. Leaves
    /// the trace rewound to its start. Returns `false` when stopped.
    fn rescan(&mut self, from: u64, preload: bool) -> Result<bool> {
        let previous = self.state;
        self.state = SessionState::Preloading;
        let placements = self
            .track
            .as_ref()
            .map(Track::placements)
            .unwrap_or_default();

        let Some(scanned) = scan(&mut self.trace, &self.stop)? else {
            return Ok(false);
        };
        let mut track = Track::new(scanned, &self.config);
        let preload = preload.then_some((&self.loader, &mut self.sink));
        track.prime(from, &placements, preload, &mut self.stats)?;
        self.track = Some(track);
        if previous != SessionState::Idle && previous != SessionState::Stopped {
            self.state = previous;
        }
        Ok(true)
    }

    fn begin_pass(&mut self) {
        self.origin = self.clock.now_micros();
        self.elapsed = 0;
    }

    fn finish(&mut self, result: Result<PlaybackOutcome>) -> Result<PlaybackOutcome> {
        self.state = SessionState::Stopped;
        self.track = None;

        let reset = self.sink.reset_voices();
        match result {
            Ok(outcome) => match reset {
                Ok(()) => {
                    info!("Playback ended: {:?}", outcome);
                    Ok(outcome)
                }
                Err(e) => {
                    error!("Unable to reset voices: {}", e);
                    Err(e)
                }
            },
            Err(e) => {
                error!("Playback failed: {}", e);
                if let Err(reset_error) = reset {
                    warn!("Unable to reset voices: {}", reset_error);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedApu;
    use crate::timing::VirtualClock;
    use crate::trace::CommandTrace;

    type TestSession = PlaybackSession<CommandTrace, SimulatedApu, VirtualClock>;

    fn session(commands: Vec<TraceCommand>) -> TestSession {
        let clock = VirtualClock::new();
        let apu = SimulatedApu::new().with_clock(clock.clone(), 0, 3_500);
        let trace = CommandTrace::new(commands);
        PlaybackSession::new(trace, apu, clock, PlayerConfig::default()).unwrap()
    }

    #[test]
    fn test_plain_writes_without_samples() {
        let mut session = session(vec![
            TraceCommand::RegisterWrite {
                register: 0x4012,
                value: 0x20,
            },
            TraceCommand::Wait(44_100),
        ]);
        assert!(!session.prepare().unwrap());
        assert_eq!(session.state(), SessionState::Preloading);

        assert_eq!(session.play().unwrap(), PlaybackOutcome::Finished);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.sink().writes_to(0x4012), vec![0x20]);
        assert_eq!(session.sink().reset_count(), 1);
        assert_eq!(session.stats().remapped_writes, 0);
        assert!(session.scanned().is_none());
    }

    #[test]
    fn test_play_prepares_when_needed() {
        let mut session = session(vec![
            TraceCommand::SamplePayload {
                address: 0xC000,
                data: vec![0xAA; 64],
            },
            TraceCommand::RegisterWrite {
                register: 0x4012,
                value: 0,
            },
            TraceCommand::RegisterWrite {
                register: 0x4013,
                value: 4,
            },
            TraceCommand::Wait(100),
        ]);
        assert_eq!(session.play().unwrap(), PlaybackOutcome::Finished);
        assert_eq!(session.sink().writes_to(0x4012), vec![8]);
        assert_eq!(session.stats().preloaded_groups, 1);
    }

    #[test]
    fn test_stop_before_play() {
        let mut session = session(vec![TraceCommand::Wait(100)]);
        session.stop_signal().stop();
        assert_eq!(session.play().unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.sink().reset_count(), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PlayerConfig {
            max_blocks_per_increment: 0,
            ..Default::default()
        };
        let result = PlaybackSession::new(
            CommandTrace::default(),
            SimulatedApu::new(),
            VirtualClock::new(),
            config,
        );
        assert!(matches!(result, Err(PlayerError::ConfigError(_))));
    }
}
