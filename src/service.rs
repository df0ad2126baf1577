//! Player service
//!
//! A worker thread owns the device and plays one track at a time from a
//! request queue. Progress is published as [`PlayerEvent`]s; the amplifier
//! is switched on for playback and powered down again once no request has
//! arrived for the configured idle time.

use crate::config::{PlayerConfig, RepeatMode};
use crate::hardware::HardwareSink;
use crate::scheduler::{PlaybackOutcome, PlaybackSession, PlaybackStats};
use crate::timing::{Clock, StopSignal};
use crate::trace::TraceSource;
use crate::{PlayerError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requests that can wait in the queue
const QUEUE_DEPTH: usize = 10;

/// A trace that can be handed to the worker thread
pub type BoxedTrace = Box<dyn TraceSource + Send>;

/// Work for the player thread
pub enum PlayerRequest {
    /// Play a trace
    Play {
        /// Trace to play
        trace: BoxedTrace,
        /// End-of-trace behavior
        repeat: RepeatMode,
        /// Stops this playback only
        stop: StopSignal,
        /// Queue position, for cancelling requests that have not started
        ticket: u64,
    },
    /// Leave the worker loop
    Shutdown,
}

impl fmt::Debug for PlayerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerRequest::Play { repeat, ticket, .. } => f
                .debug_struct("Play")
                .field("repeat", repeat)
                .field("ticket", ticket)
                .finish_non_exhaustive(),
            PlayerRequest::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Playback progress reported by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// A play request was taken from the queue
    Init,
    /// The trace was scanned and the bank preloaded
    Started {
        /// Whether the trace uses DPCM samples
        sample_dependency: bool,
    },
    /// Playback ended; errors are reported as text
    ///
    /// A request cancelled before it started reports only this event,
    /// with [`PlaybackOutcome::Stopped`].
    Finished(std::result::Result<PlaybackOutcome, String>),
}

/// What the worker is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceState {
    /// Waiting for a request
    #[default]
    Idle,
    /// Playing a trace
    Playing,
    /// The worker has exited
    Shutdown,
}

/// Snapshot of the worker state
#[derive(Debug, Clone, Default)]
pub struct PlayerStatus {
    /// Current activity
    pub state: ServiceState,
    /// Whether the amplifier is powered
    pub amplifier_enabled: bool,
    /// Play requests completed
    pub tracks_played: usize,
    /// Counters of the last completed playback
    pub last_stats: Option<PlaybackStats>,
}

#[derive(Debug, Default)]
struct Shared {
    status: PlayerStatus,
    current: Option<StopSignal>,
    /// Ticket of the next play request
    next_ticket: u64,
    /// Requests with a lower ticket are skipped
    cancel_below: u64,
    shutting_down: bool,
}

impl Shared {
    /// Cancel the playing track and everything queued so far
    fn cancel_all(&mut self) {
        self.cancel_below = self.next_ticket;
        if let Some(stop) = self.current.as_ref() {
            stop.stop();
        }
    }

    /// Take the stop signal of a dequeued request, `false` when it is cancelled
    fn begin(&mut self, ticket: u64, stop: &StopSignal) -> bool {
        if self.shutting_down || ticket < self.cancel_below {
            return false;
        }
        self.current = Some(stop.clone());
        self.status.state = ServiceState::Playing;
        true
    }
}

/// Handle to the player thread
pub struct PlayerService {
    requests: Sender<PlayerRequest>,
    events: Receiver<PlayerEvent>,
    shared: Arc<Mutex<Shared>>,
    worker: Option<JoinHandle<()>>,
}

impl PlayerService {
    /// Start the worker thread
    ///
    /// # Errors
    /// Fails when `config` does not validate or the thread cannot be spawned.
    pub fn spawn<S, C>(sink: S, clock: C, config: PlayerConfig) -> Result<Self>
    where
        S: HardwareSink + Send + 'static,
        C: Clock + Send + 'static,
    {
        config.validate()?;
        let (request_tx, request_rx) = bounded(QUEUE_DEPTH);
        let (event_tx, event_rx) = unbounded();
        let shared = Arc::new(Mutex::new(Shared::default()));

        let worker = Worker {
            sink,
            clock,
            config,
            requests: request_rx,
            events: event_tx,
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name("vgm-player".to_string())
            .spawn(move || worker.run())?;

        Ok(PlayerService {
            requests: request_tx,
            events: event_rx,
            shared,
            worker: Some(handle),
        })
    }

    /// Queue a trace for playback
    ///
    /// Returns a signal that stops this playback alone, whether it is
    /// still queued or already playing.
    pub fn play(&self, trace: BoxedTrace, repeat: RepeatMode) -> Result<StopSignal> {
        let stop = StopSignal::new();
        let ticket = {
            let mut shared = self.shared.lock();
            shared.next_ticket += 1;
            shared.next_ticket - 1
        };
        let request = PlayerRequest::Play {
            trace,
            repeat,
            stop: stop.clone(),
            ticket,
        };
        self.requests
            .try_send(request)
            .map_err(|e| PlayerError::Other(format!("player queue refused request: {}", e)))?;
        Ok(stop)
    }

    /// Stop the track being played and drop every queued request
    pub fn stop(&self) {
        self.shared.lock().cancel_all();
    }

    /// Progress events, in order
    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    /// Current worker state
    pub fn status(&self) -> PlayerStatus {
        self.shared.lock().status.clone()
    }

    /// Stop playback, power down and wait for the worker to exit
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_worker()
    }

    fn shutdown_worker(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        {
            let mut shared = self.shared.lock();
            shared.shutting_down = true;
            shared.cancel_all();
        }
        // A full queue means the worker is busy and sees the flag on its next request
        let _ = self.requests.try_send(PlayerRequest::Shutdown);
        handle
            .join()
            .map_err(|_| PlayerError::Other("player thread panicked".to_string()))
    }
}

impl Drop for PlayerService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_worker() {
            error!("{}", e);
        }
    }
}

struct Worker<S, C> {
    sink: S,
    clock: C,
    config: PlayerConfig,
    requests: Receiver<PlayerRequest>,
    events: Sender<PlayerEvent>,
    shared: Arc<Mutex<Shared>>,
}

impl<S: HardwareSink, C: Clock> Worker<S, C> {
    fn run(mut self) {
        let idle = Duration::from_millis(self.config.idle_shutoff_millis);
        loop {
            if self.shared.lock().shutting_down {
                break;
            }
            let request = if self.shared.lock().status.amplifier_enabled {
                match self.requests.recv_timeout(idle) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => {
                        self.set_amplifier(false);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match self.requests.recv() {
                    Ok(request) => request,
                    Err(_) => break,
                }
            };

            match request {
                PlayerRequest::Play {
                    trace,
                    repeat,
                    stop,
                    ticket,
                } => self.play(trace, repeat, stop, ticket),
                PlayerRequest::Shutdown => break,
            }
        }

        self.set_amplifier(false);
        self.shared.lock().status.state = ServiceState::Shutdown;
        info!("Player service stopped");
    }

    fn play(&mut self, trace: BoxedTrace, repeat: RepeatMode, stop: StopSignal, ticket: u64) {
        if !self.shared.lock().begin(ticket, &stop) {
            debug!("Skipping cancelled request #{}", ticket);
            self.publish(PlayerEvent::Finished(Ok(PlaybackOutcome::Stopped)));
            return;
        }
        self.publish(PlayerEvent::Init);

        let result = if self.set_amplifier(true) {
            self.run_session(trace, repeat, stop)
        } else {
            Err(PlayerError::HardwareError("amplifier did not switch on".to_string()))
        };

        let event = {
            let mut shared = self.shared.lock();
            shared.current = None;
            shared.status.state = ServiceState::Idle;
            shared.status.tracks_played += 1;
            match result {
                Ok((outcome, stats)) => {
                    shared.status.last_stats = Some(stats);
                    PlayerEvent::Finished(Ok(outcome))
                }
                Err(e) => PlayerEvent::Finished(Err(e.to_string())),
            }
        };
        self.publish(event);
    }

    fn run_session(
        &mut self,
        trace: BoxedTrace,
        repeat: RepeatMode,
        stop: StopSignal,
    ) -> Result<(PlaybackOutcome, PlaybackStats)> {
        let mut session =
            PlaybackSession::new(trace, &mut self.sink, &self.clock, self.config.clone())?
                .with_repeat(repeat)
                .with_stop_signal(stop);

        let sample_dependency = session.prepare()?;
        let _ = self.events.send(PlayerEvent::Started { sample_dependency });
        let outcome = session.play()?;
        Ok((outcome, session.stats()))
    }

    /// Returns whether the amplifier ended up in the requested state
    fn set_amplifier(&mut self, enabled: bool) -> bool {
        if self.shared.lock().status.amplifier_enabled == enabled {
            return true;
        }
        match self.sink.set_amplifier_enabled(enabled) {
            Ok(()) => {
                info!("Amplifier {}", if enabled { "on" } else { "off" });
                self.shared.lock().status.amplifier_enabled = enabled;
                true
            }
            Err(e) => {
                warn!("Unable to switch amplifier: {}", e);
                false
            }
        }
    }

    fn publish(&self, event: PlayerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{SharedBus, SimulatedApu};
    use crate::timing::{MonotonicClock, VirtualClock};
    use crate::trace::{CommandTrace, TraceCommand};
    use std::time::Instant;

    fn config() -> PlayerConfig {
        PlayerConfig {
            idle_shutoff_millis: 20,
            ..Default::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_play_reports_events_and_powers_down() {
        let bus = SharedBus::new(SimulatedApu::new());
        let service = PlayerService::spawn(bus.clone(), VirtualClock::new(), config()).unwrap();

        let trace = CommandTrace::new(vec![
            TraceCommand::RegisterWrite {
                register: 0x4015,
                value: 0x0F,
            },
            TraceCommand::Wait(735),
        ]);
        service.play(Box::new(trace), RepeatMode::Once).unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(service.events().recv_timeout(timeout).unwrap(), PlayerEvent::Init);
        assert_eq!(
            service.events().recv_timeout(timeout).unwrap(),
            PlayerEvent::Started {
                sample_dependency: false
            }
        );
        assert_eq!(
            service.events().recv_timeout(timeout).unwrap(),
            PlayerEvent::Finished(Ok(PlaybackOutcome::Finished))
        );

        assert!(wait_for(|| !bus.lock().amplifier_enabled()));
        let status = service.status();
        assert_eq!(status.tracks_played, 1);
        assert_eq!(status.last_stats.map(|s| s.register_writes), Some(1));
        assert_eq!(bus.lock().writes_to(0x4015), vec![0x0F, 0x00]);

        service.shutdown().unwrap();
    }

    #[test]
    fn test_stop_interrupts_playback() {
        let service =
            PlayerService::spawn(SimulatedApu::new(), MonotonicClock::new(), config()).unwrap();
        let trace = CommandTrace::new(vec![TraceCommand::Wait(44_100 * 60)]);
        service.play(Box::new(trace), RepeatMode::Continuous).unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(service.events().recv_timeout(timeout).unwrap(), PlayerEvent::Init);
        assert!(matches!(
            service.events().recv_timeout(timeout).unwrap(),
            PlayerEvent::Started { .. }
        ));
        assert!(wait_for(|| service.status().state == ServiceState::Playing));
        service.stop();
        assert_eq!(
            service.events().recv_timeout(timeout).unwrap(),
            PlayerEvent::Finished(Ok(PlaybackOutcome::Stopped))
        );
    }

    fn long_track() -> BoxedTrace {
        Box::new(CommandTrace::new(vec![TraceCommand::Wait(44_100 * 60)]))
    }

    #[test]
    fn test_shutdown_with_queued_tracks() {
        let service =
            PlayerService::spawn(SimulatedApu::new(), MonotonicClock::new(), config()).unwrap();
        service.play(long_track(), RepeatMode::Continuous).unwrap();
        service.play(long_track(), RepeatMode::Continuous).unwrap();
        assert!(wait_for(|| service.status().state == ServiceState::Playing));

        let (done_tx, done_rx) = unbounded();
        thread::spawn(move || {
            let _ = done_tx.send(service.shutdown().is_ok());
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn test_shutdown_with_full_queue() {
        let service =
            PlayerService::spawn(SimulatedApu::new(), MonotonicClock::new(), config()).unwrap();
        service.play(long_track(), RepeatMode::Continuous).unwrap();
        assert!(wait_for(|| service.status().state == ServiceState::Playing));
        for _ in 0..QUEUE_DEPTH {
            service.play(long_track(), RepeatMode::Continuous).unwrap();
        }
        assert!(service.play(long_track(), RepeatMode::Once).is_err());

        let (done_tx, done_rx) = unbounded();
        thread::spawn(move || {
            drop(service);
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_stop_cancels_queued_tracks() {
        let service =
            PlayerService::spawn(SimulatedApu::new(), MonotonicClock::new(), config()).unwrap();
        service.play(long_track(), RepeatMode::Continuous).unwrap();
        service.play(long_track(), RepeatMode::Continuous).unwrap();
        assert!(wait_for(|| service.status().state == ServiceState::Playing));
        service.stop();

        let timeout = Duration::from_secs(5);
        let stopped = PlayerEvent::Finished(Ok(PlaybackOutcome::Stopped));
        let events: Vec<PlayerEvent> = (0..4)
            .map(|_| service.events().recv_timeout(timeout).unwrap())
            .collect();
        assert_eq!(events[0], PlayerEvent::Init);
        assert!(matches!(events[1], PlayerEvent::Started { .. }));
        assert_eq!(events[2], stopped);
        assert_eq!(events[3], stopped);

        // Later requests play normally
        service
            .play(Box::new(CommandTrace::default()), RepeatMode::Once)
            .unwrap();
        assert_eq!(service.events().recv_timeout(timeout).unwrap(), PlayerEvent::Init);
        assert!(wait_for(|| service.status().tracks_played == 2));
    }

    #[test]
    fn test_amplifier_failure_is_reported() {
        let service =
            PlayerService::spawn(SimulatedApu::new().fail_after(0), VirtualClock::new(), config())
                .unwrap();
        service
            .play(Box::new(CommandTrace::default()), RepeatMode::Once)
            .unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(service.events().recv_timeout(timeout).unwrap(), PlayerEvent::Init);
        assert!(matches!(
            service.events().recv_timeout(timeout).unwrap(),
            PlayerEvent::Finished(Err(_))
        ));
    }
}
