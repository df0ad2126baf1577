//! VGM Player Core for a Bus-Attached NES APU
//!
//! Plays VGM traces on a real NES APU that sits on a shared bus. The APU
//! fetches DPCM samples from a small on-board bank of 64-byte slots, while a
//! trace may place sample data anywhere in the 32 KiB CPU sample region and
//! rewrite it during playback. The player bridges the two:
//!
//! 1. A scan pass copies every sample payload into a [`SampleStore`] and
//!    turns the DPCM register writes into an ordered [`ReferenceTrace`] of
//!    deduplicated block groups.
//! 2. Before playback the [`BankCache`] is filled in order of first use.
//! 3. During playback each wait window makes the next group resident,
//!    evicting by lookahead (farthest next use first, never the sample that
//!    is playing), and moves its bytes over the bus a few blocks at a time
//!    without overrunning the window. Sample address writes are rewritten
//!    to the slot the group landed in.
//!
//! # Crate feature flags
//! - `vgm` (default): VGM/VGZ decoding (`trace::vgm`, `trace::compression`)
//! - `service` (default): background player thread (`service`)
//! - `cli` (default): the `vgm-apu-player` command line tool
//!
//! # Quick start
//! ```no_run
//! # #[cfg(feature = "vgm")]
//! # {
//! use vgm_apu_player::hardware::SimulatedApu;
//! use vgm_apu_player::timing::MonotonicClock;
//! use vgm_apu_player::{PlaybackSession, PlayerConfig, RepeatMode};
//!
//! let trace = vgm_apu_player::trace::load_file("song.vgz").unwrap();
//! let mut session = PlaybackSession::new(
//!     trace,
//!     SimulatedApu::new(),
//!     MonotonicClock::new(),
//!     PlayerConfig::default(),
//! )
//! .unwrap()
//! .with_repeat(RepeatMode::Loop);
//! session.prepare().unwrap();
//! let outcome = session.play().unwrap();
//! # }
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod constants;
pub mod hardware;
pub mod loader;
pub mod reference;
pub mod report;
pub mod sample_store;
pub mod scanner;
pub mod scheduler;
#[cfg(feature = "service")]
pub mod service;
pub mod timing;
pub mod trace;

mod error;

pub use error::{PlayerError, Result};

// Public API exports
pub use cache::{BankCache, EvictionCost, Residency};
pub use config::{PlayerConfig, RepeatMode};
pub use hardware::{ApuRegister, HardwareSink, SharedBus, SimulatedApu};
pub use loader::{LoadProgress, Loader};
pub use reference::{BlockGroup, GroupId, GroupKey, Reference, ReferenceTrace};
pub use sample_store::SampleStore;
pub use scanner::{scan, ScannedTrace};
pub use scheduler::{PlaybackOutcome, PlaybackSession, PlaybackStats, SessionState};
#[cfg(feature = "service")]
pub use service::{PlayerEvent, PlayerService};
pub use timing::{Clock, MonotonicClock, StopSignal, VirtualClock};
pub use trace::{CommandTrace, PayloadMode, TraceCommand, TraceSource};
#[cfg(feature = "vgm")]
pub use trace::{VgmHeader, VgmTrace};
