#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!(
        "The vgm-apu-player CLI requires the \"cli\" feature. \
         Rebuild with `--features cli` to enable it."
    );
}

#[cfg(feature = "cli")]
mod cli {
    use std::fs::File;
    use std::io::BufWriter;
    use std::path::{Path, PathBuf};

    use anyhow::{bail, Context};
    use clap::{Parser, Subcommand};
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    use vgm_apu_player::report::{block_group_report, total_blocks, write_csv};
    use vgm_apu_player::trace::load_file;
    use vgm_apu_player::{
        scan, Clock, MonotonicClock, PlaybackSession, PlayerConfig, RepeatMode, SimulatedApu,
        StopSignal, VgmTrace, VirtualClock,
    };

    #[derive(Parser)]
    #[command(name = "vgm-apu-player")]
    #[command(version, about = "Play VGM traces on a bus-attached NES APU", long_about = None)]
    struct Cli {
        #[command(subcommand)]
        command: Commands,

        /// Log filter, e.g. `debug` or `vgm_apu_player=trace` (defaults to RUST_LOG, then `info`)
        #[arg(long, global = true)]
        log: Option<String>,
    }

    #[derive(Subcommand)]
    enum Commands {
        /// Scan a VGM/VGZ file and print its block groups
        Scan {
            /// Trace file
            file: PathBuf,

            /// Also write the block groups as CSV
            #[arg(long)]
            csv: Option<PathBuf>,
        },

        /// Play a VGM/VGZ file against the simulated APU
        Play {
            /// Trace file
            file: PathBuf,

            /// End-of-trace behavior
            #[arg(long, value_enum, default_value_t = RepeatMode::Once)]
            repeat: RepeatMode,

            /// JSON player configuration
            #[arg(long)]
            config: Option<PathBuf>,

            /// Follow the wall clock instead of simulated bus timing
            #[arg(long)]
            realtime: bool,

            /// Stop after this many seconds of playback
            #[arg(long)]
            seconds: Option<u64>,
        },
    }

    /// Clock that raises a stop once a sleep would pass `limit`
    struct LimitedClock<C> {
        inner: C,
        limit: Option<u64>,
        start: u64,
    }

    impl<C: Clock> LimitedClock<C> {
        fn new(inner: C, seconds: Option<u64>) -> Self {
            let start = inner.now_micros();
            LimitedClock {
                inner,
                limit: seconds.map(|s| s * 1_000_000),
                start,
            }
        }
    }

    impl<C: Clock> Clock for LimitedClock<C> {
        fn now_micros(&self) -> u64 {
            self.inner.now_micros()
        }

        fn sleep_until(&self, deadline: u64, stop: &StopSignal) -> bool {
            if let Some(limit) = self.limit {
                if deadline.saturating_sub(self.start) > limit {
                    stop.stop();
                    return false;
                }
            }
            self.inner.sleep_until(deadline, stop)
        }
    }

    fn setup_logging(filter: Option<&str>) {
        let filter = match filter {
            Some(filter) => EnvFilter::new(filter),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }

    fn open(file: &Path) -> anyhow::Result<VgmTrace> {
        load_file(file).with_context(|| format!("Failed to load {}", file.display()))
    }

    fn run_scan(file: &Path, csv: Option<&Path>) -> anyhow::Result<()> {
        let mut trace = open(file)?;
        trace.header().log_fields();

        let Some(scanned) = scan(&mut trace, &StopSignal::new())? else {
            bail!("scan interrupted");
        };
        let rows = block_group_report(&scanned.references);

        println!(
            "{:>10}  {:>5}  {:>7}  {:>10}  {:>5}  {:>6}  {:>6}",
            "written", "block", "address", "first use", "refs", "blocks", "bytes"
        );
        for row in &rows {
            let first_use = row
                .first_use
                .map_or_else(|| "-".to_string(), |time| time.to_string());
            println!(
                "{:>10}  {:>5}  {:>7}  {:>10}  {:>5}  {:>6}  {:>6}",
                row.written_at,
                row.block,
                row.address,
                first_use,
                row.references,
                row.blocks,
                row.bytes
            );
        }
        println!();
        println!("Block groups:      {}", rows.len());
        println!("References:        {}", scanned.references.references().len());
        println!("Slots for all:     {}", total_blocks(&rows));
        println!(
            "Duration:          {:.2}s",
            scanned.total_samples as f64 / f64::from(PlayerConfig::default().sample_rate)
        );
        if scanned.rejected_payloads > 0 {
            println!("Rejected payloads: {}", scanned.rejected_payloads);
        }

        if let Some(path) = csv {
            let out = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_csv(&rows, BufWriter::new(out))?;
            info!("Wrote {}", path.display());
        }
        Ok(())
    }

    fn run_play(
        file: &Path,
        repeat: RepeatMode,
        config: Option<&Path>,
        realtime: bool,
        seconds: Option<u64>,
    ) -> anyhow::Result<()> {
        let config = match config {
            Some(path) => PlayerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => PlayerConfig::default(),
        };
        let trace = open(file)?;

        if realtime {
            let clock = LimitedClock::new(MonotonicClock::new(), seconds);
            play(trace, SimulatedApu::new(), clock, config, repeat)
        } else {
            let virtual_clock = VirtualClock::new();
            let apu = SimulatedApu::new().with_clock(
                virtual_clock.clone(),
                0,
                config.transfer_micros_per_block,
            );
            let clock = LimitedClock::new(virtual_clock, seconds);
            play(trace, apu, clock, config, repeat)
        }
    }

    fn play<C: Clock>(
        trace: VgmTrace,
        apu: SimulatedApu,
        clock: C,
        config: PlayerConfig,
        repeat: RepeatMode,
    ) -> anyhow::Result<()> {
        let mut session = PlaybackSession::new(trace, apu, clock, config)?.with_repeat(repeat);
        let dependent = session.prepare()?;
        if let Some(cache) = session.cache() {
            info!(
                "Sample dependency: {}, {} of {} slots preloaded",
                dependent,
                cache.slot_count() - cache.free_slots(),
                cache.slot_count()
            );
        }
        let outcome = session.play()?;

        let stats = session.stats();
        let (_, apu) = session.into_parts();
        println!("Outcome:           {:?}", outcome);
        println!("Commands:          {}", stats.commands);
        println!("Register writes:   {}", stats.register_writes);
        println!(
            "Sample addresses:  {} remapped ({} partial), {} unmapped",
            stats.remapped_writes, stats.partial_writes, stats.unmapped_writes
        );
        println!("Preloaded groups:  {}", stats.preloaded_groups);
        println!(
            "Incremental loads: {} ({} blocks)",
            stats.load_increments, stats.blocks_loaded
        );
        println!("Cache failures:    {}", stats.cache_failures);
        println!(
            "Late windows:      {} (worst {} us)",
            stats.late_windows, stats.max_lateness_micros
        );
        println!("Loops / restarts:  {} / {}", stats.loops, stats.restarts);
        println!("Bytes on the bus:  {}", apu.bytes_transferred());
        Ok(())
    }

    pub fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        setup_logging(cli.log.as_deref());

        match cli.command {
            Commands::Scan { file, csv } => run_scan(&file, csv.as_deref()),
            Commands::Play {
                file,
                repeat,
                config,
                realtime,
                seconds,
            } => {
                if matches!(repeat, RepeatMode::Loop | RepeatMode::Continuous)
                    && seconds.is_none()
                    && !realtime
                {
                    bail!("repeating playback on the simulated clock needs --seconds");
                }
                run_play(&file, repeat, config.as_deref(), realtime, seconds)
            }
        }
    }
}

#[cfg(feature = "cli")]
fn main() -> anyhow::Result<()> {
    cli::run()
}
