//! CLI Entry Point for kid-readout
//!
//! Provides command-line interface for:
//! - Running resonance-tracking sweeps against the simulated readout and saving the results
//! - Inspecting a saved readout file
//! - Printing the effective configuration
//!
//! # Usage
//!
//! Track three resonators over two sweep iterations:
//! ```bash
//! kid-readout sweep --targets 100,120.5,133 --iterations 2 --output data/run.json
//! ```
//!
//! Inspect the result:
//! ```bash
//! kid-readout inspect data/run.json --at 1700000000
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kid_readout::analysis::{ParabolicMinimum, ResonanceConsolidator};
use kid_readout::config::ReadoutConfig;
use kid_readout::environment::temperature_cache;
use kid_readout::hardware::simulated::{Resonator, SimulatedReadout};
use kid_readout::hardware::ReadoutDevice;
use kid_readout::logging;
use kid_readout::store::{ReadoutFile, ReadoutFileWriter};
use kid_readout::sweep::{
    epoch_seconds, linear_offsets, SequencerConfig, SweepSequencer, ToneAllocator,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "kid-readout")]
#[command(about = "Multiplexed microresonator readout", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/readout.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track resonances with repeated sweeps of the simulated readout
    Sweep {
        /// Initial resonance guesses in MHz
        #[arg(long, value_delimiter = ',', required = true)]
        targets: Vec<f64>,

        /// Full sweep span in MHz
        #[arg(long, default_value = "0.2")]
        span: f64,

        /// Offset steps per sweep
        #[arg(long, default_value = "21")]
        points: usize,

        /// Sweep-and-refine iterations
        #[arg(long, default_value = "2")]
        iterations: usize,

        /// Frames of time stream captured at the final estimates (0 to skip)
        #[arg(long, default_value = "16")]
        timestream_frames: usize,

        /// Skip the settle delays
        #[arg(long)]
        fast: bool,

        /// Output file (.json)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Summarize a readout file
    Inspect {
        /// File to read (.json, or .nc with the storage_netcdf feature)
        path: PathBuf,

        /// Time for the attenuation and temperature lookups (default: first sweep start)
        #[arg(long)]
        at: Option<f64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = if cli.config.exists() {
        ReadoutConfig::load_from(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        ReadoutConfig::default()
    };
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Sweep {
            targets,
            span,
            points,
            iterations,
            timestream_frames,
            fast,
            output,
        } => {
            let output = output.unwrap_or_else(|| {
                config
                    .storage
                    .output_dir
                    .join(format!("sweep_{}.json", epoch_seconds() as u64))
            });
            let args = SweepArgs {
                targets,
                span,
                points,
                iterations,
                timestream_frames,
                fast,
                output,
            };
            tokio::task::spawn_blocking(move || run_sweeps(&config, &args)).await?
        }
        Commands::Inspect { path, at } => {
            tokio::task::spawn_blocking(move || inspect(&config, &path, at)).await?
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

struct SweepArgs {
    targets: Vec<f64>,
    span: f64,
    points: usize,
    iterations: usize,
    timestream_frames: usize,
    fast: bool,
    output: PathBuf,
}

fn simulated_device(config: &ReadoutConfig, targets: &[f64]) -> SimulatedReadout {
    let hw = &config.hardware;
    // true resonances sit slightly off the guesses so tracking has something to do
    let resonators = targets
        .iter()
        .enumerate()
        .map(|(i, f)| Resonator::new(f + 0.01 * (i % 3) as f64 - 0.01, 20_000.0, 0.7));
    SimulatedReadout::new(hw.sample_rate_mhz, hw.nfft, hw.tone_table_size, hw.frame_samples)
        .with_resonators(resonators)
        .with_noise(0.01)
}

fn run_sweeps(config: &ReadoutConfig, args: &SweepArgs) -> Result<()> {
    let hw = &config.hardware;
    let allocator = ToneAllocator::new(
        hw.sample_rate_mhz,
        hw.tone_table_size,
        hw.nfft,
        config.sweep.channels_per_read,
    )?;
    let mut sequencer_config = SequencerConfig::from(&config.sweep);
    if args.fast {
        sequencer_config.settle = Duration::ZERO;
        sequencer_config.batch_settle = Duration::ZERO;
    }
    let sequencer = SweepSequencer::new(sequencer_config);
    let consolidator = ResonanceConsolidator::from(&config.consolidator);
    let offsets = linear_offsets(-args.span / 2.0, args.span / 2.0, args.points);

    let mut device = simulated_device(config, &args.targets);
    let mut writer = ReadoutFileWriter::new(&args.output)
        .with_provenance(format!("kid-readout {} simulated sweep", env!("CARGO_PKG_VERSION")));
    let mut guesses = args.targets.clone();
    guesses.sort_by(f64::total_cmp);

    for iteration in 0..args.iterations {
        let plan = allocator.plan(&guesses, &offsets)?;
        writer.log_hw_state(device.hardware_record(epoch_seconds()))?;
        let outcome = sequencer.run(&mut device, &plan, iteration as u32)?;
        for failure in &outcome.failures {
            println!(
                "  skipped step {:?} batch {:?} after {} attempts: {}",
                failure.sweep_index, failure.batch, failure.attempts, failure.error
            );
        }
        let estimates = consolidator.refine(&outcome.sweep, &guesses, &ParabolicMinimum);
        println!("Iteration {iteration}:");
        for estimate in &estimates {
            println!(
                "  channel {:>3}: {:.6} -> {:.6} MHz ({})",
                estimate.channel_id, estimate.guess, estimate.chosen, estimate.source
            );
        }
        guesses = estimates.iter().map(|e| e.chosen).collect();
        guesses.sort_by(f64::total_cmp);
        let name = writer.add_sweep(&outcome.sweep)?;
        info!(iteration, group = %name, "sweep stored");
    }

    if args.timestream_frames > 0 {
        let captured =
            sequencer.capture_timestreams(&mut device, &allocator, &guesses, args.timestream_frames)?;
        writer.add_timestream(&captured.blocks)?;
    }
    writer.save()?;
    println!("✅ Saved {}", args.output.display());
    Ok(())
}

fn inspect(config: &ReadoutConfig, path: &Path, at: Option<f64>) -> Result<()> {
    let file = ReadoutFile::open(path)?;
    println!("📂 {}", file.path().display());
    if !file.provenance.is_empty() {
        println!("   provenance: {}", file.provenance);
    }
    println!("   hardware records: {}", file.hw_state.len());
    for sweep in &file.sweeps {
        println!(
            "   {}: {} points, channels {:?}, epochs {:?}..{:?}",
            sweep.name(),
            sweep.len(),
            {
                let mut ids = sweep.index.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            },
            sweep.start_epoch(),
            sweep.end_epoch()
        );
    }
    for timestream in &file.timestreams {
        println!(
            "   {}: {} blocks of {} samples",
            timestream.name(),
            timestream.len(),
            timestream.num_data_samples()
        );
    }
    for warning in file.warnings() {
        println!("   ⚠️  {warning}");
    }

    let at = at.or_else(|| file.sweeps.first().and_then(|s| s.start_epoch()));
    if let Some(at) = at {
        match file.effective_dac_atten_at(at) {
            Some(atten) => println!(
                "   DAC attenuation at {at}: {} dB, {} dB effective for {} tones",
                atten.dac_atten, atten.total, atten.ntones
            ),
            None => println!("   no hardware record at or before {at}"),
        }
        if let Some(mut cache) = temperature_cache(&config.temperature) {
            println!("   temperature at {at}: {:.4}", cache.temperature_at(at));
        }
    }
    Ok(())
}
