//! trackmerge CLI - Cross-sector track merging for drift chambers.
//!
//! Generates synthetic events, merges segments into tracks and converts
//! between the event file formats.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use trackmerge_algorithms::{
    Dispatcher, EventGenerator, MergeOutput, Particle, Rayon, Sequential, SimConfig, TrackMerger,
    UniformField,
};
use trackmerge_core::{ClusterStore, CylindricalGeometry, Event, Geometry, MergerConfig, Side};
use trackmerge_io::{MappedDump, TrackWriter};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    TrackmergeIo(#[from] trackmerge_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] trackmerge_core::Error),

    #[error("unsupported file extension for {0}")]
    UnknownFormat(PathBuf),
}

/// Kernel dispatcher selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum DispatchMode {
    /// In-order loop on one thread
    Sequential,
    /// Rayon thread pool
    Rayon,
}

/// Cross-sector track merging and Kalman refit.
#[derive(Parser)]
#[command(name = "trackmerge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a synthetic event
    Simulate {
        /// Output file (.json event file or .tmdp dump)
        output: PathBuf,

        /// Number of particles
        #[arg(short, long, default_value = "20")]
        particles: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Uniformly distributed noise clusters
        #[arg(long, default_value = "0")]
        noise: usize,

        /// Magnetic field (kG)
        #[arg(long, default_value = "5.0", allow_hyphen_values = true)]
        bz: f64,

        /// Smallest transverse momentum (GeV)
        #[arg(long, default_value = "0.2")]
        min_pt: f64,

        /// Store the true segment parameters without smearing
        #[arg(long)]
        no_smear: bool,
    },

    /// Merge the segments of an event into tracks
    Merge {
        /// Input event (.json event file or .tmdp dump)
        input: PathBuf,

        /// Output tracks (.csv or .bin)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Merger configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run counters and error codes (JSON)
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Kernel dispatcher
        #[arg(short, long, value_enum, default_value = "rayon")]
        dispatch: DispatchMode,
    },

    /// Show information about an event file
    Info {
        /// Input event (.json event file or .tmdp dump)
        input: PathBuf,
    },

    /// Compare the dispatchers on one event
    Benchmark {
        /// Input event (.json event file or .tmdp dump)
        input: PathBuf,

        /// Merger configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of iterations
        #[arg(short, long, default_value = "3")]
        iterations: usize,
    },

    /// Write an event as a binary diagnostic dump
    Dump {
        /// Input event (.json event file or .tmdp dump)
        input: PathBuf,

        /// Output dump
        output: PathBuf,
    },

    /// Write the default merger configuration
    Config {
        /// Output file (JSON)
        output: PathBuf,
    },
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or_else(String::new, str::to_lowercase)
}

/// Reads an event file; dumps are replayed with the default geometry.
fn load_event(path: &Path) -> Result<(CylindricalGeometry, Event)> {
    match extension(path).as_str() {
        "json" => Ok(trackmerge_io::read_event(path)?),
        "tmdp" | "bin" | "dat" => {
            let geometry = CylindricalGeometry::default();
            let event = MappedDump::open(path)?.read_event(&geometry)?;
            Ok((geometry, event))
        }
        _ => Err(CliError::UnknownFormat(path.to_path_buf())),
    }
}

fn save_event(path: &Path, geometry: &CylindricalGeometry, event: &Event) -> Result<()> {
    match extension(path).as_str() {
        "json" => trackmerge_io::write_event(path, geometry, event)?,
        "tmdp" | "bin" | "dat" => {
            trackmerge_io::DumpWriter::create(path)?.write_event(geometry, event)?;
        }
        _ => return Err(CliError::UnknownFormat(path.to_path_buf())),
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MergerConfig> {
    match path {
        Some(p) => Ok(trackmerge_io::read_config(p)?),
        None => Ok(MergerConfig::default()),
    }
}

fn random_particles(n: usize, seed: u64, min_pt: f64) -> Vec<Particle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let max_pt = min_pt.max(0.05) * 25.0;
    (0..n)
        .map(|_| {
            let phi = rng.gen_range(0.0..std::f64::consts::TAU);
            let tgl = rng.gen_range(-1.0..1.0);
            let pt: f64 = rng.gen_range(min_pt.max(0.05)..max_pt);
            let charge = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            Particle::from_vertex(phi, tgl, charge / pt)
        })
        .collect()
}

fn run_merge<D: Dispatcher>(
    merger: &TrackMerger<CylindricalGeometry>,
    event: &Event,
    dispatcher: &D,
) -> Result<MergeOutput> {
    Ok(merger.run_event(event, dispatcher)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Simulate {
            output,
            particles,
            seed,
            noise,
            bz,
            min_pt,
            no_smear,
        } => {
            let geometry = CylindricalGeometry::default();
            let field = UniformField::new(bz);
            let config = SimConfig::default()
                .with_seed(seed)
                .with_noise(noise)
                .with_smear(!no_smear);
            let particles = random_particles(particles, seed, min_pt);
            let sim = EventGenerator::new(&geometry, &field, config).generate(&particles)?;
            save_event(&output, &geometry, &sim.event)?;

            let kept = sim.truth.iter().filter(|t| !t.segments.is_empty()).count();
            println!(
                "Generated {} particles ({} with segments): {} clusters, {} segments",
                particles.len(),
                kept,
                sim.event.clusters.n_clusters(),
                sim.event.segments.len()
            );
            println!("Written to: {}", output.display());
        }

        Commands::Merge {
            input,
            output,
            config,
            summary,
            dispatch,
        } => {
            let (geometry, event) = load_event(&input)?;
            let config = load_config(config.as_deref())?;
            let merger = TrackMerger::new(geometry, config)?;

            let start = Instant::now();
            let result = match dispatch {
                DispatchMode::Sequential => run_merge(&merger, &event, &Sequential)?,
                DispatchMode::Rayon => run_merge(&merger, &event, &Rayon)?,
            };
            let elapsed = start.elapsed();

            let stats = &result.stats;
            println!(
                "Merged {} segments into {} tracks in {:.2} ms",
                stats.segments,
                stats.output_tracks,
                elapsed.as_secs_f64() * 1000.0
            );
            println!(
                "Matches: {} border, {} central electrode, {} looper",
                stats.border_matches, stats.ce_matches, stats.looper_matches
            );
            println!(
                "Refit: {} of {} candidates ({} gate, {} numerical failures, {} loose retries)",
                stats.fitted,
                stats.candidates,
                stats.gate_failures,
                stats.numerical_failures,
                stats.loose_retries
            );
            for (code, count) in &result.errors.entries {
                warn!("{}: {} writes dropped", code.name(), count);
            }

            if let Some(path) = output {
                let mut writer = TrackWriter::create(&path)?;
                match extension(&path).as_str() {
                    "csv" => writer.write_tracks_csv(&result)?,
                    "bin" | "dat" => writer.write_tracks_binary(&result)?,
                    other => {
                        warn!("Unknown extension '{}', defaulting to binary", other);
                        writer.write_tracks_binary(&result)?;
                    }
                }
                info!("tracks written to {}", path.display());
            }
            if let Some(path) = summary {
                TrackWriter::create(&path)?.write_summary_json(&result)?;
            }
        }

        Commands::Info { input } => {
            let (geometry, event) = load_event(&input)?;
            let store = &event.clusters;
            println!("File: {}", input.display());
            println!(
                "Geometry: {} sectors x {} rows, drift length {} cm",
                geometry.n_sectors(),
                geometry.n_rows(),
                geometry.drift_length()
            );
            println!("Clusters: {}", store.n_clusters());
            println!("Segments: {}", event.segments.len());
            println!("Segment hits: {}", event.n_segment_hits());

            let on_a = event
                .segments
                .iter()
                .filter(|s| geometry.sector_side(s.sector) == Side::A)
                .count();
            println!("Segments per side: A {}, C {}", on_a, event.segments.len() - on_a);
            let inward = event.segments.iter().filter(|s| !s.is_outward()).count();
            println!("Inward segments: {}", inward);
            if let Some(max) = event.segments.iter().map(|s| s.hits.len()).max() {
                println!("Longest segment: {} hits", max);
            }
        }

        Commands::Benchmark {
            input,
            config,
            iterations,
        } => {
            let (geometry, event) = load_event(&input)?;
            let merger = TrackMerger::new(geometry, load_config(config.as_deref())?)?;
            let iterations = iterations.max(1);

            println!(
                "Benchmarking with {} segments, {} iterations",
                event.segments.len(),
                iterations
            );
            println!(
                "{:<10} | {:<15} | {:<15} | {:<15} | {:<6}",
                "Dispatch", "Mean Time (ms)", "Min Time (ms)", "Max Time (ms)", "Tracks"
            );
            println!("{:-<74}", "");

            let modes = [DispatchMode::Sequential, DispatchMode::Rayon];
            for mode in modes {
                // Warmup
                let mut tracks = match mode {
                    DispatchMode::Sequential => run_merge(&merger, &event, &Sequential)?,
                    DispatchMode::Rayon => run_merge(&merger, &event, &Rayon)?,
                }
                .tracks
                .len();

                let mut times = Vec::with_capacity(iterations);
                for _ in 0..iterations {
                    let start = Instant::now();
                    let out = match mode {
                        DispatchMode::Sequential => run_merge(&merger, &event, &Sequential)?,
                        DispatchMode::Rayon => run_merge(&merger, &event, &Rayon)?,
                    };
                    times.push(start.elapsed().as_secs_f64() * 1000.0);
                    tracks = out.tracks.len();
                }

                let min_time = times.iter().fold(f64::INFINITY, |a, &b| a.min(b));
                let max_time = times.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let mean_time = times.iter().sum::<f64>() / times.len() as f64;
                let name = match mode {
                    DispatchMode::Sequential => Sequential.name(),
                    DispatchMode::Rayon => Rayon.name(),
                };
                println!(
                    "{:<10} | {:<15.2} | {:<15.2} | {:<15.2} | {:<6}",
                    name, mean_time, min_time, max_time, tracks
                );
            }
        }

        Commands::Dump { input, output } => {
            let (geometry, event) = load_event(&input)?;
            trackmerge_io::DumpWriter::create(&output)?.write_event(&geometry, &event)?;
            let dump = MappedDump::open(&output)?;
            let header = dump.header();
            println!(
                "Wrote {} ({} bytes): version {}, geometry tag {}, {} clusters, {} segments",
                output.display(),
                dump.len(),
                header.version,
                header.geometry_tag,
                header.n_clusters,
                header.n_segments
            );
        }

        Commands::Config { output } => {
            trackmerge_io::write_config(&output, &MergerConfig::default())?;
            println!("Default configuration written to: {}", output.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_particles_are_reproducible() {
        let a = random_particles(10, 5, 0.3);
        let b = random_particles(10, 5, 0.3);
        assert_eq!(a, b);
        assert!(a.iter().all(|p| p.qpt.abs() <= 1.0 / 0.3 + 1e-12));
        assert!(a.iter().all(|p| p.tgl.abs() < 1.0));
    }

    #[test]
    fn test_extension_dispatch() {
        assert_eq!(extension(Path::new("event.JSON")), "json");
        assert_eq!(extension(Path::new("noext")), "");
        assert!(matches!(
            load_event(Path::new("event.txt")),
            Err(CliError::UnknownFormat(_))
        ));
    }
}
