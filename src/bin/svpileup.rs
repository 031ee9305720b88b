use std::path::Path;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use svpileup::aggregate::{AggregateParams, call_aggregate};
use svpileup::bedpe::call_to_bedpe;
use svpileup::input::AlignmentInput;
use svpileup::pileup::{PileupParams, TargetsBedRequirement, call_pileup};
use svpileup::utils::bed::{TargetIndex, read_bed};

#[derive(Parser)]
#[command(name = "svpileup")]
#[command(
    about = "Structural-variant breakpoint pileup from aligned reads",
    long_about = "Detects candidate structural-variant breakpoints from split reads and \
                  discordant read pairs, aggregates nearby breakpoints into events, and \
                  projects aggregated events to BEDPE."
)]
struct Cli {
    /// Log verbosity level
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,
    /// Write log output to a file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<String>,
    /// Append to log file instead of truncating
    #[arg(long, global = true)]
    append_log: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Collate breakpoint evidence from a query-grouped BAM/CRAM
    Pileup {
        /// Query-grouped BAM/CRAM file of aligned reads (all records of a
        /// template must be adjacent, e.g. aligner or 'samtools collate' output).
        #[arg(long, required = true)]
        input: String,
        /// Output path prefix; writes <output>.txt and <output>.bam.
        #[arg(long, required = true)]
        output: String,
        /// Reference genome FASTA (required for CRAM input).
        #[arg(long)]
        ref_fasta: Option<String>,
        /// Maximum reference gap between segments of different reads of a pair.
        #[arg(long, default_value_t = 1000)]
        max_read_pair_inner_distance: usize,
        /// Maximum reference gap between split segments of one read.
        #[arg(long, default_value_t = 100)]
        max_aligned_segment_inner_distance: usize,
        /// Minimum mapping quality for a primary alignment.
        #[arg(long, default_value_t = 30)]
        min_primary_mapping_quality: u8,
        /// Minimum mapping quality for a supplementary alignment.
        #[arg(long, default_value_t = 18)]
        min_supplementary_mapping_quality: u8,
        /// Minimum previously-uncovered read bases a supplementary must add.
        #[arg(long, default_value_t = 20)]
        min_unique_bases_to_add: usize,
        /// Tolerance when assigning records to the sides of a merged segment.
        #[arg(long, default_value_t = 5)]
        slop: usize,
        /// BED file of target regions to annotate breakends with.
        #[arg(long)]
        targets_bed: Option<String>,
        /// How the target BED constrains reported breakpoints.
        #[arg(long, value_enum, default_value_t = TargetsBedRequirement::AnnotateOnly)]
        targets_bed_requirement: TargetsBedRequirement,
    },
    /// Aggregate nearby breakpoints from a pileup table into events
    Aggregate {
        /// Breakpoint table written by the pileup subcommand.
        #[arg(long, required = true)]
        input: String,
        /// Output path for the aggregated table.
        #[arg(long, required = true)]
        output: String,
        /// Coordinate-sorted, indexed BAM/CRAM for allele-frequency
        /// estimation (optional).
        #[arg(long)]
        bam: Option<String>,
        /// Reference genome FASTA (required for CRAM input).
        #[arg(long)]
        ref_fasta: Option<String>,
        /// Bases added on each side of a breakend interval when scanning
        /// for overlapping templates.
        #[arg(long, default_value_t = 1000)]
        flank: usize,
        /// Minimum total evidence before the allele-frequency scan runs.
        #[arg(long, default_value_t = 10)]
        min_breakpoint_support: u64,
        /// Smallest reportable allele frequency.
        #[arg(long, default_value_t = 0.001)]
        min_frequency: f64,
        /// BED file of target regions to annotate events with.
        #[arg(long)]
        targets_bed: Option<String>,
        /// Maximum per-side distance between clustered breakpoints.
        #[arg(long, default_value_t = 10)]
        max_dist: usize,
    },
    /// Convert an aggregated table to BEDPE
    Bedpe {
        /// Aggregated table written by the aggregate subcommand.
        #[arg(long, required = true)]
        input: String,
        /// Output BEDPE path.
        #[arg(long, required = true)]
        output: String,
    },
}

/// Creates the output's parent directory if it does not exist yet.
fn ensure_parent_dir(output: &str) -> anyhow::Result<()> {
    let path = Path::new(output);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        info!("Creating output directory: {:?}", parent);
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn load_targets(path: Option<&str>) -> anyhow::Result<Option<TargetIndex>> {
    match path {
        Some(p) => Ok(Some(TargetIndex::new(read_bed(p)?))),
        None => Ok(None),
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Pileup {
            input,
            output,
            ref_fasta,
            max_read_pair_inner_distance,
            max_aligned_segment_inner_distance,
            min_primary_mapping_quality,
            min_supplementary_mapping_quality,
            min_unique_bases_to_add,
            slop,
            targets_bed,
            targets_bed_requirement,
        } => {
            ensure_parent_dir(output)?;
            let targets = load_targets(targets_bed.as_deref())?;
            let params = PileupParams {
                max_read_pair_inner_distance: *max_read_pair_inner_distance,
                max_aligned_segment_inner_distance: *max_aligned_segment_inner_distance,
                min_primary_mapping_quality: *min_primary_mapping_quality,
                min_supplementary_mapping_quality: *min_supplementary_mapping_quality,
                min_unique_bases_to_add: *min_unique_bases_to_add,
                slop: *slop,
                targets_requirement: *targets_bed_requirement,
            };
            let mut reader = AlignmentInput::open(input, ref_fasta.as_deref())?;
            let summary = call_pileup(&mut reader, output, &params, targets.as_ref())?;
            info!(
                "Wrote {} breakpoints to {}.txt and annotated alignments to {}.bam",
                summary.breakpoints, output, output
            );
            Ok(())
        }
        Commands::Aggregate {
            input,
            output,
            bam,
            ref_fasta,
            flank,
            min_breakpoint_support,
            min_frequency,
            targets_bed,
            max_dist,
        } => {
            ensure_parent_dir(output)?;
            let targets = load_targets(targets_bed.as_deref())?;
            let params = AggregateParams {
                max_dist: *max_dist,
                flank: *flank,
                min_breakpoint_support: *min_breakpoint_support,
                min_frequency: *min_frequency,
            };
            let mut reader = match bam {
                Some(path) => {
                    let reader = AlignmentInput::open(path, ref_fasta.as_deref())?;
                    reader.require_index(path)?;
                    Some(reader)
                }
                None => None,
            };
            let n = call_aggregate(input, output, &params, reader.as_mut(), targets.as_ref())?;
            info!("Wrote {} aggregated events to {}", n, output);
            Ok(())
        }
        Commands::Bedpe { input, output } => {
            ensure_parent_dir(output)?;
            let n = call_to_bedpe(input, output)?;
            info!("Wrote {} BEDPE records to {}", n, output);
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut log_builder = env_logger::Builder::from_default_env();
    log_builder.filter_level(cli.log_level.to_level_filter()).format_module_path(false);
    if let Some(ref path) = cli.log_file {
        let file = if cli.append_log {
            std::fs::File::options().create(true).append(true).open(path)
        } else {
            std::fs::File::create(path)
        }
        .unwrap_or_else(|e| panic!("Could not open log file '{}': {}", path, e));
        log_builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    log_builder.init();

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
