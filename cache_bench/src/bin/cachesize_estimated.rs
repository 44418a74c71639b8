use anyhow::Context;
use clap::Parser;

use cache_bench::cli::{init_logging, resolve_line_size, OutputArgs};
use cache_bench::working_set::{
    self, estimated_points, SweepConfig, DEFAULT_MAX_CACHE_MB, ESTIMATED_PASSES,
};

const HEADER: &str = "size_kb,load1,load2,load3,load4";

/// Pointer chasing over working sets from 4 KiB up to a known bound.
///
/// Rows hold the average cycles per load, the knee of the curve estimates the
/// capacity of the largest cache that still holds the working set.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Bytes between two list elements, the detected line size by default
    #[arg(long = "cache_line_size")]
    cache_line_size: Option<usize>,
    /// Do not query CPUID, fall back to 64 byte lines
    #[arg(long)]
    no_detect: bool,
    /// Largest working set, in MiB
    #[arg(long = "max_cache_size", default_value_t = DEFAULT_MAX_CACHE_MB)]
    max_cache_size: f64,
    #[arg(long, default_value_t = ESTIMATED_PASSES)]
    passes: usize,
    /// Back the arena with 2 MiB pages
    #[arg(long)]
    huge_pages: bool,
    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let line_size = resolve_line_size(cli.cache_line_size, cli.no_detect);
    log::info!("Line size: {} bytes", line_size);
    anyhow::ensure!(
        cli.max_cache_size > 0.0,
        "--max_cache_size must be positive, got {}",
        cli.max_cache_size
    );
    let config = SweepConfig {
        passes: cli.passes,
        huge_pages: cli.huge_pages,
        ..SweepConfig::estimated(line_size, cli.max_cache_size)
    };
    let points = estimated_points(line_size, cli.max_cache_size);
    log::info!(
        "{} working sets up to {} MiB, {} passes",
        points.len(),
        cli.max_cache_size,
        config.passes
    );
    let mut out = cli.output.open("-")?;
    working_set::run(&config, &points, HEADER, &mut out).context("working set sweep failed")?;
    Ok(())
}
