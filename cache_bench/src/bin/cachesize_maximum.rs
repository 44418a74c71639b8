use anyhow::Context;
use clap::Parser;

use cache_bench::cli::{init_logging, resolve_line_size, OutputArgs};
use cache_bench::working_set::{self, maximum_points, SweepConfig, MAXIMUM_PASSES};

const HEADER: &str = "size_mb,load1,load2,load3,load4";

/// Pointer chasing over the L3 sizes found on x86 parts, from 1 to 1152 MiB.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Bytes between two list elements, the detected line size by default
    #[arg(long = "cache_line_size")]
    cache_line_size: Option<usize>,
    /// Do not query CPUID, fall back to 64 byte lines
    #[arg(long)]
    no_detect: bool,
    #[arg(long, default_value_t = MAXIMUM_PASSES)]
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
    let config = SweepConfig {
        passes: cli.passes,
        huge_pages: cli.huge_pages,
        ..SweepConfig::maximum(line_size)
    };
    let points = maximum_points(line_size);
    let mut out = cli.output.open("-")?;
    working_set::run(&config, &points, HEADER, &mut out).context("working set sweep failed")?;
    Ok(())
}
