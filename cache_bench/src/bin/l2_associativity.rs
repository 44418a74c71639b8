use anyhow::Context;
use clap::Parser;

use cache_bench::associativity::{self, L2Pattern, SetPattern};
use cache_bench::cli::{init_logging, AssociativityArgs, GeometryArgs, OutputArgs};

/// Measures the associativity of the L2 cache.
///
/// Lines under test share an L1 set, extra lines in the same L1 set evict
/// them from L1 before they are timed.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(flatten)]
    geometry: GeometryArgs,
    #[command(flatten)]
    run: AssociativityArgs,
    #[command(flatten)]
    output: OutputArgs,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let geometry = cli.geometry.resolve();
    log::info!(
        "L1: {} bytes, {} ways; L2: {} bytes",
        geometry.l1.size,
        geometry.l1.associativity,
        geometry.l2.size
    );

    let pattern = L2Pattern {
        l1: geometry.l1,
        l2_size: geometry.l2.size,
    };
    let config = cli.run.config()?;
    let mut out = cli.output.open(&pattern.default_output())?;
    associativity::run(&pattern, &config, &mut out).context("L2 associativity benchmark failed")?;
    Ok(())
}
