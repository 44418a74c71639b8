use anyhow::Context;
use clap::Parser;

use cache_bench::associativity::{self, L3Pattern, SetPattern};
use cache_bench::cli::{init_logging, AssociativityArgs, GeometryArgs, OutputArgs};

/// Measures the associativity of the L3 cache.
///
/// Slice hashing on recent parts spreads the tested lines over several
/// slices, expect a noisier curve than for L1 and L2.
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
    log::info!("Cache geometry: {:?}", geometry);

    let pattern = L3Pattern {
        l1: geometry.l1,
        l2: geometry.l2,
        l3_size: geometry.l3_size,
    };
    let config = cli.run.config()?;
    let mut out = cli.output.open(&pattern.default_output())?;
    associativity::run(&pattern, &config, &mut out).context("L3 associativity benchmark failed")?;
    Ok(())
}
