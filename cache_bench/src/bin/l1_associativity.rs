use anyhow::Context;
use clap::Parser;

use cache_bench::associativity::{self, L1Pattern, SetPattern};
use cache_bench::cli::{init_logging, AssociativityArgs, GeometryArgs, OutputArgs};

/// Measures the associativity of the L1 data cache.
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
    let l1_size = cli.geometry.resolve_l1_size();
    log::info!("L1 size: {} bytes", l1_size);

    let pattern = L1Pattern { l1_size };
    let config = cli.run.config()?;
    let mut out = cli.output.open(&pattern.default_output())?;
    associativity::run(&pattern, &config, &mut out).context("L1 associativity benchmark failed")?;
    Ok(())
}
