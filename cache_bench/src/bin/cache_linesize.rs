use anyhow::Context;
use clap::Parser;

use cache_utils::affinity::available_cores;

use cache_bench::cli::{init_logging, open_output, parse_core_pair};
use cache_bench::line_size::{self, FalseSharingConfig, INCREMENTS, REPETITIONS};

/// Finds the cache line size through false sharing between two threads.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Sweeps over all strides
    #[arg(long, default_value_t = REPETITIONS)]
    repetitions: usize,
    /// Increments done by each thread per race
    #[arg(long, default_value_t = INCREMENTS)]
    increments: u64,
    /// Pin the two threads, e.g. `--cores 0,2`
    #[arg(long, value_parser = parse_core_pair)]
    cores: Option<(usize, usize)>,
    /// Where to write the CSV rows, `-` for stdout
    #[arg(long, short = 'o', default_value = "-")]
    output: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = FalseSharingConfig {
        repetitions: cli.repetitions,
        increments: cli.increments,
        cores: cli.cores,
        ..FalseSharingConfig::default()
    };
    if let Some((a, b)) = config.cores {
        let cores = available_cores().context("cannot read the cpu affinity mask")?;
        anyhow::ensure!(
            cores.contains(&a) && cores.contains(&b),
            "cores {} and {} are not both available, usable cores: {:?}",
            a,
            b,
            cores
        );
        log::info!("Pinning threads to cores {} and {}", a, b);
    }
    let mut out = open_output(&cli.output)?;
    line_size::run(&config, &mut out).context("false sharing benchmark failed")?;
    Ok(())
}
