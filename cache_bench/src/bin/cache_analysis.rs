use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use itertools::Itertools;

use cache_bench::analysis::{
    analyse_cache_size, predict_associativity, predict_line_size, read_grouped_medians,
    read_size_summaries, SweepKind,
};
use cache_bench::cli::init_logging;

/// Reads the CSV files written by the benchmarks and prints a prediction.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Median access time per tested associativity
    Associativity { input: PathBuf },
    /// Median run time per stride of the false sharing benchmark
    LineSize { input: PathBuf },
    /// Knee of a working set sweep
    CacheSize {
        input: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Estimated)]
        mode: Mode,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Mode {
    Maximum,
    Estimated,
}

impl From<Mode> for SweepKind {
    fn from(mode: Mode) -> SweepKind {
        match mode {
            Mode::Maximum => SweepKind::Maximum,
            Mode::Estimated => SweepKind::Estimated,
        }
    }
}

fn open(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(BufReader::new(file))
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Associativity { input } => {
            let medians = read_grouped_medians(open(&input)?, 2)
                .with_context(|| format!("cannot parse {}", input.display()))?;
            writeln!(out, "associativity,median_access_time")?;
            for (ways, median) in &medians {
                writeln!(out, "{},{}", ways, median)?;
            }
            match predict_associativity(&medians) {
                Some(ways) => writeln!(out, "Predicted associativity: {}", ways)?,
                None => writeln!(out, "No significant change in access time")?,
            }
        }
        Command::LineSize { input } => {
            let medians = read_grouped_medians(open(&input)?, 1)
                .with_context(|| format!("cannot parse {}", input.display()))?;
            writeln!(out, "stride,median_milliseconds")?;
            for (stride, median) in &medians {
                writeln!(out, "{},{:.3}", stride, median)?;
            }
            match predict_line_size(&medians) {
                Some(stride) => writeln!(out, "Predicted cache line size: {} bytes", stride)?,
                None => writeln!(out, "No data")?,
            }
        }
        Command::CacheSize { input, mode } => {
            let summaries = read_size_summaries(open(&input)?)
                .with_context(|| format!("cannot parse {}", input.display()))?;
            let report = analyse_cache_size(summaries, mode.into());
            writeln!(out, "size,mean,median,smoothed,samples")?;
            for (summary, smoothed) in report.summaries.iter().zip(&report.smoothed) {
                writeln!(
                    out,
                    "{}",
                    [
                        summary.size.to_string(),
                        format!("{:.2}", summary.mean),
                        format!("{:.2}", summary.median),
                        format!("{:.2}", smoothed),
                        summary.samples.to_string(),
                    ]
                    .iter()
                    .join(",")
                )?;
            }
            match (report.knee, mode) {
                (Some(knee), Mode::Maximum) => {
                    writeln!(out, "Largest cache is at most {} MB", knee)?
                }
                (Some(knee), Mode::Estimated) => {
                    writeln!(out, "Estimated cache size: {} KB", knee)?
                }
                (None, _) => writeln!(out, "No knee found")?,
            }
            if let Some(last) = report.segments.as_ref().and_then(|f| f.last_breakpoint()) {
                let mb = last / 1024.0;
                writeln!(
                    out,
                    "Piecewise regression puts the cache size within [{:.2}, {:.2}] MB",
                    mb - 1.0,
                    mb + 1.0
                )?;
            }
        }
    }
    Ok(())
}
