//! Flag groups shared by the benchmark binaries.
//!
//! Cache geometry flags use the underscore spelling of the older tools
//! (`--l1_size=49152`), everything added since uses dashes.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Args;

use crate::associativity::{
    AssociativityConfig, DEFAULT_ARENA_BYTES, MAX_WAYS, MIN_WAYS, NUM_ITERATIONS, WAYS_STEP,
};
use crate::error::BenchError;
use crate::geometry::{
    DetectedCaches, LevelGeometry, FALLBACK_L1_ASSOCIATIVITY, FALLBACK_L1_ONLY_SIZE,
    FALLBACK_L1_SIZE, FALLBACK_L2_ASSOCIATIVITY, FALLBACK_L2_SIZE, FALLBACK_L3_SIZE,
    FALLBACK_LINE_SIZE,
};

/// Logs at `info` unless `RUST_LOG` says otherwise. Output goes to stderr.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Args, Debug, Clone, Default)]
pub struct GeometryArgs {
    /// L1 data cache size in bytes
    #[arg(long = "l1_size")]
    pub l1_size: Option<usize>,
    /// L2 cache size in bytes
    #[arg(long = "l2_size")]
    pub l2_size: Option<usize>,
    /// L3 cache size in bytes
    #[arg(long = "l3_size")]
    pub l3_size: Option<usize>,
    /// Ways of the L1 data cache
    #[arg(long = "l1_associativity")]
    pub l1_associativity: Option<usize>,
    /// Ways of the L2 cache
    #[arg(long = "l2_associativity")]
    pub l2_associativity: Option<usize>,
    /// Do not query CPUID for defaults, use the built-in values instead
    #[arg(long)]
    pub no_detect: bool,
}

/// Fully resolved cache parameters: flag, else CPUID, else built-in default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedGeometry {
    pub l1: LevelGeometry,
    pub l2: LevelGeometry,
    pub l3_size: usize,
}

impl GeometryArgs {
    pub fn resolve(&self) -> ResolvedGeometry {
        let detected = if self.no_detect {
            DetectedCaches::default()
        } else {
            DetectedCaches::detect()
        };
        self.resolve_with(&detected)
    }

    pub fn resolve_with(&self, detected: &DetectedCaches) -> ResolvedGeometry {
        let l1 = LevelGeometry::new(
            pick(self.l1_size, detected.l1.map(|l| l.size), FALLBACK_L1_SIZE),
            pick(
                self.l1_associativity,
                detected.l1.map(|l| l.associativity),
                FALLBACK_L1_ASSOCIATIVITY,
            ),
        );
        let l2 = LevelGeometry::new(
            pick(self.l2_size, detected.l2.map(|l| l.size), FALLBACK_L2_SIZE),
            pick(
                self.l2_associativity,
                detected.l2.map(|l| l.associativity),
                FALLBACK_L2_ASSOCIATIVITY,
            ),
        );
        let l3_size = pick(self.l3_size, detected.l3.map(|l| l.size), FALLBACK_L3_SIZE);
        ResolvedGeometry { l1, l2, l3_size }
    }

    /// L1 size alone, for the L1 benchmark.
    pub fn resolve_l1_size(&self) -> usize {
        let detected = if self.no_detect || self.l1_size.is_some() {
            DetectedCaches::default()
        } else {
            DetectedCaches::detect()
        };
        self.l1_size_with(&detected)
    }

    pub fn l1_size_with(&self, detected: &DetectedCaches) -> usize {
        pick(
            self.l1_size,
            detected.l1.map(|l| l.size),
            FALLBACK_L1_ONLY_SIZE,
        )
    }
}

/// Line size for the working set sweeps: flag, else CPUID, else 64.
pub fn resolve_line_size(flag: Option<usize>, no_detect: bool) -> usize {
    let detected = if no_detect || flag.is_some() {
        None
    } else {
        DetectedCaches::detect().line_size
    };
    pick(flag, detected, FALLBACK_LINE_SIZE)
}

fn pick(flag: Option<usize>, detected: Option<usize>, fallback: usize) -> usize {
    flag.or(detected).unwrap_or(fallback)
}

#[derive(Args, Debug, Clone)]
pub struct AssociativityArgs {
    /// Timed rounds per tested associativity
    #[arg(long, default_value_t = NUM_ITERATIONS)]
    pub iterations: usize,
    #[arg(long, default_value_t = MIN_WAYS)]
    pub min_ways: usize,
    #[arg(long, default_value_t = MAX_WAYS)]
    pub max_ways: usize,
    #[arg(long, default_value_t = WAYS_STEP)]
    pub step: usize,
    /// Upper bound in bytes of the region searched for conflicting lines
    #[arg(long, default_value_t = DEFAULT_ARENA_BYTES)]
    pub mem_size: usize,
    /// Back the arena with 2 MiB pages
    #[arg(long)]
    pub huge_pages: bool,
}

impl AssociativityArgs {
    pub fn config(&self) -> Result<AssociativityConfig, BenchError> {
        if self.step == 0 || self.min_ways == 0 || self.min_ways > self.max_ways {
            return Err(BenchError::InvalidGeometry(format!(
                "cannot test ways {}..={} by steps of {}",
                self.min_ways, self.max_ways, self.step
            )));
        }
        Ok(AssociativityConfig {
            min_ways: self.min_ways,
            max_ways: self.max_ways,
            step: self.step,
            iterations: self.iterations,
            arena_bytes: self.mem_size,
            huge_pages: self.huge_pages,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct OutputArgs {
    /// Where to write the CSV rows, `-` for stdout
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

impl OutputArgs {
    pub fn open(&self, default: &str) -> Result<Box<dyn Write>, BenchError> {
        let path = self
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(default));
        open_output(&path)
    }
}

pub fn open_output(path: &Path) -> Result<Box<dyn Write>, BenchError> {
    if path == Path::new("-") {
        log::info!("Writing results to stdout");
        Ok(Box::new(BufWriter::new(io::stdout())))
    } else {
        log::info!("Writing results to {}", path.display());
        Ok(Box::new(BufWriter::new(File::create(path)?)))
    }
}

/// Parses `A,B` into two distinct core numbers.
pub fn parse_core_pair(s: &str) -> Result<(usize, usize), String> {
    let (a, b) = s
        .split_once(',')
        .ok_or_else(|| format!("expected two cores separated by a comma, got `{}`", s))?;
    let a: usize = a.trim().parse().map_err(|e| format!("bad core `{}`: {}", a, e))?;
    let b: usize = b.trim().parse().map_err(|e| format!("bad core `{}`: {}", b, e))?;
    if a == b {
        return Err("the two threads need distinct cores".to_owned());
    }
    Ok((a, b))
}
