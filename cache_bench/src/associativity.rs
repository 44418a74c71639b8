//! Set associativity measurement.
//!
//! For a tested number of ways `w`, we build a list of line indices that all
//! land in the same set of the target level. Accessing them once fills the
//! set, the second (timed) pass then hits if the set holds at least `w` lines
//! and misses once `w` exceeds the real associativity. For L2 and L3 the
//! pattern is padded with filler lines that share the L1 (and L2) set but not
//! the target set, so the conflicting lines are pushed out of the levels
//! above before they are timed.

use std::io::Write;
use std::mem::size_of;

use cache_utils::mmap::MMappedMemory;
use cache_utils::{flush, maccess, memory_barrier, timed_load};

use crate::error::BenchError;
use crate::geometry::LevelGeometry;

pub const MIN_WAYS: usize = 2;
pub const MAX_WAYS: usize = 24;
pub const WAYS_STEP: usize = 2;
pub const NUM_ITERATIONS: usize = 100_000;
pub const DEFAULT_ARENA_BYTES: usize = 3 << 30;

pub const CSV_HEADER: &str = "associativity,element_index,access_time";

/// One cache line worth of memory, the unit every index refers to.
#[repr(C, align(64))]
pub struct Line {
    pub value: u64,
    _padding: [u64; 7],
}

pub const LINE_LEN: usize = size_of::<Line>();

/// Line indices for one tested associativity.
///
/// The first `measured` indices conflict in the target set and are timed,
/// the rest only evict them from the levels above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPattern {
    pub ways: usize,
    pub indices: Vec<usize>,
    pub measured: usize,
}

impl IndexPattern {
    pub fn measured_indices(&self) -> &[usize] {
        &self.indices[..self.measured]
    }

    pub fn max_index(&self) -> Option<usize> {
        self.indices.iter().copied().max()
    }
}

pub trait SetPattern {
    /// Cache level targeted, used in logs and the default output name.
    fn level(&self) -> u8;

    /// Indices for `ways` conflicting lines, searched among the first `limit_lines` lines.
    fn generate(&self, ways: usize, limit_lines: usize) -> Result<IndexPattern, BenchError>;

    fn default_output(&self) -> String {
        format!("cache_L{}associativity_benchmark_data.csv", self.level())
    }
}

/// Every `lines(L1)`-th line maps to the same L1 set.
#[derive(Debug, Clone, Copy)]
pub struct L1Pattern {
    pub l1_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct L2Pattern {
    pub l1: LevelGeometry,
    pub l2_size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct L3Pattern {
    pub l1: LevelGeometry,
    pub l2: LevelGeometry,
    pub l3_size: usize,
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

fn nonzero(value: usize, what: &str) -> Result<usize, BenchError> {
    if value == 0 {
        Err(BenchError::InvalidGeometry(format!("{} is zero", what)))
    } else {
        Ok(value)
    }
}

/// Collects exactly `wanted` candidates or reports how many were found.
fn take_exact(
    candidates: impl Iterator<Item = usize>,
    wanted: usize,
    limit_lines: usize,
) -> Result<Vec<usize>, BenchError> {
    let found: Vec<usize> = candidates.take(wanted).collect();
    if found.len() < wanted {
        return Err(BenchError::PatternExhausted {
            wanted,
            found: found.len(),
            limit_lines,
        });
    }
    Ok(found)
}

impl SetPattern for L1Pattern {
    fn level(&self) -> u8 {
        1
    }

    fn generate(&self, ways: usize, limit_lines: usize) -> Result<IndexPattern, BenchError> {
        let l1_lines = nonzero(self.l1_size / LINE_LEN, "the number of L1 lines")?;
        let indices = take_exact(
            (0..ways)
                .map(|i| i * l1_lines)
                .take_while(|&i| i < limit_lines),
            ways,
            limit_lines,
        )?;
        Ok(IndexPattern {
            ways,
            indices,
            measured: ways,
        })
    }
}

impl SetPattern for L2Pattern {
    fn level(&self) -> u8 {
        2
    }

    fn generate(&self, ways: usize, limit_lines: usize) -> Result<IndexPattern, BenchError> {
        let l1_sets = self.l1.sets(LINE_LEN)?;
        let l2_lines = nonzero(self.l2_size / LINE_LEN, "the number of L2 lines")?;
        let test_sets = nonzero(l2_lines / nonzero(ways, "ways")?, "the tested L2 set count")?;

        // same L1 set and same L2 set
        let mut indices = take_exact(
            (0..limit_lines).step_by(lcm(l2_lines, l1_sets)),
            ways,
            limit_lines,
        )?;
        // same L1 set, another L2 set
        indices.extend(take_exact(
            (0..limit_lines)
                .step_by(l1_sets)
                .filter(|i| i % test_sets != 0),
            self.l1.associativity,
            limit_lines,
        )?);
        Ok(IndexPattern {
            ways,
            indices,
            measured: ways,
        })
    }
}

impl SetPattern for L3Pattern {
    fn level(&self) -> u8 {
        3
    }

    fn generate(&self, ways: usize, limit_lines: usize) -> Result<IndexPattern, BenchError> {
        let l1_sets = self.l1.sets(LINE_LEN)?;
        let l2_sets = self.l2.sets(LINE_LEN)?;
        let l3_lines = nonzero(self.l3_size / LINE_LEN, "the number of L3 lines")?;
        let test_sets = nonzero(l3_lines / nonzero(ways, "ways")?, "the tested L3 set count")?;
        let upper_sets = lcm(l1_sets, l2_sets);

        // same set in L1, L2 and L3
        let mut indices = take_exact(
            (0..limit_lines).step_by(lcm(l3_lines, upper_sets)),
            ways,
            limit_lines,
        )?;
        // same L1 and L2 set, another L3 set
        indices.extend(take_exact(
            (0..limit_lines)
                .step_by(upper_sets)
                .filter(|i| i % test_sets != 0),
            self.l1.associativity.max(self.l2.associativity),
            limit_lines,
        )?);
        Ok(IndexPattern {
            ways,
            indices,
            measured: ways,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AssociativityConfig {
    pub min_ways: usize,
    pub max_ways: usize,
    pub step: usize,
    pub iterations: usize,
    pub arena_bytes: usize,
    pub huge_pages: bool,
}

impl Default for AssociativityConfig {
    fn default() -> Self {
        AssociativityConfig {
            min_ways: MIN_WAYS,
            max_ways: MAX_WAYS,
            step: WAYS_STEP,
            iterations: NUM_ITERATIONS,
            arena_bytes: DEFAULT_ARENA_BYTES,
            huge_pages: false,
        }
    }
}

impl AssociativityConfig {
    pub fn tested_ways(&self) -> impl Iterator<Item = usize> {
        (self.min_ways.max(1)..=self.max_ways).step_by(self.step.max(1))
    }

    pub fn limit_lines(&self) -> usize {
        self.arena_bytes / LINE_LEN
    }
}

/// Builds the patterns for every tested associativity.
pub fn build_patterns<P: SetPattern>(
    pattern: &P,
    config: &AssociativityConfig,
) -> Result<Vec<IndexPattern>, BenchError> {
    config
        .tested_ways()
        .map(|ways| pattern.generate(ways, config.limit_lines()))
        .collect()
}

/// Runs the whole associativity sweep and writes one CSV row per timed access.
pub fn run<P: SetPattern, W: Write + ?Sized>(
    pattern: &P,
    config: &AssociativityConfig,
    out: &mut W,
) -> Result<(), BenchError> {
    let patterns = build_patterns(pattern, config)?;
    let arena_lines = match patterns.iter().filter_map(IndexPattern::max_index).max() {
        Some(max) => max + 1,
        None => {
            log::warn!("No associativity to test");
            return Ok(());
        }
    };
    log::info!(
        "L{} associativity: {} patterns, arena of {} MiB",
        pattern.level(),
        patterns.len(),
        arena_lines * LINE_LEN >> 20
    );

    // Only the pattern lines get touched, the rest of the mapping is never faulted in.
    let mut arena = unsafe { MMappedMemory::<Line>::try_new_zeroed(arena_lines, config.huge_pages) }
        .map_err(BenchError::NoMem)?;
    for p in &patterns {
        for &i in &p.indices {
            arena[i].value = i as u64;
        }
    }

    writeln!(out, "{}", CSV_HEADER)?;
    for p in &patterns {
        log::info!("Testing {} ways ({} lines)", p.ways, p.indices.len());
        log::debug!("indices: {:?}", p.indices);
        measure_pattern(&arena, p, config.iterations, out)?;
    }
    out.flush()?;
    Ok(())
}

fn measure_pattern<W: Write + ?Sized>(
    arena: &[Line],
    pattern: &IndexPattern,
    iterations: usize,
    out: &mut W,
) -> Result<(), BenchError> {
    let mut samples = vec![0u64; pattern.measured];
    for _ in 0..iterations {
        // fill the set
        memory_barrier();
        for &i in &pattern.indices {
            memory_barrier();
            unsafe { maccess(&arena[i].value as *const u64) };
        }

        memory_barrier();
        for (sample, &i) in samples.iter_mut().zip(pattern.measured_indices()) {
            memory_barrier();
            *sample = unsafe { timed_load(&arena[i].value as *const u64) };
        }

        memory_barrier();
        for &i in &pattern.indices {
            unsafe { flush(&arena[i] as *const Line as *const u8) };
        }
        memory_barrier();

        for (k, time) in samples.iter().enumerate() {
            writeln!(out, "{},{},{}", pattern.ways, k, time)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = DEFAULT_ARENA_BYTES / LINE_LEN;

    fn l1() -> LevelGeometry {
        LevelGeometry::new(48 * 1024, 12)
    }

    fn l2() -> LevelGeometry {
        LevelGeometry::new(1280 * 1024, 10)
    }

    #[test]
    fn line_is_one_cache_line() {
        assert_eq!(LINE_LEN, 64);
        assert_eq!(std::mem::align_of::<Line>(), 64);
    }

    #[test]
    fn l1_indices_stride_by_cache_size() {
        let p = L1Pattern { l1_size: 48 * 1024 }.generate(4, LIMIT).unwrap();
        assert_eq!(p.indices, vec![0, 768, 1536, 2304]);
        assert_eq!(p.measured, 4);
        assert_eq!(p.measured_indices(), &p.indices[..]);
    }

    #[test]
    fn l2_conflicting_and_filler_lines() {
        let pattern = L2Pattern {
            l1: l1(),
            l2_size: 1280 * 1024,
        };
        let ways = 8;
        let p = pattern.generate(ways, LIMIT).unwrap();
        let l1_sets = 64;
        let l2_lines = 20480;
        let test_sets = l2_lines / ways;

        assert_eq!(p.indices.len(), ways + 12);
        assert_eq!(p.measured, ways);
        for &i in p.measured_indices() {
            assert_eq!(i % l1_sets, 0);
            assert_eq!(i % l2_lines, 0);
        }
        for &i in &p.indices[ways..] {
            assert_eq!(i % l1_sets, 0);
            assert_ne!(i % test_sets, 0);
        }
        assert_eq!(p.indices[..3], [0, 20480, 40960]);
        assert_eq!(p.indices[ways], 64);
    }

    #[test]
    fn l3_conflicting_and_filler_lines() {
        let pattern = L3Pattern {
            l1: l1(),
            l2: l2(),
            l3_size: 30 * 1024 * 1024,
        };
        let ways = 12;
        let p = pattern.generate(ways, LIMIT).unwrap();
        let l2_sets = 2048;
        let l3_lines = 491_520;
        let test_sets = l3_lines / ways;

        assert_eq!(p.indices.len(), ways + 12);
        for &i in p.measured_indices() {
            assert_eq!(i % 64, 0);
            assert_eq!(i % l2_sets, 0);
            assert_eq!(i % l3_lines, 0);
        }
        for &i in &p.indices[ways..] {
            assert_eq!(i % l2_sets, 0);
            assert_ne!(i % test_sets, 0);
        }
    }

    #[test]
    fn arena_too_small() {
        let pattern = L1Pattern { l1_size: 48 * 1024 };
        match pattern.generate(24, 768 * 10) {
            Err(BenchError::PatternExhausted { wanted, found, .. }) => {
                assert_eq!(wanted, 24);
                assert_eq!(found, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn degenerate_geometry() {
        assert!(L1Pattern { l1_size: 32 }.generate(2, LIMIT).is_err());
        let pattern = L2Pattern {
            l1: LevelGeometry::new(48 * 1024, 0),
            l2_size: 1 << 20,
        };
        assert!(matches!(
            pattern.generate(2, LIMIT),
            Err(BenchError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn degenerate_l3_geometry() {
        let zero_way_l2 = L3Pattern {
            l1: l1(),
            l2: LevelGeometry::new(1280 * 1024, 0),
            l3_size: 30 << 20,
        };
        assert!(matches!(
            zero_way_l2.generate(2, LIMIT),
            Err(BenchError::InvalidGeometry(_))
        ));
        let empty_l3 = L3Pattern {
            l1: l1(),
            l2: l2(),
            l3_size: 0,
        };
        assert!(matches!(
            empty_l3.generate(2, LIMIT),
            Err(BenchError::InvalidGeometry(_))
        ));
        let tiny_l1 = L3Pattern {
            l1: LevelGeometry::new(64, 2),
            l2: l2(),
            l3_size: 30 << 20,
        };
        assert!(tiny_l1.generate(2, LIMIT).is_err());
    }

    #[test]
    fn l3_limit_too_small() {
        // 8 L1 sets, 1024 L2 sets, 16384 L3 lines
        let pattern = L3Pattern {
            l1: LevelGeometry::new(32 * 1024, 64),
            l2: LevelGeometry::new(256 * 1024, 4),
            l3_size: 1 << 20,
        };
        match pattern.generate(2, 16384) {
            Err(BenchError::PatternExhausted { wanted, found, .. }) => {
                assert_eq!((wanted, found), (2, 1))
            }
            other => panic!("unexpected {:?}", other),
        }
        // both conflicting lines fit, only 14 of the 64 fillers do
        match pattern.generate(2, 16385) {
            Err(BenchError::PatternExhausted {
                wanted,
                found,
                limit_lines,
            }) => assert_eq!((wanted, found, limit_lines), (64, 14, 16385)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn default_sweep() {
        let config = AssociativityConfig::default();
        let ways: Vec<usize> = config.tested_ways().collect();
        assert_eq!(ways, vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20, 22, 24]);
        assert_eq!(
            L3Pattern {
                l1: l1(),
                l2: l2(),
                l3_size: 1 << 20
            }
            .default_output(),
            "cache_L3associativity_benchmark_data.csv"
        );
    }

    #[test]
    fn tiny_l1_run() {
        let config = AssociativityConfig {
            min_ways: 2,
            max_ways: 4,
            step: 2,
            iterations: 3,
            ..AssociativityConfig::default()
        };
        let mut out = Vec::new();
        run(&L1Pattern { l1_size: 32 * 1024 }, &config, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let rows: Vec<&str> = lines.collect();
        // 3 iterations x (2 + 4) measured lines
        assert_eq!(rows.len(), 18);
        assert!(rows[0].starts_with("2,0,"));
        assert!(rows[17].starts_with("4,3,"));
    }
}
