//! Cache line size detection through false sharing.
//!
//! Two threads hammer two counters placed `stride / 2` bytes apart. While both
//! counters sit on one line, every increment bounces the line between the
//! cores and the run is slow. The first stride where the run time drops
//! sharply is twice the distance that separates two lines, so the line size
//! is the stride just before the drop.

use std::io::Write;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use cache_utils::affinity::pin_to_core;
use cache_utils::mmap::MMappedMemory;
use cache_utils::PAGE_LEN;

use crate::error::BenchError;

pub const STRIDES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
pub const REPETITIONS: usize = 10;
pub const INCREMENTS: u64 = 10_000_000;

pub const CSV_HEADER: &str = "stride,milliseconds";

const MIN_STRIDE: usize = 2 * size_of::<AtomicU64>();

#[derive(Debug, Clone)]
pub struct FalseSharingConfig {
    pub strides: Vec<usize>,
    pub repetitions: usize,
    pub increments: u64,
    pub cores: Option<(usize, usize)>,
}

impl Default for FalseSharingConfig {
    fn default() -> Self {
        FalseSharingConfig {
            strides: STRIDES.to_vec(),
            repetitions: REPETITIONS,
            increments: INCREMENTS,
            cores: None,
        }
    }
}

/// Word offsets of the two counters inside the page for a given stride.
pub fn counter_slots(stride: usize) -> Result<(usize, usize), BenchError> {
    if !stride.is_power_of_two() || !(MIN_STRIDE..=PAGE_LEN).contains(&stride) {
        return Err(BenchError::InvalidStride(stride));
    }
    Ok((0, stride / 2 / size_of::<AtomicU64>()))
}

fn hammer(
    counter: &AtomicU64,
    increments: u64,
    start: &Barrier,
    core: Option<usize>,
) -> Result<Duration, BenchError> {
    // the thread exits right after, no need to restore the old mask
    let pinned = core.map(pin_to_core).transpose();
    // both threads must reach the barrier, even the one that failed to pin
    start.wait();
    pinned.map_err(BenchError::Affinity)?;
    let begin = Instant::now();
    for _ in 0..increments {
        counter.fetch_add(1, Ordering::Relaxed);
    }
    Ok(begin.elapsed())
}

/// One race between the two threads; returns the mean of their run times.
pub fn race(
    stride: usize,
    increments: u64,
    cores: Option<(usize, usize)>,
) -> Result<Duration, BenchError> {
    let (first, second) = counter_slots(stride)?;
    let words = PAGE_LEN / size_of::<AtomicU64>();
    let page = MMappedMemory::try_new(words, false, |_| AtomicU64::new(0))
        .map_err(BenchError::NoMem)?;
    let start = Barrier::new(2);

    let (a, b) = thread::scope(|s| {
        let a = s.spawn(|| hammer(&page[first], increments, &start, cores.map(|c| c.0)));
        let b = s.spawn(|| hammer(&page[second], increments, &start, cores.map(|c| c.1)));
        (a.join(), b.join())
    });
    let a = a.map_err(|_| BenchError::WorkerPanicked)??;
    let b = b.map_err(|_| BenchError::WorkerPanicked)??;

    debug_assert_eq!(page[first].load(Ordering::Relaxed), increments);
    debug_assert_eq!(page[second].load(Ordering::Relaxed), increments);
    Ok((a + b) / 2)
}

pub fn run<W: Write + ?Sized>(config: &FalseSharingConfig, out: &mut W) -> Result<(), BenchError> {
    for &stride in &config.strides {
        counter_slots(stride)?;
    }
    writeln!(out, "{}", CSV_HEADER)?;
    for repetition in 0..config.repetitions {
        log::info!("Repetition {}/{}", repetition + 1, config.repetitions);
        for &stride in &config.strides {
            let time = race(stride, config.increments, config.cores)?;
            log::debug!("stride {}: {:?}", stride, time);
            writeln!(out, "{},{:.3}", stride, time.as_secs_f64() * 1000.0)?;
            out.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_utils::affinity::available_cores;
    use nix::sched::CpuSet;
    use std::sync::mpsc;

    #[test]
    fn slots_are_half_a_stride_apart() {
        assert_eq!(counter_slots(16).unwrap(), (0, 1));
        assert_eq!(counter_slots(128).unwrap(), (0, 8));
        assert_eq!(counter_slots(4096).unwrap(), (0, 256));
    }

    #[test]
    fn bad_strides() {
        for stride in [0, 8, 48, 8192] {
            assert!(matches!(
                counter_slots(stride),
                Err(BenchError::InvalidStride(s)) if s == stride
            ));
        }
    }

    #[test]
    fn short_race() {
        let time = race(64, 10_000, None).unwrap();
        assert!(time > Duration::ZERO);
    }

    #[test]
    fn failed_pin_does_not_block_the_other_thread() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(race(64, 1_000, Some((0, CpuSet::count()))));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("race stuck on the start barrier");
        assert!(matches!(result, Err(BenchError::Affinity(_))));
    }

    #[test]
    fn pinned_race() {
        let cores = available_cores().unwrap();
        let pair = (cores[0], cores[cores.len() - 1]);
        let time = race(64, 10_000, Some(pair)).unwrap();
        assert!(time > Duration::ZERO);

        let config = FalseSharingConfig {
            strides: vec![64],
            repetitions: 1,
            increments: 1_000,
            cores: Some(pair),
        };
        let mut out = Vec::new();
        run(&config, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }

    #[test]
    fn short_sweep() {
        let config = FalseSharingConfig {
            strides: vec![16, 256],
            repetitions: 2,
            increments: 1_000,
            cores: None,
        };
        let mut out = Vec::new();
        run(&config, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows[0], CSV_HEADER);
        assert_eq!(rows.len(), 5);
        assert!(rows[1].starts_with("16,"));
        assert!(rows[4].starts_with("256,"));
    }

    #[test]
    fn invalid_stride_fails_before_output() {
        let config = FalseSharingConfig {
            strides: vec![64, 100],
            ..FalseSharingConfig::default()
        };
        let mut out = Vec::new();
        assert!(run(&config, &mut out).is_err());
        assert!(out.is_empty());
    }
}
