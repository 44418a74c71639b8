//! Total cache capacity through a pointer-chasing working set sweep.
//!
//! The arena is threaded with a singly linked list of [`Pair`]s, one per
//! `stride` bytes. Following the first `count` links touches `count` distinct
//! lines; the cycles per load stay flat while those lines fit in a cache level
//! and climb once they do not. Within every group of 256 elements the order is
//! scrambled with a CRC-8 style sequence, and bit 14 of every address is
//! flipped, so that neither the stride prefetchers nor the open DRAM row help.

use std::hint::black_box;
use std::io::Write;
use std::mem::{align_of, size_of};
use std::ptr::{self, null};

use cache_utils::mmap::MMappedMemory;
use cache_utils::rdtsc_fence;

use crate::error::BenchError;

/// CRC-8-SAE J1850 feedback taps.
pub const POLY8: u8 = 0x1d;
pub const POLY_INIT8: u8 = 0xff;

/// Flipped in every scrambled offset so consecutive elements land in different DRAM rows.
pub const SCRAMBLE_BIT: usize = 1 << 14;

pub const LOADS_PER_ROW: usize = 4;
pub const ESTIMATED_PASSES: usize = 11;
pub const MAXIMUM_PASSES: usize = 20;
pub const DEFAULT_MAX_CACHE_MB: f64 = 32.0;
pub const MAXIMUM_ARENA_MB: usize = 1152;
const SWEEP_STEP_BYTES: usize = 4 * 1024;
const MB: f64 = 1024.0 * 1024.0;

/// Known L3 sizes in MiB, the working sets tried by the maximum sweep.
pub const POSSIBLE_CACHE_SIZES_MB: [f64; 70] = [
    1.0, 1.5, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 8.25, 9.0, 10.0, 11.0, 12.0, 13.75, 14.0, 15.0, 16.0,
    16.5, 18.0, 19.25, 20.0, 22.0, 22.5, 24.0, 24.75, 25.0, 26.25, 27.5, 30.0, 30.25, 32.0, 33.0,
    33.75, 35.0, 35.75, 36.0, 37.5, 38.5, 39.0, 40.0, 42.0, 45.0, 48.0, 52.5, 54.0, 55.0, 57.0,
    60.0, 64.0, 67.5, 71.5, 75.0, 77.0, 82.5, 96.0, 97.5, 105.0, 112.5, 128.0, 160.0, 180.0,
    192.0, 250.0, 256.0, 260.0, 300.0, 320.0, 384.0, 768.0, 1152.0,
];

pub fn poly_shift8(x: u8) -> u8 {
    (x << 1) ^ (((x as i8) >> 7) as u8 & POLY8)
}

/// 0 followed by the 255 non-zero bytes in POLY8 order.
pub fn mixed_up_offsets() -> [usize; 256] {
    let mut mixed_up = [0usize; 256];
    let mut x = POLY_INIT8;
    for slot in mixed_up.iter_mut().skip(1) {
        *slot = x as usize;
        x = poly_shift8(x);
    }
    mixed_up
}

/// One list element. `data` is never read by the sweep, it only pads the pair.
#[repr(C)]
pub struct Pair {
    next: *const Pair,
    data: u64,
}

pub const MIN_STRIDE: usize = size_of::<Pair>();

/// Where each list element lives inside the arena.
#[derive(Debug, Clone)]
pub struct ChainLayout {
    stride: usize,
    element_count: usize,
    linear: bool,
    mixed_up: [usize; 256],
}

impl ChainLayout {
    /// Largest prefix of `bytes` a layout can use without an element escaping the arena.
    pub fn usable_bytes(bytes: usize, stride: usize, linear: bool) -> usize {
        if linear || stride == 0 {
            return bytes;
        }
        let granule = (2 * SCRAMBLE_BIT).max(256 * stride);
        bytes - bytes % granule
    }

    pub fn new(bytes: usize, stride: usize, linear: bool) -> Result<ChainLayout, BenchError> {
        if stride < MIN_STRIDE || stride % align_of::<Pair>() != 0 {
            return Err(BenchError::InvalidStride(stride));
        }
        if !linear && (!stride.is_power_of_two() || stride > SCRAMBLE_BIT) {
            return Err(BenchError::InvalidStride(stride));
        }
        let usable = ChainLayout::usable_bytes(bytes, stride, linear);
        let element_count = usable / stride;
        if element_count == 0 {
            return Err(BenchError::InvalidGeometry(format!(
                "{} bytes cannot hold a list with a {} byte stride",
                bytes, stride
            )));
        }
        Ok(ChainLayout {
            stride,
            element_count,
            linear,
            mixed_up: mixed_up_offsets(),
        })
    }

    pub fn element_count(&self) -> usize {
        self.element_count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes of arena covered by the layout.
    pub fn span(&self) -> usize {
        self.element_count * self.stride
    }

    /// Byte offset of element `i`.
    pub fn offset(&self, i: usize) -> usize {
        if self.linear {
            i * self.stride
        } else {
            let element = (i & !0xff) | self.mixed_up[i & 0xff];
            (element * self.stride) ^ SCRAMBLE_BIT
        }
    }

    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.element_count).map(move |i| self.offset(i))
    }
}

/// A list threaded through an arena; borrows the arena for as long as it is walked.
pub struct PointerChain<'a> {
    head: *const Pair,
    arena: &'a [u8],
    layout: ChainLayout,
}

/// Writes the list described by `layout` into `arena` and returns its head.
pub fn make_long_list(
    arena: &mut [u8],
    layout: ChainLayout,
) -> Result<PointerChain<'_>, BenchError> {
    if layout.span() > arena.len() {
        return Err(BenchError::InvalidGeometry(format!(
            "list spans {} bytes but the arena only has {}",
            layout.span(),
            arena.len()
        )));
    }
    if arena.as_ptr() as usize % align_of::<Pair>() != 0 {
        return Err(BenchError::InvalidGeometry(
            "arena is not pointer aligned".to_owned(),
        ));
    }

    let base = arena.as_mut_ptr();
    // Every offset is a multiple of 8 and stays below span, checked above.
    let head = unsafe { base.add(layout.offset(0)) } as *mut Pair;
    let mut current = head;
    for i in 1..layout.element_count() {
        let next = unsafe { base.add(layout.offset(i)) } as *mut Pair;
        unsafe { ptr::write(current, Pair { next, data: 0 }) };
        current = next;
    }
    unsafe {
        ptr::write(
            current,
            Pair {
                next: null(),
                data: 0,
            },
        )
    };

    Ok(PointerChain {
        head,
        arena,
        layout,
    })
}

/// Reads every word of `bytes`, evicting whatever was cached before.
pub fn trash_the_caches(bytes: &[u8]) -> u64 {
    let sum = bytes
        .chunks_exact(size_of::<u64>())
        .fold(0u64, |sum, word| {
            let mut w = [0u8; 8];
            w.copy_from_slice(word);
            sum.wrapping_add(u64::from_ne_bytes(w))
        });
    black_box(sum)
}

impl<'a> PointerChain<'a> {
    pub fn layout(&self) -> &ChainLayout {
        &self.layout
    }

    pub fn arena(&self) -> &'a [u8] {
        self.arena
    }

    /// Number of elements reachable from the head.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut p = self.head;
        while !p.is_null() {
            n += 1;
            p = unsafe { (*p).next };
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn trash_the_caches(&self) -> u64 {
        trash_the_caches(self.arena)
    }

    /// Follows `count` links and returns the average cycles per load.
    pub fn scrambled_loads(&self, count: usize) -> u64 {
        if count == 0 {
            return 0;
        }
        let mut p = self.head;
        let start = unsafe { rdtsc_fence() };
        // unrolled by four to keep loop overhead out of the timing
        for _ in 0..(count >> 2) {
            if !p.is_null() {
                p = unsafe { (*p).next };
            }
            if !p.is_null() {
                p = unsafe { (*p).next };
            }
            if !p.is_null() {
                p = unsafe { (*p).next };
            }
            if !p.is_null() {
                p = unsafe { (*p).next };
            }
        }
        let stop = unsafe { rdtsc_fence() };
        black_box(p);
        stop.wrapping_sub(start) / count as u64
    }
}

/// One row of the sweep: working set label and the element count it covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub label: f64,
    pub count: usize,
}

/// 4 KiB to `max_cache_mb` MiB in 4 KiB steps, labelled in KiB.
pub fn estimated_points(line_size: usize, max_cache_mb: f64) -> Vec<SweepPoint> {
    if line_size == 0 {
        return Vec::new();
    }
    let max_count = (max_cache_mb * MB) as usize / line_size;
    let step = SWEEP_STEP_BYTES / line_size;
    if step == 0 {
        return Vec::new();
    }
    (step..=max_count)
        .step_by(step)
        .map(|count| SweepPoint {
            label: (count * line_size) as f64 / 1024.0,
            count,
        })
        .collect()
}

/// The known L3 sizes, labelled in MiB.
pub fn maximum_points(line_size: usize) -> Vec<SweepPoint> {
    if line_size == 0 {
        return Vec::new();
    }
    POSSIBLE_CACHE_SIZES_MB
        .iter()
        .map(|&mb| SweepPoint {
            label: mb,
            count: (mb * MB) as usize / line_size,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub line_size: usize,
    pub arena_bytes: usize,
    pub passes: usize,
    pub huge_pages: bool,
}

impl SweepConfig {
    pub fn estimated(line_size: usize, max_cache_mb: f64) -> SweepConfig {
        SweepConfig {
            line_size,
            arena_bytes: (max_cache_mb * MB) as usize,
            passes: ESTIMATED_PASSES,
            huge_pages: false,
        }
    }

    pub fn maximum(line_size: usize) -> SweepConfig {
        SweepConfig {
            line_size,
            arena_bytes: MAXIMUM_ARENA_MB << 20,
            passes: MAXIMUM_PASSES,
            huge_pages: false,
        }
    }
}

/// Maps the arena, threads the list and times every point `passes` times.
pub fn run<W: Write + ?Sized>(
    config: &SweepConfig,
    points: &[SweepPoint],
    header: &str,
    out: &mut W,
) -> Result<(), BenchError> {
    let layout = ChainLayout::new(config.arena_bytes, config.line_size, false)?;
    let mut arena = unsafe { MMappedMemory::<u8>::try_new_zeroed(layout.span(), config.huge_pages) }
        .map_err(BenchError::NoMem)?;
    log::info!(
        "Threading {} elements through {} MiB",
        layout.element_count(),
        layout.span() >> 20
    );
    let chain = make_long_list(&mut arena, layout)?;
    sweep(&chain, points, config.passes, header, out)
}

pub fn sweep<W: Write + ?Sized>(
    chain: &PointerChain<'_>,
    points: &[SweepPoint],
    passes: usize,
    header: &str,
    out: &mut W,
) -> Result<(), BenchError> {
    if let Some(last) = points.last() {
        if last.count > chain.layout().element_count() {
            log::warn!(
                "working sets past {} elements exceed the list and are truncated",
                chain.layout().element_count()
            );
        }
    }
    writeln!(out, "{}", header)?;
    for pass in 0..passes {
        log::info!("Pass {}/{}", pass + 1, passes);
        for point in points {
            chain.trash_the_caches();
            let mut loads = [0u64; LOADS_PER_ROW];
            for load in loads.iter_mut() {
                *load = chain.scrambled_loads(point.count);
            }
            write!(out, "{}", point.label)?;
            for load in &loads {
                write!(out, ",{}", load)?;
            }
            writeln!(out)?;
        }
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn poly8_sequence() {
        let mixed = mixed_up_offsets();
        assert_eq!(
            mixed[..17],
            [
                0, 0xff, 0xe3, 0xdb, 0xab, 0x4b, 0x96, 0x31, 0x62, 0xc4, 0x95, 0x37, 0x6e, 0xdc,
                0xa5, 0x57, 0xae
            ]
        );
        assert_eq!(mixed[255], 0xf1);
        let distinct: HashSet<usize> = mixed.iter().copied().collect();
        assert_eq!(distinct.len(), 256);
    }

    #[test]
    fn poly8_period() {
        let mut x = POLY_INIT8;
        for _ in 0..255 {
            x = poly_shift8(x);
        }
        assert_eq!(x, POLY_INIT8);
        assert_eq!(poly_shift8(0), 0);
    }

    #[test]
    fn scrambled_layout_is_a_permutation() {
        let stride = 64;
        let layout = ChainLayout::new(1 << 20, stride, false).unwrap();
        assert_eq!(layout.element_count(), (1 << 20) / stride);
        assert_eq!(layout.offset(0), SCRAMBLE_BIT);
        assert_eq!(layout.offset(1), (0xff * stride) ^ SCRAMBLE_BIT);
        let offsets: HashSet<usize> = layout.offsets().collect();
        assert_eq!(offsets.len(), layout.element_count());
        assert!(offsets
            .iter()
            .all(|&o| o % stride == 0 && o + MIN_STRIDE <= layout.span()));
    }

    #[test]
    fn usable_bytes_rounding() {
        assert_eq!(ChainLayout::usable_bytes(100_000, 64, false), 98_304);
        assert_eq!(ChainLayout::usable_bytes(100_000, 256, false), 65_536);
        assert_eq!(ChainLayout::usable_bytes(100_000, 64, true), 100_000);
        assert!(ChainLayout::new(16 * 1024, 64, false).is_err());
    }

    #[test]
    fn invalid_strides() {
        assert!(ChainLayout::new(1 << 20, 8, false).is_err());
        assert!(ChainLayout::new(1 << 20, 20, true).is_err());
        assert!(ChainLayout::new(1 << 20, 96, false).is_err());
        assert!(ChainLayout::new(1 << 20, 96, true).is_ok());
    }

    #[test]
    fn linear_chain() {
        let mut arena = MMappedMemory::try_new(4096, false, |_| 0xaau8).unwrap();
        let layout = ChainLayout::new(4096, 128, true).unwrap();
        let chain = make_long_list(&mut arena, layout).unwrap();
        assert_eq!(chain.len(), 32);
        // next pointers of element 0 and 1 point one stride ahead
        let base = chain.arena().as_ptr() as usize;
        let first = unsafe { &*(base as *const Pair) };
        assert_eq!(first.next as usize, base + 128);
        assert_eq!(first.data, 0);
    }

    #[test]
    fn scrambled_chain_visits_every_element() {
        let mut arena = unsafe { MMappedMemory::<u8>::try_new_zeroed(1 << 20, false) }.unwrap();
        let layout = ChainLayout::new(1 << 20, 64, false).unwrap();
        let count = layout.element_count();
        let chain = make_long_list(&mut arena, layout).unwrap();
        assert_eq!(chain.len(), count);
        assert!(!chain.is_empty());
        assert_eq!(chain.scrambled_loads(0), 0);
        let _ = chain.scrambled_loads(count * 2);
        chain.trash_the_caches();
    }

    #[test]
    fn arena_too_small_for_layout() {
        let mut arena = vec![0u64; 16];
        let bytes = unsafe { std::slice::from_raw_parts_mut(arena.as_mut_ptr() as *mut u8, 128) };
        let layout = ChainLayout::new(1 << 20, 64, false).unwrap();
        assert!(make_long_list(bytes, layout).is_err());
    }

    #[test]
    fn trash_sums_words() {
        let words = [1u64, 2, 3, u64::MAX];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        assert_eq!(trash_the_caches(&bytes), 5);
    }

    #[test]
    fn sweep_points() {
        let estimated = estimated_points(64, 1.0);
        assert_eq!(estimated.len(), 256);
        assert_eq!(estimated[0], SweepPoint { label: 4.0, count: 64 });
        assert_eq!(estimated[255].label, 1024.0);

        let maximum = maximum_points(64);
        assert_eq!(maximum.len(), POSSIBLE_CACHE_SIZES_MB.len());
        assert_eq!(maximum[1], SweepPoint { label: 1.5, count: 24576 });
        assert_eq!(maximum.last().unwrap().count, 1152 * 16384);
    }

    #[test]
    fn tiny_sweep() {
        let config = SweepConfig {
            line_size: 64,
            arena_bytes: 1 << 20,
            passes: 2,
            huge_pages: false,
        };
        let points = estimated_points(64, 0.0625);
        let mut out = Vec::new();
        run(&config, &points, "size_kb,load1,load2,load3,load4", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(rows.len(), 2 * 16);
        assert!(rows[0].starts_with("4,"));
        assert_eq!(rows[0].split(',').count(), 1 + LOADS_PER_ROW);
    }
}
