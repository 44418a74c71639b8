use cache_utils::cache_info::{get_cache_info, CacheInfo};

use crate::error::BenchError;

pub const FALLBACK_L1_SIZE: usize = 256 * 1024;
/// L1 size the L1 benchmark falls back to.
pub const FALLBACK_L1_ONLY_SIZE: usize = 288 * 1024;
pub const FALLBACK_L1_ASSOCIATIVITY: usize = 10;
pub const FALLBACK_L2_SIZE: usize = 5 * 1024 * 1024;
pub const FALLBACK_L2_ASSOCIATIVITY: usize = 12;
pub const FALLBACK_L3_SIZE: usize = 10 * 1024 * 1024;
pub const FALLBACK_LINE_SIZE: usize = 64;

/// Size and associativity of one cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelGeometry {
    pub size: usize,
    pub associativity: usize,
}

impl LevelGeometry {
    pub fn new(size: usize, associativity: usize) -> LevelGeometry {
        LevelGeometry {
            size,
            associativity,
        }
    }

    pub fn lines(&self, line_size: usize) -> usize {
        self.size / line_size
    }

    /// Number of sets, failing when the level is too small to hold one set.
    pub fn sets(&self, line_size: usize) -> Result<usize, BenchError> {
        if self.associativity == 0 {
            return Err(BenchError::InvalidGeometry(
                "associativity must be at least 1".to_owned(),
            ));
        }
        match self.lines(line_size) / self.associativity {
            0 => Err(BenchError::InvalidGeometry(format!(
                "{} bytes with {} ways holds no complete set of {} byte lines",
                self.size, self.associativity, line_size
            ))),
            sets => Ok(sets),
        }
    }
}

/// What the CPU told us about its caches, level by level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedCaches {
    pub l1: Option<LevelGeometry>,
    pub l2: Option<LevelGeometry>,
    pub l3: Option<LevelGeometry>,
    pub line_size: Option<usize>,
}

impl DetectedCaches {
    pub fn detect() -> DetectedCaches {
        let infos = get_cache_info();
        let detected = DetectedCaches::from_cache_info(&infos);
        log::debug!("CPUID cache descriptors: {:#?}", infos);
        detected
    }

    pub fn from_cache_info(infos: &[CacheInfo]) -> DetectedCaches {
        let level = |l: u8| {
            CacheInfo::find_data_cache(infos, l)
                .map(|info| LevelGeometry::new(info.size(), info.associativity as usize))
        };
        DetectedCaches {
            l1: level(1),
            l2: level(2),
            l3: level(3),
            line_size: CacheInfo::find_data_cache(infos, 1)
                .map(|info| info.cache_line_size as usize),
        }
    }
}
