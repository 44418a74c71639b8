//! Decoding of the deterministic cache parameter CPUID leaf.
//!
//! Intel exposes it as leaf 0x4, AMD mirrors the same layout at leaf
//! 0x8000001D. The benchmarks use it to pick default cache sizes and
//! associativities when none are given on the command line.

use core::arch::x86_64 as arch_x86;

const INTEL_CACHE_INFO_LEAF: u32 = 0x4;
const AMD_CACHE_INFO_LEAF: u32 = 0x8000_001d;
const AMD_EXTENDED_MAX_LEAF: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

impl CpuVendor {
    pub fn get_cpu_vendor() -> CpuVendor {
        let r = unsafe { arch_x86::__cpuid(0) };
        CpuVendor::decode_cpu_vendor(&r)
    }

    pub fn decode_cpu_vendor(cpuid_result: &arch_x86::CpuidResult) -> CpuVendor {
        let mut vendor_string = [0u8; 12];
        vendor_string[0..4].copy_from_slice(&cpuid_result.ebx.to_le_bytes());
        vendor_string[4..8].copy_from_slice(&cpuid_result.edx.to_le_bytes());
        vendor_string[8..12].copy_from_slice(&cpuid_result.ecx.to_le_bytes());
        match &vendor_string {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Unknown,
        }
    }

    fn cache_info_leaf(&self) -> Option<u32> {
        match self {
            CpuVendor::Intel => Some(INTEL_CACHE_INFO_LEAF),
            CpuVendor::Amd => {
                let max = unsafe { arch_x86::__cpuid(AMD_EXTENDED_MAX_LEAF) }.eax;
                if max >= AMD_CACHE_INFO_LEAF {
                    Some(AMD_CACHE_INFO_LEAF)
                } else {
                    None
                }
            }
            CpuVendor::Unknown => None,
        }
    }
}

pub fn get_cache_info() -> Vec<CacheInfo> {
    let mut ret = Vec::new();
    let leaf = match CpuVendor::get_cpu_vendor().cache_info_leaf() {
        Some(leaf) => leaf,
        None => return ret,
    };
    let mut i = 0;

    while let Some(cache_info) =
        CacheInfo::from_cpuid_result(&unsafe { arch_x86::__cpuid_count(leaf, i) })
    {
        ret.push(cache_info);
        i += 1;
    }
    ret
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheType {
    Null = 0,
    Data = 1,
    Instruction = 2,
    Unified = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub cache_type: CacheType,
    pub level: u8,
    pub self_init: bool,
    pub fully_assoc: bool,
    pub max_id_for_cache: u16,
    pub core_in_package: u16,
    pub cache_line_size: u16,
    pub physical_line_partition: u16,
    pub associativity: u16,
    pub sets: u32,
    pub wbinvd_no_guarantee: bool,
    pub inclusive: bool,
    pub complex_cache_indexing: bool,
}

impl CacheInfo {
    pub fn from_cpuid_result(cr: &arch_x86::CpuidResult) -> Option<CacheInfo> {
        let ctype = cr.eax & 0x1f;
        let cache_type = match ctype {
            0 => {
                return None;
            }
            1 => CacheType::Data,
            2 => CacheType::Instruction,
            3 => CacheType::Unified,
            _ => {
                return None;
            }
        };
        let level: u8 = (cr.eax >> 5 & 0x7) as u8;
        let self_init = (cr.eax >> 8 & 0x1) != 0;
        let fully_assoc = (cr.eax >> 9 & 0x1) != 0;
        let max_id_for_cache = (cr.eax >> 14 & 0xfff) as u16 + 1;
        let core_in_package = (cr.eax >> 26 & 0x3f) as u16 + 1;
        let cache_line_size = (cr.ebx & 0xfff) as u16 + 1;
        let physical_line_partition = (cr.ebx >> 12 & 0x3ff) as u16 + 1;
        let associativity = (cr.ebx >> 22 & 0x3ff) as u16 + 1;
        let sets = cr.ecx + 1;
        let wbinvd_no_guarantee = (cr.edx & 0x1) != 0;
        let inclusive = (cr.edx & 0x2) != 0;
        let complex_cache_indexing = (cr.edx & 0x4) != 0;

        Some(CacheInfo {
            cache_type,
            level,
            self_init,
            fully_assoc,
            max_id_for_cache,
            core_in_package,
            cache_line_size,
            physical_line_partition,
            associativity,
            sets,
            wbinvd_no_guarantee,
            inclusive,
            complex_cache_indexing,
        })
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.associativity as usize
            * self.physical_line_partition as usize
            * self.cache_line_size as usize
            * self.sets as usize
    }

    /// True for caches that hold data, i.e. not the instruction caches.
    pub fn holds_data(&self) -> bool {
        matches!(self.cache_type, CacheType::Data | CacheType::Unified)
    }

    /// The data (or unified) cache of a given level, if the CPU reported one.
    pub fn find_data_cache(infos: &[CacheInfo], level: u8) -> Option<&CacheInfo> {
        infos
            .iter()
            .find(|info| info.level == level && info.holds_data())
    }
}
