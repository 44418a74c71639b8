use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

// Pid 0 is the calling thread, so these only affect the thread that calls them.

#[must_use = "This result must be used to restore affinity"]
pub fn set_affinity(cpu_set: &CpuSet) -> Result<CpuSet, nix::Error> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    sched_setaffinity(Pid::from_raw(0), cpu_set)?;
    Ok(old)
}

#[must_use = "This result must be used to restore affinity"]
pub fn pin_to_core(core: usize) -> Result<CpuSet, nix::Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    set_affinity(&cpu_set)
}

pub fn available_cores() -> Result<Vec<usize>, nix::Error> {
    let cpu_set = sched_getaffinity(Pid::from_raw(0))?;
    Ok((0..CpuSet::count())
        .filter(|&i| cpu_set.is_set(i).unwrap_or(false))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pin_and_restore() {
        // Run in a fresh thread so the test harness thread keeps its mask.
        thread::spawn(|| {
            let cores = available_cores().unwrap();
            assert!(!cores.is_empty());
            let old = pin_to_core(cores[0]).unwrap();
            assert_eq!(available_cores().unwrap(), vec![cores[0]]);
            let _ = set_affinity(&old).unwrap();
            assert_eq!(available_cores().unwrap(), cores);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn out_of_range_core_is_an_error() {
        assert!(pin_to_core(CpuSet::count()).is_err());
    }
}
