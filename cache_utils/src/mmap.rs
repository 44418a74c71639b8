use core::ffi::c_void;
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::ptr::{null_mut, NonNull};
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::errno::Errno::EINVAL;
use nix::sys::mman;

/// Default hugetlb page size on x86_64, `MAP_HUGETLB` mappings are multiples of it.
pub const HUGE_PAGE_LEN: usize = 2 << 20;

/// Length the kernel actually maps for `byte_len` bytes.
pub fn mapped_len(byte_len: usize, huge: bool) -> usize {
    if huge {
        (byte_len + HUGE_PAGE_LEN - 1) & !(HUGE_PAGE_LEN - 1)
    } else {
        byte_len
    }
}

/// Anonymous, private, page aligned mapping holding `size` values of `T`.
///
/// Benchmarks use it for their arenas so that the start of the buffer is
/// page aligned and huge pages can be requested.
pub struct MMappedMemory<T> {
    pointer: NonNull<T>,
    size: usize,
    huge: bool,
}

unsafe impl<T: Send> Send for MMappedMemory<T> {}
unsafe impl<T: Sync> Sync for MMappedMemory<T> {}

impl<T> MMappedMemory<T> {
    fn map(size: usize, huge: bool) -> Result<NonNull<T>, nix::Error> {
        assert_ne!(size_of::<T>(), 0);
        let len = match size.checked_mul(size_of::<T>()) {
            Some(len) if len != 0 => len,
            _ => return Err(nix::Error::Sys(EINVAL)),
        };
        let p = unsafe {
            mman::mmap(
                null_mut(),
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE
                    | mman::MapFlags::MAP_ANONYMOUS
                    | if huge {
                        mman::MapFlags::MAP_HUGETLB
                    } else {
                        mman::MapFlags::MAP_ANONYMOUS
                    },
                -1,
                0,
            )?
        };
        NonNull::new(p as *mut T).ok_or(nix::Error::Sys(EINVAL))
    }

    pub fn try_new(
        size: usize,
        huge: bool,
        initializer: impl Fn(usize) -> T,
    ) -> Result<MMappedMemory<T>, nix::Error> {
        let pointer = Self::map(size, huge)?;
        let s = MMappedMemory {
            pointer,
            size,
            huge,
        };
        for i in 0..s.size {
            unsafe { ptr::write(s.pointer.as_ptr().add(i), initializer(i)) };
        }
        Ok(s)
    }

    /// Maps without writing anything, so pages are only faulted in on first touch.
    ///
    /// # Safety
    ///
    /// The all-zero bit pattern must be a valid `T`.
    pub unsafe fn try_new_zeroed(size: usize, huge: bool) -> Result<MMappedMemory<T>, nix::Error> {
        let pointer = Self::map(size, huge)?;
        Ok(MMappedMemory {
            pointer,
            size,
            huge,
        })
    }

    pub fn slice(&self) -> &[T] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }

    pub fn byte_len(&self) -> usize {
        self.size * size_of::<T>()
    }
}

impl<T> Drop for MMappedMemory<T> {
    fn drop(&mut self) {
        for i in 0..self.size {
            unsafe { ptr::drop_in_place(self.pointer.as_ptr().add(i)) };
        }
        let len = mapped_len(self.byte_len(), self.huge);
        if let Err(e) = unsafe { mman::munmap(self.pointer.as_ptr() as *mut c_void, len) } {
            log::warn!("munmap of {} bytes failed: {}", len, e);
        }
    }
}

impl<T> Deref for MMappedMemory<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl<T> DerefMut for MMappedMemory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_LEN;

    #[test]
    fn initialised_mapping() {
        let m = MMappedMemory::try_new(3 * PAGE_LEN, false, |i| i as u8).unwrap();
        assert_eq!(m.len(), 3 * PAGE_LEN);
        assert_eq!(m[0], 0);
        assert_eq!(m[257], 1);
        assert_eq!(m.as_ptr() as usize % PAGE_LEN, 0);
    }

    #[test]
    fn zeroed_mapping_is_writable() {
        let mut m = unsafe { MMappedMemory::<u64>::try_new_zeroed(1024, false) }.unwrap();
        assert!(m.iter().all(|&v| v == 0));
        m[1023] = 7;
        assert_eq!(m.slice()[1023], 7);
        assert_eq!(m.byte_len(), 8 * 1024);
    }

    #[test]
    fn huge_mappings_unmap_whole_pages() {
        assert_eq!(mapped_len(100, false), 100);
        assert_eq!(mapped_len(1, true), HUGE_PAGE_LEN);
        assert_eq!(mapped_len(HUGE_PAGE_LEN, true), HUGE_PAGE_LEN);
        assert_eq!(mapped_len(HUGE_PAGE_LEN + 64, true), 2 * HUGE_PAGE_LEN);
    }

    #[test]
    fn empty_mapping_is_rejected() {
        assert!(MMappedMemory::<u8>::try_new(0, false, |_| 0).is_err());
        assert!(unsafe { MMappedMemory::<u64>::try_new_zeroed(usize::MAX, false) }.is_err());
    }
}
