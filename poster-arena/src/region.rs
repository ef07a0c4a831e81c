//! A mapped byte region, addressed by offsets only.
use core::sync::atomic::{AtomicU32, AtomicU64};
use memmap2::{MmapMut, MmapOptions, MmapRaw};
use std::os::unix::io::AsRawFd;

/// The backing store of an arena.
///
/// Either an anonymous, process-local mapping or a shared mapping of a file descriptor. Other
/// processes may map the same file at a different base address, so nothing stored _inside_ the
/// region is ever a pointer. Every access resolves an offset against our own mapping instead.
///
/// Word-sized fields are accessed as atomics, which is sound even while another process writes
/// to them. Byte ranges are copied in and out and must be protected by the caller's locking.
pub struct Region {
    base: *mut u8,
    len: usize,
    /// Keeps the mapping alive. Not accessed besides `Drop`, all access goes through `base`.
    #[allow(dead_code)]
    map: Mapping,
}

enum Mapping {
    Anonymous(MmapMut),
    Shared(MmapRaw),
}

// Safety: the region is plain memory and every access through it is either atomic or a raw copy
// whose exclusion is the caller's responsibility, see the type documentation.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map `len` bytes of fresh, zeroed, process-local memory.
    pub fn anonymous(len: usize) -> Result<Self, std::io::Error> {
        let mut map = MmapOptions::new().len(len).map_anon()?;
        let base = map.as_mut_ptr();
        Ok(Region {
            base,
            len: map.len(),
            map: Mapping::Anonymous(map),
        })
    }

    /// Map the whole file `fd` shared, readable and writable.
    ///
    /// All mappings of the same file observe each other's writes.
    pub fn from_fd<T: AsRawFd>(fd: &T) -> Result<Self, std::io::Error> {
        let map = MmapRaw::map_raw(fd)?;
        Ok(Region {
            base: map.as_mut_ptr(),
            len: map.len(),
            map: Mapping::Shared(map),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether other processes can map the same memory.
    pub fn is_shared(&self) -> bool {
        matches!(self.map, Mapping::Shared(_))
    }

    /// Check that `[off, off+len)` is inside the region.
    pub fn contains(&self, off: u64, len: u64) -> bool {
        off.checked_add(len)
            .map_or(false, |end| end <= self.len as u64)
    }

    fn resolve(&self, off: u64, len: u64) -> *mut u8 {
        assert!(
            self.contains(off, len),
            "range {off}+{len} out of bounds (len={})",
            self.len
        );
        // Safety: just checked to be in-bounds of the mapping.
        unsafe { self.base.add(off as usize) }
    }

    pub fn atomic_u32(&self, off: u64) -> &AtomicU32 {
        assert!(off % 4 == 0, "misaligned u32 at {off}");
        let ptr = self.resolve(off, 4);
        // Safety: aligned, in-bounds, and the mapping is initialized (zeroed on creation) memory
        // that lives as long as `self`. Atomics have no uniqueness requirement.
        unsafe { &*(ptr as *const AtomicU32) }
    }

    pub fn atomic_u64(&self, off: u64) -> &AtomicU64 {
        assert!(off % 8 == 0, "misaligned u64 at {off}");
        let ptr = self.resolve(off, 8);
        // Safety: see `atomic_u32`.
        unsafe { &*(ptr as *const AtomicU64) }
    }

    pub fn load_u64(&self, off: u64) -> u64 {
        self.atomic_u64(off).load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn store_u64(&self, off: u64, val: u64) {
        self.atomic_u64(off)
            .store(val, core::sync::atomic::Ordering::Relaxed)
    }

    pub fn load_u32(&self, off: u64) -> u32 {
        self.atomic_u32(off).load(core::sync::atomic::Ordering::Relaxed)
    }

    pub fn store_u32(&self, off: u64, val: u32) {
        self.atomic_u32(off)
            .store(val, core::sync::atomic::Ordering::Relaxed)
    }

    /// Copy `data` into the region at `off`.
    pub fn copy_in(&self, off: u64, data: &[u8]) {
        let ptr = self.resolve(off, data.len() as u64);
        // Safety: in-bounds, `data` can not overlap with a raw mapping we never hand out mutably.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) }
    }

    /// Copy from the region at `off` into `buf`.
    pub fn copy_out(&self, off: u64, buf: &mut [u8]) {
        let ptr = self.resolve(off, buf.len() as u64);
        // Safety: in-bounds, see `copy_in`.
        unsafe { core::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) }
    }

    /// Copy `len` bytes between two ranges of the region.
    pub fn copy_within(&self, from: u64, to: u64, len: u64) {
        let src = self.resolve(from, len);
        let dst = self.resolve(to, len);
        // Safety: both in-bounds. Overlap is permitted by `copy`.
        unsafe { core::ptr::copy(src, dst, len as usize) }
    }

    pub fn fill(&self, off: u64, len: u64, byte: u8) {
        let ptr = self.resolve(off, len);
        // Safety: in-bounds.
        unsafe { core::ptr::write_bytes(ptr, byte, len as usize) }
    }

    /// View a byte range.
    ///
    /// # Safety
    ///
    /// No other process or thread may write the range while the slice is alive. In practice the
    /// caller holds the lock protecting it.
    pub unsafe fn slice(&self, off: u64, len: u64) -> &[u8] {
        let ptr = self.resolve(off, len);
        unsafe { core::slice::from_raw_parts(ptr, len as usize) }
    }

    /// Mutably view a byte range.
    ///
    /// # Safety
    ///
    /// No other process or thread may access the range while the slice is alive, and no other
    /// slice of it may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, off: u64, len: u64) -> &mut [u8] {
        let ptr = self.resolve(off, len);
        unsafe { core::slice::from_raw_parts_mut(ptr, len as usize) }
    }
}

#[test]
fn anonymous_is_zeroed() {
    let region = Region::anonymous(4096).unwrap();
    let mut buf = [0xffu8; 64];
    region.copy_out(4096 - 64, &mut buf);
    assert_eq!(buf, [0u8; 64]);
    assert_eq!(region.load_u64(0), 0);
}

#[test]
fn bounds() {
    let region = Region::anonymous(4096).unwrap();
    assert!(region.contains(0, 4096));
    assert!(!region.contains(1, 4096));
    assert!(!region.contains(u64::MAX, 2));
}
