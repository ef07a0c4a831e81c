//! First-fit allocation with an address-sorted, coalescing free list.
//!
//! The layout is private to this module:
//!
//! ```text
//! 0        64                                                      capacity
//! | header | chunk | chunk | chunk | ...                                   |
//!            ^ {length, next, prev, signature} followed by the payload
//! ```
//!
//! All links are offsets from the start of the region. A chunk's `length` includes its own
//! header. The free list is sorted by offset, which makes coalescing a check of the two
//! list neighbours. No two free chunks are ever adjacent in memory.
use crate::{ArenaError, Region};

const ARENA_MAGIC: u64 = u64::from_be_bytes(*b"PSTRARNA");

const H_MAGIC: u64 = 0;
const H_CAPACITY: u64 = 8;
const H_FREE: u64 = 16;
const H_ROOT: u64 = 24;
/// Bytes reserved for the arena header, chunks start right after.
pub const HEADER_SIZE: u64 = 64;

const C_LEN: u64 = 0;
const C_NEXT: u64 = 8;
const C_PREV: u64 = 16;
const C_SIG: u64 = 24;
/// Bytes in front of every payload.
pub const CHUNK_HEADER: u64 = 32;

const SIG_FREE: u64 = u64::from_be_bytes(*b"CHNKFREE");
const SIG_USED: u64 = u64::from_be_bytes(*b"CHNKUSED");

/// Alignment of every chunk, and thus of every payload.
pub const ALIGN: u64 = 16;
/// No chunk is ever smaller, so a split never leaves an unusable sliver.
pub const MIN_CHUNK: u64 = 64;

/// No chunk can live at offset 0, that's the header.
const NIL: u64 = 0;

/// The allocator of one region.
///
/// This is only a view. All of the allocator's state lives inside the region itself, so any
/// number of `Arena` values, in any number of processes, may refer to the same arena. None of
/// the methods lock: the caller must serialize all calls touching the same arena.
#[derive(Clone, Copy)]
pub struct Arena<'r> {
    region: &'r Region,
    capacity: u64,
}

/// A free chunk, as reported for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeChunk {
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub capacity: u64,
    pub free_bytes: u64,
    pub free_chunks: u64,
    pub largest_free: u64,
}

impl<'r> Arena<'r> {
    /// Initialize `region` as an empty arena, discarding anything it held.
    ///
    /// The whole region past the header becomes a single free chunk.
    pub fn format(region: &'r Region) -> Result<Self, ArenaError> {
        let capacity = (region.len() as u64) & !(ALIGN - 1);

        if capacity < HEADER_SIZE + MIN_CHUNK {
            return Err(ArenaError::TooSmall { len: region.len() });
        }

        let arena = Arena { region, capacity };
        let first = HEADER_SIZE;
        arena.write_chunk(first, capacity - HEADER_SIZE, NIL, NIL, SIG_FREE);

        region.store_u64(H_CAPACITY, capacity);
        region.store_u64(H_FREE, first);
        region.store_u64(H_ROOT, NIL);
        // Last, anyone attaching only trusts a header with the magic.
        region
            .atomic_u64(H_MAGIC)
            .store(ARENA_MAGIC, core::sync::atomic::Ordering::Release);

        tracing::debug!(capacity, shared = region.is_shared(), "formatted arena");
        Ok(arena)
    }

    /// Use the arena previously formatted in `region`, possibly by another process.
    pub fn attach(region: &'r Region) -> Result<Self, ArenaError> {
        if !Self::is_formatted(region) {
            return Err(ArenaError::Unformatted);
        }

        let capacity = region.load_u64(H_CAPACITY);
        if capacity > region.len() as u64 || capacity < HEADER_SIZE + MIN_CHUNK {
            return Err(ArenaError::Corrupted { offset: H_CAPACITY });
        }

        Ok(Arena { region, capacity })
    }

    pub fn is_formatted(region: &Region) -> bool {
        region.len() as u64 >= HEADER_SIZE
            && region
                .atomic_u64(H_MAGIC)
                .load(core::sync::atomic::Ordering::Acquire)
                == ARENA_MAGIC
    }

    pub fn region(&self) -> &'r Region {
        self.region
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The offset the arena's user stored with [`Arena::set_root`], `None` if unset.
    pub fn root(&self) -> Option<u64> {
        Some(self.region.load_u64(H_ROOT)).filter(|&r| r != NIL)
    }

    pub fn set_root(&self, root: u64) {
        self.region.store_u64(H_ROOT, root);
    }

    /// The chunk size, header included, that satisfies a request for `n` bytes.
    pub fn chunk_size(n: u64) -> Option<u64> {
        let raw = n.checked_add(CHUNK_HEADER + ALIGN - 1)? & !(ALIGN - 1);
        Some(raw.max(MIN_CHUNK))
    }

    /// Allocate at least `n` bytes, returning the offset of the payload.
    ///
    /// The payload is not cleared.
    pub fn malloc(&self, n: u64) -> Result<u64, ArenaError> {
        let need = Self::chunk_size(n).ok_or(ArenaError::AllocationFailure {
            requested: n,
            largest_free: 0,
        })?;

        let mut largest_free = 0;
        let mut steps = self.max_chunks();
        let mut cur = self.region.load_u64(H_FREE);

        while cur != NIL {
            let len = self.free_len(cur)?;
            largest_free = largest_free.max(len);

            if len >= need {
                let chunk = if len - need >= MIN_CHUNK {
                    // Keep the head in place, only its length changes.
                    self.region.store_u64(cur + C_LEN, len - need);
                    let tail = cur + len - need;
                    self.write_chunk(tail, need, NIL, NIL, SIG_USED);
                    tail
                } else {
                    self.unlink(cur);
                    self.write_chunk(cur, len, NIL, NIL, SIG_USED);
                    cur
                };

                return Ok(chunk + CHUNK_HEADER);
            }

            cur = self.region.load_u64(cur + C_NEXT);
            steps = steps
                .checked_sub(1)
                .ok_or(ArenaError::Corrupted { offset: cur })?;
        }

        Err(ArenaError::AllocationFailure {
            requested: n,
            largest_free,
        })
    }

    /// Return an allocation to the free list.
    ///
    /// Offsets that were not returned by [`Arena::malloc`] of this arena, or that were already
    /// freed, are rejected without modifying anything.
    pub fn free(&self, payload: u64) -> Result<(), ArenaError> {
        let chunk = self.used_chunk(payload)?;
        let len = self.region.load_u64(chunk + C_LEN);

        // Find the list neighbours by address.
        let mut prev = NIL;
        let mut next = self.region.load_u64(H_FREE);
        let mut steps = self.max_chunks();
        while next != NIL && next < chunk {
            self.free_len(next)?;
            prev = next;
            next = self.region.load_u64(next + C_NEXT);
            steps = steps
                .checked_sub(1)
                .ok_or(ArenaError::Corrupted { offset: next })?;
        }

        if next == chunk {
            return Err(ArenaError::BadPointer { offset: payload });
        }

        self.write_chunk(chunk, len, next, prev, SIG_FREE);
        self.set_next(prev, chunk);
        if next != NIL {
            self.region.store_u64(next + C_PREV, chunk);
        }

        // Merge only if memory-adjacent, list adjacency alone says nothing.
        if next != NIL && chunk + len == next {
            let next_len = self.region.load_u64(next + C_LEN);
            self.unlink(next);
            self.region.store_u64(next + C_SIG, 0);
            self.region.store_u64(chunk + C_LEN, len + next_len);
        }

        if prev != NIL && prev + self.region.load_u64(prev + C_LEN) == chunk {
            let prev_len = self.region.load_u64(prev + C_LEN);
            let merged = self.region.load_u64(chunk + C_LEN);
            self.unlink(chunk);
            self.region.store_u64(chunk + C_SIG, 0);
            self.region.store_u64(prev + C_LEN, prev_len + merged);
        }

        Ok(())
    }

    /// The usable payload bytes of a live allocation.
    pub fn usable(&self, payload: u64) -> Result<u64, ArenaError> {
        let chunk = self.used_chunk(payload)?;
        Ok(self.region.load_u64(chunk + C_LEN) - CHUNK_HEADER)
    }

    pub fn stats(&self) -> Result<ArenaStats, ArenaError> {
        let mut stats = ArenaStats {
            capacity: self.capacity,
            ..ArenaStats::default()
        };

        for chunk in self.free_chunks()? {
            stats.free_bytes += chunk.len;
            stats.free_chunks += 1;
            stats.largest_free = stats.largest_free.max(chunk.len);
        }

        Ok(stats)
    }

    /// All free chunks in list order, which is address order.
    pub fn free_chunks(&self) -> Result<Vec<FreeChunk>, ArenaError> {
        let mut chunks = vec![];
        let mut cur = self.region.load_u64(H_FREE);

        while cur != NIL {
            if chunks.len() as u64 > self.max_chunks() {
                return Err(ArenaError::Corrupted { offset: cur });
            }

            let len = self.free_len(cur)?;
            chunks.push(FreeChunk { offset: cur, len });
            cur = self.region.load_u64(cur + C_NEXT);
        }

        Ok(chunks)
    }

    /// Upper bound of chunks, a longer list walk means the links form a cycle.
    fn max_chunks(&self) -> u64 {
        self.capacity / MIN_CHUNK + 1
    }

    fn write_chunk(&self, chunk: u64, len: u64, next: u64, prev: u64, sig: u64) {
        self.region.store_u64(chunk + C_LEN, len);
        self.region.store_u64(chunk + C_NEXT, next);
        self.region.store_u64(chunk + C_PREV, prev);
        self.region.store_u64(chunk + C_SIG, sig);
    }

    fn set_next(&self, chunk: u64, next: u64) {
        if chunk == NIL {
            self.region.store_u64(H_FREE, next);
        } else {
            self.region.store_u64(chunk + C_NEXT, next);
        }
    }

    fn unlink(&self, chunk: u64) {
        let next = self.region.load_u64(chunk + C_NEXT);
        let prev = self.region.load_u64(chunk + C_PREV);
        self.set_next(prev, next);
        if next != NIL {
            self.region.store_u64(next + C_PREV, prev);
        }
    }

    /// Validate a chunk header before trusting its length, returning the length.
    fn chunk_len(&self, chunk: u64, sig: u64) -> Option<u64> {
        if chunk < HEADER_SIZE || chunk % ALIGN != 0 || chunk + CHUNK_HEADER > self.capacity {
            return None;
        }

        if self.region.load_u64(chunk + C_SIG) != sig {
            return None;
        }

        let len = self.region.load_u64(chunk + C_LEN);
        let fits = chunk.checked_add(len).map_or(false, |end| end <= self.capacity);
        if len < MIN_CHUNK || len % ALIGN != 0 || !fits {
            return None;
        }

        Some(len)
    }

    fn free_len(&self, chunk: u64) -> Result<u64, ArenaError> {
        self.chunk_len(chunk, SIG_FREE)
            .ok_or(ArenaError::Corrupted { offset: chunk })
    }

    fn used_chunk(&self, payload: u64) -> Result<u64, ArenaError> {
        let bad = ArenaError::BadPointer { offset: payload };
        let chunk = payload.checked_sub(CHUNK_HEADER).ok_or(bad)?;
        self.chunk_len(chunk, SIG_USED).ok_or(bad)?;
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::anonymous(1 << 14).unwrap()
    }

    #[test]
    fn format_is_one_chunk() {
        let region = region();
        let arena = Arena::format(&region).unwrap();
        let chunks = arena.free_chunks().unwrap();
        assert_eq!(
            chunks,
            [FreeChunk {
                offset: HEADER_SIZE,
                len: (1 << 14) - HEADER_SIZE
            }]
        );
        assert_eq!(arena.root(), None);
    }

    #[test]
    fn attach_requires_format() {
        let region = region();
        assert_eq!(Arena::attach(&region).err(), Some(ArenaError::Unformatted));
        Arena::format(&region).unwrap().set_root(128);
        let attached = Arena::attach(&region).unwrap();
        assert_eq!(attached.root(), Some(128));
    }

    #[test]
    fn too_small() {
        let region = Region::anonymous(64).unwrap();
        assert!(matches!(
            Arena::format(&region),
            Err(ArenaError::TooSmall { .. })
        ));
    }

    #[test]
    fn split_from_the_tail() {
        let region = region();
        let arena = Arena::format(&region).unwrap();
        let a = arena.malloc(100).unwrap();
        let need = Arena::chunk_size(100).unwrap();
        assert_eq!(a, (1 << 14) - need + CHUNK_HEADER);
        assert!(arena.usable(a).unwrap() >= 100);

        let chunks = arena.free_chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, HEADER_SIZE);
        assert_eq!(chunks[0].len, (1 << 14) - HEADER_SIZE - need);
    }

    #[test]
    fn exact_fit_takes_whole_chunk() {
        let region = region();
        let arena = Arena::format(&region).unwrap();
        let all = (1 << 14) - HEADER_SIZE - CHUNK_HEADER;
        let a = arena.malloc(all).unwrap();
        assert_eq!(a, HEADER_SIZE + CHUNK_HEADER);
        assert!(arena.free_chunks().unwrap().is_empty());
        assert!(matches!(
            arena.malloc(1),
            Err(ArenaError::AllocationFailure { largest_free: 0, .. })
        ));
        arena.free(a).unwrap();
        assert_eq!(arena.free_chunks().unwrap().len(), 1);
    }

    #[test]
    fn coalesce_both_sides() {
        let region = region();
        let arena = Arena::format(&region).unwrap();
        let a = arena.malloc(64).unwrap();
        let b = arena.malloc(64).unwrap();
        let c = arena.malloc(64).unwrap();

        arena.free(a).unwrap();
        arena.free(c).unwrap();
        // `c` merged into the big head chunk, `a` sits alone at the end.
        assert_eq!(arena.free_chunks().unwrap().len(), 2);

        arena.free(b).unwrap();
        let chunks = arena.free_chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len, arena.capacity() - HEADER_SIZE);
    }

    #[test]
    fn rejects_foreign_and_double_free() {
        let region = region();
        let arena = Arena::format(&region).unwrap();
        let a = arena.malloc(64).unwrap();

        assert_eq!(arena.free(a + 16), Err(ArenaError::BadPointer { offset: a + 16 }));
        assert_eq!(arena.free(8), Err(ArenaError::BadPointer { offset: 8 }));
        assert_eq!(arena.free(1 << 20), Err(ArenaError::BadPointer { offset: 1 << 20 }));

        arena.free(a).unwrap();
        let before = arena.free_chunks().unwrap();
        assert_eq!(arena.free(a), Err(ArenaError::BadPointer { offset: a }));
        assert_eq!(arena.free_chunks().unwrap(), before);
    }

    #[test]
    fn stats_track_usage() {
        let region = region();
        let arena = Arena::format(&region).unwrap();
        let empty = arena.stats().unwrap();
        assert_eq!(empty.free_chunks, 1);

        let a = arena.malloc(1000).unwrap();
        let used = arena.stats().unwrap();
        assert_eq!(
            used.free_bytes,
            empty.free_bytes - Arena::chunk_size(1000).unwrap()
        );

        arena.free(a).unwrap();
        assert_eq!(arena.stats().unwrap(), empty);
    }
}
