//! Variable-size allocation inside one flat memory region.
//!
//! The region is either private to the process or a shared mapping that other processes attach
//! to at their own base address. The allocator keeps all of its state, the free list included,
//! inside the region and links everything with offsets relative to the region start.
//!
//! ## Not thread-safe on its own
//!
//! The arena does not lock. It is a building block for the poster node, which serializes every
//! allocation and deallocation behind its own lock. Calling [`Arena::malloc`] or [`Arena::free`]
//! concurrently on the same region, from threads or processes, corrupts the free list.
mod arena;
mod error;
mod region;

pub use arena::{Arena, ArenaStats, FreeChunk, ALIGN, CHUNK_HEADER, HEADER_SIZE, MIN_CHUNK};
pub use error::ArenaError;
pub use region::Region;
