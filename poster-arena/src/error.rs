//! Arena-specific error types.
use std::error::Error;
use std::fmt;

/// Errors of arena formatting, attaching and allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// No free chunk is large enough. The arena never grows.
    AllocationFailure {
        /// Number of bytes requested.
        requested: u64,
        /// The largest chunk that was available, header included.
        largest_free: u64,
    },
    /// The offset was not obtained from this allocator, or was already freed.
    BadPointer { offset: u64 },
    /// The region does not start with an arena header.
    Unformatted,
    /// The region can not hold even a single chunk.
    TooSmall { len: usize },
    /// A free-list link or chunk header points outside the arena.
    Corrupted { offset: u64 },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure {
                requested,
                largest_free,
            } => write!(
                f,
                "arena exhausted: requested {requested} bytes, largest free chunk {largest_free} bytes"
            ),
            Self::BadPointer { offset } => {
                write!(f, "offset {offset:#x} is not a live arena allocation")
            }
            Self::Unformatted => write!(f, "region holds no arena"),
            Self::TooSmall { len } => write!(f, "region of {len} bytes is too small for an arena"),
            Self::Corrupted { offset } => write!(f, "arena corrupted at offset {offset:#x}"),
        }
    }
}

impl Error for ArenaError {}
