use std::time::{Duration, Instant};

/// The access a take bracket grants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
    Ioctl,
}

/// How long to wait for a contended poster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the lock is granted, however long that takes.
    Forever,
    /// Give up with [`TimedOut`](crate::Error::TimedOut) after the duration.
    ///
    /// A lock records at most seven waiters that gave up but were not yet passed over. A waiter
    /// timing out while all seven are recorded keeps its place until its turn comes, hands the
    /// lock on at once and only then reports `TimedOut`, so its wait is bounded by the holders
    /// ahead of it rather than by the duration.
    Timeout(Duration),
}

impl Default for Wait {
    fn default() -> Self {
        Wait::Timeout(Duration::from_secs(10))
    }
}

impl Wait {
    pub(crate) fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Forever => None,
            Wait::Timeout(dur) => Some(Instant::now() + dur),
        }
    }

    /// The duration, for socket timeouts.
    pub fn duration(self) -> Option<Duration> {
        match self {
            Wait::Forever => None,
            Wait::Timeout(dur) => Some(dur),
        }
    }
}

/// The byte order of the process that created a poster.
///
/// Poster payloads are opaque bytes and are never converted. The creator's order is recorded so
/// that readers on other hosts can interpret multi-byte values themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            Endianness::Little => 1,
            Endianness::Big => 2,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Endianness::Little),
            2 => Some(Endianness::Big),
            _ => None,
        }
    }
}

impl Op {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Op::Read => "read",
            Op::Write => "write",
            Op::Ioctl => "ioctl",
        }
    }
}

#[test]
fn native_order_matches_bytes() {
    let probe = 1u16.to_ne_bytes();
    let expected = if probe[0] == 1 {
        Endianness::Little
    } else {
        Endianness::Big
    };
    assert_eq!(Endianness::native(), expected);
    assert_eq!(Endianness::from_code(expected.code()), Some(expected));
}
