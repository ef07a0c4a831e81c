//! The error taxonomy shared by the local backend, the remote proxy and the server.
use poster_arena::ArenaError;
use thiserror::Error;

/// Errors of poster operations.
///
/// Failures reported by a remote server are decoded onto the same variants as local ones, only
/// [`Error::TransportFailure`] tells that the network itself failed.
#[derive(Debug, Error)]
pub enum Error {
    /// No poster of that name exists.
    #[error("poster not found")]
    NotFound,

    /// A poster of that name already exists.
    #[error("poster name already in use")]
    DuplicateName,

    /// Only the creating process may do this.
    #[error("operation reserved to the process that created the poster")]
    NotOwner,

    /// The poster was deleted, or has not been written yet.
    #[error("poster is closed or empty")]
    ClosedOrEmpty,

    /// The ioctl code is not known.
    #[error("unknown ioctl code {0:#x}")]
    BadIoctlCode(u32),

    /// The operation or its arguments are not valid for this poster.
    #[error("bad operation: {0}")]
    BadOperation(&'static str),

    /// The arena has no room.
    #[error("arena allocation failed")]
    AllocationFailure,

    /// The connection to a remote poster server failed.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] std::io::Error),

    /// A peer sent something we can not interpret.
    #[error("protocol corruption: {0}")]
    ProtocolCorruption(&'static str),

    /// Neither a local node nor a remote host is available, or the configuration is invalid.
    #[error("configuration missing: {0}")]
    ConfigurationMissing(&'static str),

    /// A timed wait for a poster lock or a server reply expired.
    #[error("timed out")]
    TimedOut,

    /// Another poster server already answers on the address.
    #[error("a poster server already answers on {0}")]
    AlreadyRunning(String),

    /// Creating or mapping the shared memory segment failed.
    #[error("shared memory segment: {0}")]
    Segment(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The status code transmitted for this error, never `0`.
    pub fn code(&self) -> u32 {
        match self {
            Error::NotFound => 1,
            Error::DuplicateName => 2,
            Error::NotOwner => 3,
            Error::ClosedOrEmpty => 4,
            Error::BadIoctlCode(_) => 5,
            Error::BadOperation(_) => 6,
            Error::AllocationFailure => 7,
            Error::TransportFailure(_) => 8,
            Error::ProtocolCorruption(_) => 9,
            Error::ConfigurationMissing(_) => 10,
            Error::TimedOut => 11,
            Error::AlreadyRunning(_) => 12,
            Error::Segment(_) => 13,
        }
    }

    /// Decode a status received from a server.
    ///
    /// The details of an error do not travel, only its kind.
    pub fn from_code(code: u32) -> Self {
        const REMOTE: &str = "reported by server";
        match code {
            1 => Error::NotFound,
            2 => Error::DuplicateName,
            3 => Error::NotOwner,
            4 => Error::ClosedOrEmpty,
            5 => Error::BadIoctlCode(0),
            6 => Error::BadOperation(REMOTE),
            7 => Error::AllocationFailure,
            // The server's own transport, e.g. to its segment, is not ours.
            8 | 13 => Error::ProtocolCorruption("server-side I/O failure"),
            9 => Error::ProtocolCorruption(REMOTE),
            10 => Error::ConfigurationMissing(REMOTE),
            11 => Error::TimedOut,
            12 => Error::AlreadyRunning(REMOTE.into()),
            _ => Error::ProtocolCorruption("unknown status code"),
        }
    }

    /// Map socket errors, keeping timeouts apart.
    pub(crate) fn transport(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::TransportFailure(err),
        }
    }
}

impl From<ArenaError> for Error {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::AllocationFailure { .. } => Error::AllocationFailure,
            ArenaError::BadPointer { .. } => Error::BadOperation("not an arena allocation"),
            ArenaError::Unformatted => Error::ConfigurationMissing("segment holds no poster arena"),
            ArenaError::TooSmall { .. } => Error::ConfigurationMissing("segment too small"),
            ArenaError::Corrupted { .. } => Error::ProtocolCorruption("arena free list corrupted"),
        }
    }
}
