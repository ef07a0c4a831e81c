use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

pub const FIO_GETDATE: u32 = 0x5001;
pub const FIO_FRESH: u32 = 0x5002;
pub const FIO_GETSIZE: u32 = 0x5003;
pub const FIO_RESIZE: u32 = 0x5004;

/// Control commands on a poster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlCmd {
    /// Time of the last write.
    GetDate,
    /// Whether the poster was written since its creation.
    Fresh,
    /// The current size in bytes.
    GetSize,
    /// Change the size, see [`LocalPoster::resize`](crate::LocalPoster::resize).
    Resize(u64),
}

/// The answer to an [`IoctlCmd`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlReply {
    Date(PosterDate),
    Fresh(bool),
    Size(u64),
    Resized,
}

/// A wall clock timestamp, seconds and nanoseconds since the unix epoch.
///
/// The zero date means the poster was never written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PosterDate {
    pub secs: u64,
    pub nanos: u32,
}

impl PosterDate {
    pub fn now() -> Self {
        // A clock before the epoch is reported as the epoch.
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        PosterDate {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    pub fn is_set(&self) -> bool {
        *self != PosterDate::default()
    }
}

impl IoctlCmd {
    pub fn code(self) -> u32 {
        match self {
            IoctlCmd::GetDate => FIO_GETDATE,
            IoctlCmd::Fresh => FIO_FRESH,
            IoctlCmd::GetSize => FIO_GETSIZE,
            IoctlCmd::Resize(_) => FIO_RESIZE,
        }
    }

    /// Decode an argument-less command code.
    ///
    /// A resize carries its size and travels as its own request, its code is rejected here.
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            FIO_GETDATE => Ok(IoctlCmd::GetDate),
            FIO_FRESH => Ok(IoctlCmd::Fresh),
            FIO_GETSIZE => Ok(IoctlCmd::GetSize),
            other => Err(Error::BadIoctlCode(other)),
        }
    }
}

#[test]
fn resize_code_needs_an_argument() {
    assert_eq!(IoctlCmd::from_code(FIO_FRESH).ok(), Some(IoctlCmd::Fresh));
    assert!(matches!(
        IoctlCmd::from_code(FIO_RESIZE),
        Err(Error::BadIoctlCode(FIO_RESIZE))
    ));
    assert!(matches!(IoctlCmd::from_code(7), Err(Error::BadIoctlCode(7))));
}
