//! Pass the shared-memory segment of a poster node to the processes using it.
//!
//! A host process creates the segment once, sized at startup, and hands it down to its children
//! following the systemd `LISTEN_FDS` conventions. Every child attaches to the same segment under
//! the name [`ARENA_FD_NAME`], at whatever address its own mapping ends up.
#![cfg_attr(not(feature = "std"), no_std)]

use core::ffi::c_int as RawFd;
extern crate alloc;

mod listenfd;

pub use listenfd::{Error, Handoff, ListenFd};

/// The name under which the arena segment is listed in `LISTEN_FDNAMES`.
pub const ARENA_FD_NAME: &str = "POSTER_ARENA_FD";

/// A raw file descriptor of an arena segment, opened for us by the environment.
///
/// The code does assume to own it, but it won't close the file descriptor.
pub struct SharedFd {
    fd: RawFd,
}

impl SharedFd {
    /// Import the arena segment from the `LISTEN_FDS` environment.
    ///
    /// # Safety
    /// Caller asserts that the environment has been set to a file descriptor that is not owned by
    /// any other resource.
    #[cfg(all(feature = "std", feature = "libc"))]
    pub unsafe fn from_env() -> Option<Self> {
        let listen = ListenFd::from_env()?.ok()?;
        Self::from_listen(&listen)
    }

    /// Import the arena segment from already parsed `LISTEN_FDS` information.
    ///
    /// Returns `None` if no descriptor carries [`ARENA_FD_NAME`] or if the descriptor is not open.
    ///
    /// # Safety
    /// Same as [`SharedFd::from_env`], the named descriptor must not be owned elsewhere.
    #[cfg(feature = "libc")]
    pub unsafe fn from_listen(var: &ListenFd) -> Option<Self> {
        let fd = var.position(ARENA_FD_NAME)?;

        let mut statbuf = unsafe { core::mem::zeroed::<libc::stat>() };
        if -1 == unsafe { libc::fstat(fd, &mut statbuf) } {
            return None;
        }

        Some(SharedFd { fd })
    }

    /// Open the descriptor as an anonymous memory file.
    ///
    /// This fails if the descriptor does not refer to a memfd, e.g. when a regular file was
    /// passed instead.
    #[cfg(all(feature = "memfile", feature = "std"))]
    pub fn into_file(self) -> Result<memfile::MemFile, std::io::Error> {
        let fd = self.into_raw_fd();
        memfile::MemFile::from_file(fd).map_err(|err| err.into_error())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn into_raw_fd(self) -> RawFd {
        let this = core::mem::ManuallyDrop::new(self);
        this.fd
    }
}

#[cfg(feature = "std")]
impl std::os::unix::io::AsRawFd for SharedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
