//! Parse and produce the `LISTEN_FDS` environment.
//!
//! We only ever look for one named descriptor, the arena segment, but preserve whatever else the
//! environment passed along so that a child sees the complete list.
use crate::RawFd;
use alloc::borrow::ToOwned;
use alloc::{string::String, vec::Vec};

#[cfg(feature = "std")]
use std::os::unix::process::CommandExt;

/// The first descriptor number passed by the `LISTEN_FDS` protocol.
const FD_BASE: RawFd = 3;

pub struct ListenFd {
    pub fd_base: RawFd,
    pub fd_len: RawFd,
    pub names: Vec<String>,
}

/// A descriptor list with the arena segment, either found or freshly created.
pub struct Handoff<F> {
    pub listen: ListenFd,
    /// The file we created ourselves, if the environment did not have one.
    pub file: Option<F>,
    /// The descriptor number under which the child will find the segment.
    pub target: RawFd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `LISTEN_PID` is set but is not our process.
    BadPid,
    /// `LISTEN_FDS` is not a descriptor count.
    BadFd,
    /// `LISTEN_FDNAMES` is not valid ASCII.
    BadNames,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BadPid => write!(f, "LISTEN_PID does not name this process"),
            Error::BadFd => write!(f, "LISTEN_FDS is not a valid descriptor count"),
            Error::BadNames => write!(f, "LISTEN_FDNAMES is not valid"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// https://github.com/systemd/systemd/blob/414ae39821f0c103b076fc5f7432f827e0e79765/src/libsystemd/sd-daemon/sd-daemon.c#L92-L129
impl ListenFd {
    /// Read the environment of this process.
    ///
    /// Returns `None` when `LISTEN_FDS` is not set at all.
    #[cfg(all(feature = "std", feature = "libc"))]
    pub fn from_env() -> Option<Result<Self, Error>> {
        let count = std::env::var_os("LISTEN_FDS")?;

        if let Some(pid) = std::env::var_os("LISTEN_PID") {
            let Some(Ok(pid)) = pid.to_str().map(|p| p.parse::<libc::pid_t>()) else {
                return Some(Err(Error::BadPid));
            };

            if pid != unsafe { libc::getpid() } {
                return Some(Err(Error::BadPid));
            }
        }

        let Some(count) = count.to_str() else {
            return Some(Err(Error::BadFd));
        };

        let names = std::env::var_os("LISTEN_FDNAMES");
        let names = match names.as_deref().map(|n| n.to_str()) {
            None => None,
            Some(Some(names)) => Some(names),
            Some(None) => return Some(Err(Error::BadNames)),
        };

        Some(Self::parse(count, names))
    }

    /// Interpret the values of `LISTEN_FDS` and `LISTEN_FDNAMES`.
    pub fn parse(count: &str, names: Option<&str>) -> Result<Self, Error> {
        let fd_len: RawFd = count.parse().map_err(|_| Error::BadFd)?;

        if fd_len < 0 {
            return Err(Error::BadFd);
        }

        let names = match names {
            // Must be a subset of ASCII.
            Some(names) if !names.is_ascii() => return Err(Error::BadNames),
            Some("") | None => Vec::new(),
            Some(names) => names.split(':').map(String::from).collect(),
        };

        Ok(ListenFd {
            fd_base: FD_BASE,
            fd_len,
            names,
        })
    }

    /// The descriptor number listed under `name`.
    pub fn position(&self, name: &str) -> Option<RawFd> {
        let num = self.names.iter().position(|v| v == name)?;
        let num = RawFd::try_from(num).ok().filter(|&n| n < self.fd_len)?;
        Some(self.fd_base + num)
    }
}

impl<F> Handoff<F> {
    /// Find the descriptor `fd_name` in the environment, or create it with `with`.
    pub fn named_or_try_create<R>(
        this: Option<ListenFd>,
        fd_name: &str,
        with: impl FnOnce() -> Result<F, R>,
    ) -> Result<Self, R> {
        let Some(mut listen) = this else {
            let file = with()?;

            return Ok(Handoff {
                listen: ListenFd {
                    fd_base: FD_BASE,
                    fd_len: 1,
                    names: Vec::from([fd_name.to_owned()]),
                },
                file: Some(file),
                target: FD_BASE,
            });
        };

        if let Some(target) = listen.position(fd_name) {
            return Ok(Handoff {
                listen,
                file: None,
                target,
            });
        }

        let file = with()?;
        // Names are positional, pad for any unnamed descriptors before us.
        listen.names.resize(listen.fd_len as usize, String::new());
        listen.names.push(fd_name.into());
        let target = listen.fd_base + listen.fd_len;
        listen.fd_len += 1;

        Ok(Handoff {
            listen,
            file: Some(file),
            target,
        })
    }

    /// Arrange for `proc` to inherit the descriptor list.
    ///
    /// # Safety
    ///
    /// The descriptor of `file` must stay open until the process has been spawned. The hook runs
    /// between fork and exec and may only use async-signal-safe calls.
    #[cfg(all(feature = "std", feature = "libc"))]
    pub unsafe fn prepare(&self, proc: &mut std::process::Command)
    where
        F: std::os::fd::AsRawFd,
    {
        let rawfd = self.file.as_ref().map(|v| v.as_raw_fd());
        proc.env("LISTEN_FDS", self.listen.fd_len.to_string());
        proc.env("LISTEN_FDNAMES", self.listen.names.join(":"));
        let target = self.target;

        unsafe {
            proc.pre_exec(move || {
                let pid = format!("{}\0", libc::getpid());
                static LISTEN_PID: &[u8] = b"LISTEN_PID\0";
                if -1 == libc::setenv(LISTEN_PID.as_ptr() as *const _, pid.as_ptr() as *const _, 1) {
                    return Err(std::io::Error::last_os_error());
                }

                let Some(rawfd) = rawfd else {
                    return Ok(());
                };

                if rawfd == target {
                    // Only needs to survive the exec.
                    if -1 == libc::fcntl(rawfd, libc::F_SETFD, 0) {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if -1 == libc::dup2(rawfd, target) {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names_and_position() {
        let listen = ListenFd::parse("2", Some("socket:POSTER_ARENA_FD")).unwrap();
        assert_eq!(listen.fd_len, 2);
        assert_eq!(listen.position("POSTER_ARENA_FD"), Some(4));
        assert_eq!(listen.position("socket"), Some(3));
        assert_eq!(listen.position("other"), None);
    }

    #[test]
    fn names_beyond_count_are_ignored() {
        let listen = ListenFd::parse("1", Some("a:b")).unwrap();
        assert_eq!(listen.position("b"), None);
    }

    #[test]
    fn bad_count() {
        assert_eq!(ListenFd::parse("three", None).err(), Some(Error::BadFd));
        assert_eq!(ListenFd::parse("-1", None).err(), Some(Error::BadFd));
    }

    #[test]
    fn create_when_missing() {
        let handoff = Handoff::<u8>::named_or_try_create::<()>(None, "arena", || Ok(7)).unwrap();
        assert_eq!(handoff.target, 3);
        assert_eq!(handoff.file, Some(7));

        let existing = ListenFd::parse("1", Some("socket")).unwrap();
        let handoff =
            Handoff::<u8>::named_or_try_create::<()>(Some(existing), "arena", || Ok(7)).unwrap();
        assert_eq!(handoff.target, 4);
        assert_eq!(handoff.listen.names, ["socket", "arena"]);
    }

    #[test]
    fn reuse_when_present() {
        let existing = ListenFd::parse("2", Some("socket:arena")).unwrap();
        let handoff = Handoff::<u8>::named_or_try_create::<()>(Some(existing), "arena", || {
            panic!("must not create a second segment")
        })
        .unwrap();
        assert_eq!(handoff.target, 4);
        assert!(handoff.file.is_none());
    }
}
