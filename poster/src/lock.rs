//! A FIFO ticket lock living inside a shared region.
//!
//! Every process that maps the region sees the same lock words, so the lock excludes threads and
//! processes alike. Tickets are served strictly in the order they were drawn. A waiter that gives
//! up before its turn can not return its ticket, instead it leaves a note in one of a few
//! abandonment slots and the releasing holder skips that ticket on its behalf.
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use poster_arena::Region;

use crate::op::Wait;
use crate::{Error, Result};

/// Size of the lock words in the region.
pub(crate) const LOCK_SIZE: u64 = 64;

const L_NEXT: u64 = 0;
const L_SERVING: u64 = 4;
const L_ABANDONED: u64 = 8;
const ABANDON_SLOTS: u64 = 7;

/// Marks an occupied abandonment slot, so that ticket `0` is distinguishable from empty.
const ABANDON_MARK: u64 = 1 << 32;

/// A view of the lock words at `at`.
#[derive(Clone, Copy)]
pub(crate) struct TicketLock<'r> {
    region: &'r Region,
    at: u64,
}

/// Holds a [`TicketLock`], releasing it on drop.
pub(crate) struct LockGuard<'r> {
    lock: TicketLock<'r>,
}

impl<'r> TicketLock<'r> {
    pub(crate) fn new(region: &'r Region, at: u64) -> Self {
        assert!(region.contains(at, LOCK_SIZE));
        TicketLock { region, at }
    }

    /// Reset to unlocked. Only valid while nobody can reach the lock.
    pub(crate) fn init(&self) {
        self.region.fill(self.at, LOCK_SIZE, 0);
    }

    fn next(&self) -> &'r AtomicU32 {
        self.region.atomic_u32(self.at + L_NEXT)
    }

    fn serving(&self) -> &'r AtomicU32 {
        self.region.atomic_u32(self.at + L_SERVING)
    }

    fn abandoned(&self) -> impl Iterator<Item = &'r AtomicU64> + 'r {
        let (region, at) = (self.region, self.at);
        (0..ABANDON_SLOTS).map(move |idx| region.atomic_u64(at + L_ABANDONED + 8 * idx))
    }

    pub(crate) fn acquire(self, wait: Wait) -> Result<LockGuard<'r>> {
        let ticket = self.next().fetch_add(1, Ordering::SeqCst);
        let deadline = wait.deadline();

        loop {
            let serving = self.serving().load(Ordering::SeqCst);
            if serving == ticket {
                return Ok(LockGuard { lock: self });
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
            };

            futex::wait(self.serving(), serving, remaining);
        }

        self.abandon(ticket)
    }

    /// Give up `ticket` after a timeout.
    fn abandon(self, ticket: u32) -> Result<LockGuard<'r>> {
        let mark = ABANDON_MARK | u64::from(ticket);
        let slot = self.abandoned().find(|slot| {
            slot.compare_exchange(0, mark, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });

        let Some(slot) = slot else {
            // No room to leave a note. Wait for the turn and pass it on right away, the queue
            // behind us must not stall on a ticket nobody holds.
            tracing::debug!(ticket, "abandonment slots full, waiting out the turn");
            let guard = self.acquire_turn(ticket);
            drop(guard);
            return Err(Error::TimedOut);
        };

        // Our turn may have come between the last check and the note.
        if self.serving().load(Ordering::SeqCst) == ticket
            && slot
                .compare_exchange(mark, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Ok(LockGuard { lock: self });
        }

        Err(Error::TimedOut)
    }

    fn acquire_turn(self, ticket: u32) -> LockGuard<'r> {
        loop {
            let serving = self.serving().load(Ordering::SeqCst);
            if serving == ticket {
                return LockGuard { lock: self };
            }
            futex::wait(self.serving(), serving, None);
        }
    }

    fn release(&self) {
        let mut next = self.serving().load(Ordering::SeqCst).wrapping_add(1);

        loop {
            self.serving().store(next, Ordering::SeqCst);
            let mark = ABANDON_MARK | u64::from(next);
            let skipped = self.abandoned().any(|slot| {
                slot.compare_exchange(mark, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            });

            if !skipped {
                break;
            }

            next = next.wrapping_add(1);
        }

        futex::wake_all(self.serving());
    }

    /// Tickets drawn but not yet released, the holder included.
    #[cfg(test)]
    fn queued(&self) -> u32 {
        let next = self.next().load(Ordering::SeqCst);
        next.wrapping_sub(self.serving().load(Ordering::SeqCst))
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(target_os = "linux")]
mod futex {
    use core::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Sleep while `word` still holds `expected`.
    ///
    /// This is a shared futex, not a private one, the word may be mapped by other processes.
    /// Spurious returns are fine, every caller re-checks its condition.
    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        let ts = timeout.map(|dur| libc::timespec {
            tv_sec: dur.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: dur.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(core::ptr::null(), |ts| ts as *const libc::timespec);

        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
            )
        };
    }

    pub(super) fn wake_all(word: &AtomicU32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32,
                libc::FUTEX_WAKE,
                libc::c_int::MAX,
            )
        };
    }
}

#[cfg(not(target_os = "linux"))]
mod futex {
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const POLL: Duration = Duration::from_micros(200);

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
        if word.load(Ordering::SeqCst) != expected {
            return;
        }
        std::thread::sleep(timeout.map_or(POLL, |t| t.min(POLL)));
    }

    pub(super) fn wake_all(_: &AtomicU32) {}
}
