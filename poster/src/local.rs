//! Posters of the node this process is attached to.
use std::sync::Arc;

use crate::directory::Record;
use crate::lock::LockGuard;
use crate::op::{Endianness, Op, Wait};
use crate::{Error, IoctlCmd, IoctlReply, Node, PosterDate, Result};

/// A handle to a poster in a local node.
///
/// The handle names a directory record and the generation of the poster it held when the handle
/// was made. Once the poster is deleted every operation on the handle fails with
/// [`Error::ClosedOrEmpty`], even if a new poster reuses the record.
#[derive(Clone)]
pub struct LocalPoster {
    node: Arc<Node>,
    slot: u32,
    generation: u32,
}

/// Exclusive access to a local poster, from `take` until `give` or drop.
pub struct LocalGuard<'a> {
    poster: &'a LocalPoster,
    record: Record<'a>,
    op: Op,
    _lock: LockGuard<'a>,
}

impl LocalPoster {
    pub(crate) fn new(node: Arc<Node>, slot: u32, generation: u32) -> Self {
        LocalPoster {
            node,
            slot,
            generation,
        }
    }

    fn record(&self) -> Record<'_> {
        self.node.directory().record(self.slot)
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Whether the poster still exists.
    pub fn is_open(&self) -> bool {
        self.record().holds(self.generation)
    }

    /// The size in bytes, `0` once the poster is deleted.
    pub fn size(&self) -> usize {
        let record = self.record();
        let size = record.size();
        if record.holds(self.generation) {
            size as usize
        } else {
            0
        }
    }

    pub fn name(&self) -> Result<String> {
        let record = self.record();
        let name = record.name();
        if record.holds(self.generation) {
            Ok(name)
        } else {
            Err(Error::ClosedOrEmpty)
        }
    }

    /// Byte order of the poster's creator.
    pub fn endianness(&self) -> Endianness {
        self.record().endianness()
    }

    /// Acquire the poster for `op`, waiting in line behind earlier takers.
    pub fn take(&self, op: Op, wait: Wait) -> Result<LocalGuard<'_>> {
        let record = self.record();
        let lock = record.lock().acquire(wait)?;

        if !record.holds(self.generation) {
            return Err(Error::ClosedOrEmpty);
        }

        tracing::trace!(slot = self.slot, op = op.name(), "took poster");
        Ok(LocalGuard {
            poster: self,
            record,
            op,
            _lock: lock,
        })
    }

    pub fn read(&self, offset: usize, buf: &mut [u8], wait: Wait) -> Result<usize> {
        self.take(Op::Read, wait)?.read(offset, buf)
    }

    pub fn write(&self, offset: usize, data: &[u8], wait: Wait) -> Result<usize> {
        self.take(Op::Write, wait)?.write(offset, data)
    }

    pub fn ioctl(&self, cmd: IoctlCmd, wait: Wait) -> Result<IoctlReply> {
        self.take(Op::Ioctl, wait)?.ioctl(cmd)
    }

    /// Change the size of the poster, keeping its leading content.
    ///
    /// Only the creating process may resize. Growing zero-fills the new tail. Shrinking is only
    /// available with the `shrink` feature. If the arena has no room the poster is unchanged.
    pub fn resize(&self, size: usize, wait: Wait) -> Result<()> {
        self.take(Op::Ioctl, wait)?.resize(size as u64)
    }

    /// Delete the poster and release its buffer.
    ///
    /// Processes waiting to take it fail with [`Error::ClosedOrEmpty`] once they are served.
    pub fn delete(&self, wait: Wait) -> Result<()> {
        let guard = self.take(Op::Ioctl, wait)?;
        let _node = self.node.lock()?;
        self.node.arena()?.free(guard.record.data())?;
        guard.record.close();
        tracing::debug!(slot = self.slot, "deleted poster");
        Ok(())
    }
}

impl LocalGuard<'_> {
    pub fn op(&self) -> Op {
        self.op
    }

    pub fn len(&self) -> usize {
        self.record.size() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the poster was written since its creation.
    pub fn is_fresh(&self) -> bool {
        self.record.is_fresh()
    }

    pub fn date(&self) -> PosterDate {
        self.record.date()
    }

    pub fn data(&self) -> &[u8] {
        let region = self.poster.node.region();
        // Safety: we hold the poster lock, the buffer is not accessed by anyone else.
        unsafe { region.slice(self.record.data(), self.record.size()) }
    }

    /// The buffer for writing. Fails unless the poster was taken for [`Op::Write`].
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if self.op != Op::Write {
            return Err(Error::BadOperation("poster was not taken for writing"));
        }

        let region = self.poster.node.region();
        // Safety: as in `data`, and `&mut self` excludes other views through this guard.
        Ok(unsafe { region.slice_mut(self.record.data(), self.record.size()) })
    }

    /// Copy from the poster at `offset`, truncated at the poster's end.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let data = self.data();
        let tail = data
            .get(offset..)
            .ok_or(Error::BadOperation("offset past the end of the poster"))?;
        let len = tail.len().min(buf.len());
        buf[..len].copy_from_slice(&tail[..len]);
        Ok(len)
    }

    /// Copy into the poster at `offset`, truncated at the poster's end.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> Result<usize> {
        let data = self.data_mut()?;
        let tail = data
            .get_mut(offset..)
            .ok_or(Error::BadOperation("offset past the end of the poster"))?;
        let len = tail.len().min(src.len());
        tail[..len].copy_from_slice(&src[..len]);
        Ok(len)
    }

    pub fn ioctl(&mut self, cmd: IoctlCmd) -> Result<IoctlReply> {
        Ok(match cmd {
            IoctlCmd::GetDate => IoctlReply::Date(self.date()),
            IoctlCmd::Fresh => IoctlReply::Fresh(self.is_fresh()),
            IoctlCmd::GetSize => IoctlReply::Size(self.record.size()),
            IoctlCmd::Resize(size) => {
                self.resize(size)?;
                IoctlReply::Resized
            }
        })
    }

    fn resize(&mut self, size: u64) -> Result<()> {
        if self.op == Op::Read {
            return Err(Error::BadOperation("poster was taken for reading"));
        }

        if self.record.creator() != std::process::id() {
            return Err(Error::NotOwner);
        }

        let old = self.record.size();
        if size == old {
            return Ok(());
        }

        if size == 0 {
            return Err(Error::BadOperation("posters can not be empty"));
        }

        if size < old && !cfg!(feature = "shrink") {
            return Err(Error::BadOperation("shrinking posters is disabled"));
        }

        let node = &self.poster.node;
        let _guard = node.lock()?;
        let arena = node.arena()?;
        let region = node.region();

        let data = arena.malloc(size)?;
        let keep = old.min(size);
        region.copy_within(self.record.data(), data, keep);
        region.fill(data + keep, size - keep, 0);
        arena.free(self.record.data())?;
        self.record.set_buffer(data, size);

        tracing::debug!(slot = self.poster.slot, old, size, "resized poster");
        Ok(())
    }

    /// End the access. Equivalent to dropping the guard.
    pub fn give(self) {}
}

impl Drop for LocalGuard<'_> {
    fn drop(&mut self) {
        if self.op == Op::Write {
            self.record.touch(PosterDate::now());
        }
    }
}

impl core::fmt::Debug for LocalPoster {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalPoster")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}
