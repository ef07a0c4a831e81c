//! Posters owned by a poster server on another host.
//!
//! A remote poster is mirrored in a local cache. Taking it pulls the whole content into the
//! cache, giving back a write access pushes the whole cache in a single write. Between the two
//! the caller works on the cache only.
use crate::client::RpcClient;
use crate::op::{Endianness, Op};
use crate::wire::{Reply, Request};
use crate::{Error, IoctlCmd, IoctlReply, Result};

#[derive(Clone, Debug)]
pub struct RemotePoster {
    host: String,
    id: u64,
    /// Our pid if we created the poster.
    owner: Option<u32>,
    endianness: Endianness,
    cache: Vec<u8>,
}

/// Access to the cache of a taken remote poster.
///
/// A write access is pushed to the server by [`RemoteGuard::give`], or on drop, in which case a
/// failure is only logged.
pub struct RemoteGuard<'a> {
    poster: &'a mut RemotePoster,
    client: &'a mut RpcClient,
    op: Op,
    given: bool,
}

fn unexpected() -> Error {
    Error::ProtocolCorruption("reply does not match request")
}

impl RemotePoster {
    pub(crate) fn create(client: &mut RpcClient, name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BadOperation("posters can not be empty"));
        }

        let endianness = Endianness::native();
        let request = Request::Create {
            name: name.to_owned(),
            len: size as u64,
            endianness,
        };

        let Reply::Created { id } = client.call(&request)? else {
            return Err(unexpected());
        };

        tracing::debug!(host = client.host(), name, id, "created remote poster");
        Ok(RemotePoster {
            host: client.host().to_owned(),
            id,
            owner: Some(std::process::id()),
            endianness,
            cache: vec![0; size],
        })
    }

    pub(crate) fn find(client: &mut RpcClient, name: &str) -> Result<Self> {
        let request = Request::Find {
            name: name.to_owned(),
        };

        let Reply::Found {
            id,
            len,
            endianness,
        } = client.call(&request)?
        else {
            return Err(unexpected());
        };

        Ok(RemotePoster {
            host: client.host().to_owned(),
            id,
            owner: None,
            endianness,
            cache: vec![0; len as usize],
        })
    }

    /// The server this poster lives on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The server-issued id of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Size of the cache, the poster size as of the last exchange with the server.
    pub fn size(&self) -> usize {
        self.cache.len()
    }

    /// Ask the server for the current size, updating the cache.
    pub(crate) fn refresh_size(&mut self, client: &mut RpcClient) -> Result<usize> {
        match self.ioctl(client, IoctlCmd::GetSize)? {
            IoctlReply::Size(size) => {
                self.cache.resize(size as usize, 0);
                Ok(self.cache.len())
            }
            _ => Err(unexpected()),
        }
    }

    /// Pull the poster content into the cache.
    ///
    /// A poster that was never written has no content to pull. Taking it for writing still
    /// succeeds with a zeroed cache, any other take fails with [`Error::ClosedOrEmpty`].
    pub fn take<'a>(&'a mut self, client: &'a mut RpcClient, op: Op) -> Result<RemoteGuard<'a>> {
        let request = Request::Read {
            id: self.id,
            offset: 0,
            len: None,
        };

        match client.call(&request) {
            Ok(Reply::Data { data }) => self.cache = data,
            Ok(_) => return Err(unexpected()),
            Err(Error::ClosedOrEmpty) if op == Op::Write => {
                // Nothing to pull, but the poster may have been resized since we last looked.
                let size = self.refresh_size(client)?;
                self.cache.clear();
                self.cache.resize(size, 0);
            }
            Err(err) => return Err(err),
        }

        Ok(RemoteGuard {
            poster: self,
            client,
            op,
            given: false,
        })
    }

    pub fn read(&mut self, client: &mut RpcClient, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let request = Request::Read {
            id: self.id,
            offset: offset as u64,
            len: Some(buf.len() as u64),
        };

        let Reply::Data { data } = client.call(&request)? else {
            return Err(unexpected());
        };

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    pub fn write(&mut self, client: &mut RpcClient, offset: usize, data: &[u8]) -> Result<usize> {
        let request = Request::Write {
            id: self.id,
            offset: offset as u64,
            data: data.to_vec(),
        };

        let Reply::Written { len } = client.call(&request)? else {
            return Err(unexpected());
        };

        let len = len as usize;
        if let Some(cached) = self.cache.get_mut(offset..) {
            let keep = len.min(cached.len()).min(data.len());
            cached[..keep].copy_from_slice(&data[..keep]);
        }

        Ok(len)
    }

    pub fn ioctl(&mut self, client: &mut RpcClient, cmd: IoctlCmd) -> Result<IoctlReply> {
        if let IoctlCmd::Resize(size) = cmd {
            self.resize(client, size as usize)?;
            return Ok(IoctlReply::Resized);
        }

        let request = Request::Ioctl {
            id: self.id,
            cmd: cmd.code(),
        };

        match client.call(&request)? {
            Reply::Ioctl(reply) => Ok(reply),
            _ => Err(unexpected()),
        }
    }

    /// Resize on the server, then the cache.
    ///
    /// Only the creating process may resize, which is checked here before asking the server.
    pub fn resize(&mut self, client: &mut RpcClient, size: usize) -> Result<()> {
        if self.owner != Some(std::process::id()) {
            return Err(Error::NotOwner);
        }

        let request = Request::Resize {
            id: self.id,
            size: size as u64,
        };

        let Reply::Resized = client.call(&request)? else {
            return Err(unexpected());
        };

        self.cache.resize(size, 0);
        Ok(())
    }

    pub fn delete(&mut self, client: &mut RpcClient) -> Result<()> {
        let Reply::Deleted = client.call(&Request::Delete { id: self.id })? else {
            return Err(unexpected());
        };

        tracing::debug!(host = %self.host, id = self.id, "deleted remote poster");
        self.cache.clear();
        Ok(())
    }
}

impl RemoteGuard<'_> {
    pub fn op(&self) -> Op {
        self.op
    }

    pub fn data(&self) -> &[u8] {
        &self.poster.cache
    }

    /// The cache for writing. Fails unless the poster was taken for [`Op::Write`].
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        if self.op != Op::Write {
            return Err(Error::BadOperation("poster was not taken for writing"));
        }

        Ok(&mut self.poster.cache)
    }

    /// End the access, pushing the cache to the server after a write access.
    pub fn give(mut self) -> Result<()> {
        self.given = true;
        self.push()
    }

    fn push(&mut self) -> Result<()> {
        if self.op != Op::Write {
            return Ok(());
        }

        let request = Request::Write {
            id: self.poster.id,
            offset: 0,
            data: self.poster.cache.clone(),
        };

        match self.client.call(&request)? {
            Reply::Written { .. } => Ok(()),
            _ => Err(unexpected()),
        }
    }
}

impl Drop for RemoteGuard<'_> {
    fn drop(&mut self) {
        if self.given {
            return;
        }

        if let Err(err) = self.push() {
            tracing::warn!(
                host = %self.poster.host,
                id = self.poster.id,
                error = %err,
                "could not give back remote poster"
            );
        }
    }
}
