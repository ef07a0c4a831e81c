//! Routes poster operations to the local node or to a remote server.
use std::collections::hash_map::{Entry, HashMap};
use std::sync::Arc;

use crate::client::RpcClient;
use crate::local::{LocalGuard, LocalPoster};
use crate::op::{Endianness, Op};
use crate::remote::{RemoteGuard, RemotePoster};
use crate::{Config, Error, IoctlCmd, IoctlReply, Node, NodeConfig, Result};

/// A poster handle of either backend.
#[derive(Clone, Debug)]
pub enum Poster {
    Local(LocalPoster),
    Remote(RemotePoster),
}

/// A taken poster of either backend, see [`Context::take`].
pub enum Taken<'a> {
    Local(LocalGuard<'a>),
    Remote(RemoteGuard<'a>),
}

/// The poster state of one process.
///
/// Holds the configuration, the local node if this process is attached to one, the registry of
/// names already found, and one connection per remote host in use.
pub struct Context {
    config: Config,
    node: Option<Arc<Node>>,
    registry: HashMap<String, Poster>,
    clients: HashMap<String, RpcClient>,
}

impl Context {
    pub fn new(config: Config, node: Option<Arc<Node>>) -> Self {
        Context {
            config,
            node,
            registry: HashMap::new(),
            clients: HashMap::new(),
        }
    }

    /// Configure from the environment, attaching to a handed-down segment if there is one.
    pub fn from_env() -> Result<Self> {
        let config = Config::from_env()?;
        let node = Node::from_env(&NodeConfig::default())?;
        Ok(Self::new(config, node))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }

    /// The connection to `host`, replacing it if a previous call broke it.
    fn client(&mut self, host: &str) -> Result<&mut RpcClient> {
        let timeout = self.config.wait.duration();

        if self.clients.get(host).map_or(false, RpcClient::is_broken) {
            tracing::debug!(host, "reconnecting to poster server");
            self.clients.remove(host);
        }

        match self.clients.entry(host.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(RpcClient::connect(host, timeout)?)),
        }
    }

    /// Create a poster of `size` zeroed bytes.
    ///
    /// With `POSTER_HOST` set it is created on that host, otherwise in the local node.
    pub fn create(&mut self, name: &str, size: usize) -> Result<Poster> {
        let poster = if let Some(host) = self.config.remote_host.clone() {
            let client = self.client(&host)?;
            Poster::Remote(RemotePoster::create(client, name, size)?)
        } else if let Some(node) = &self.node {
            Poster::Local(node.create(name, size)?)
        } else {
            return Err(Error::ConfigurationMissing(
                "neither a local node nor POSTER_HOST",
            ));
        };

        self.registry.insert(name.to_owned(), poster.clone());
        Ok(poster)
    }

    /// Find a poster by name.
    ///
    /// Names found before are answered from the registry, unless the poster has since
    /// disappeared. Otherwise `POSTER_HOST` if set, or else the local node and then every host
    /// of `POSTER_PATH` in order.
    pub fn find(&mut self, name: &str) -> Result<Poster> {
        if let Some(mut cached) = self.registry.get(name).cloned() {
            if self.size(&mut cached) > 0 {
                self.registry.insert(name.to_owned(), cached.clone());
                return Ok(cached);
            }

            tracing::debug!(name, "dropping stale registry entry");
            self.registry.remove(name);
        }

        let poster = self.lookup(name)?;
        self.registry.insert(name.to_owned(), poster.clone());
        Ok(poster)
    }

    fn lookup(&mut self, name: &str) -> Result<Poster> {
        if let Some(host) = self.config.remote_host.clone() {
            let client = self.client(&host)?;
            return Ok(Poster::Remote(RemotePoster::find(client, name)?));
        }

        match &self.node {
            Some(node) => match node.find(name) {
                Ok(poster) => return Ok(Poster::Local(poster)),
                Err(Error::NotFound) => {}
                Err(err) => return Err(err),
            },
            None if self.config.search_path.is_empty() => {
                return Err(Error::ConfigurationMissing(
                    "neither a local node, POSTER_HOST nor POSTER_PATH",
                ))
            }
            None => {}
        }

        for host in self.config.search_path.clone() {
            match self
                .client(&host)
                .and_then(|client| RemotePoster::find(client, name))
            {
                Ok(poster) => return Ok(Poster::Remote(poster)),
                Err(err) => tracing::debug!(host, name, error = %err, "poster not on search host"),
            }
        }

        Err(Error::NotFound)
    }

    /// The current size of a poster, `0` if it no longer exists or can not be reached.
    pub fn size(&mut self, poster: &mut Poster) -> usize {
        match poster {
            Poster::Local(poster) => poster.size(),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                match self
                    .client(&host)
                    .and_then(|client| poster.refresh_size(client))
                {
                    Ok(size) => size,
                    Err(err) => {
                        tracing::debug!(host, error = %err, "remote poster size unavailable");
                        0
                    }
                }
            }
        }
    }

    /// Acquire exclusive access to a poster for `op`.
    ///
    /// Local posters wait in line behind earlier takers for at most the configured wait. Remote
    /// posters are pulled into their cache, see [`RemotePoster::take`].
    pub fn take<'a>(&'a mut self, poster: &'a mut Poster, op: Op) -> Result<Taken<'a>> {
        match poster {
            Poster::Local(poster) => Ok(Taken::Local(poster.take(op, self.config.wait)?)),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                let client = self.client(&host)?;
                Ok(Taken::Remote(poster.take(client, op)?))
            }
        }
    }

    pub fn read(&mut self, poster: &mut Poster, offset: usize, buf: &mut [u8]) -> Result<usize> {
        match poster {
            Poster::Local(poster) => poster.read(offset, buf, self.config.wait),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                poster.read(self.client(&host)?, offset, buf)
            }
        }
    }

    pub fn write(&mut self, poster: &mut Poster, offset: usize, data: &[u8]) -> Result<usize> {
        match poster {
            Poster::Local(poster) => poster.write(offset, data, self.config.wait),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                poster.write(self.client(&host)?, offset, data)
            }
        }
    }

    pub fn ioctl(&mut self, poster: &mut Poster, cmd: IoctlCmd) -> Result<IoctlReply> {
        match poster {
            Poster::Local(poster) => poster.ioctl(cmd, self.config.wait),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                poster.ioctl(self.client(&host)?, cmd)
            }
        }
    }

    pub fn resize(&mut self, poster: &mut Poster, size: usize) -> Result<()> {
        match poster {
            Poster::Local(poster) => poster.resize(size, self.config.wait),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                poster.resize(self.client(&host)?, size)
            }
        }
    }

    /// Delete a poster.
    ///
    /// Other handles to it, in this process or others, are not told. Their next operation fails.
    pub fn delete(&mut self, poster: &mut Poster) -> Result<()> {
        match poster {
            Poster::Local(poster) => poster.delete(self.config.wait),
            Poster::Remote(poster) => {
                let host = poster.host().to_owned();
                poster.delete(self.client(&host)?)
            }
        }
    }
}

impl Poster {
    pub fn is_local(&self) -> bool {
        matches!(self, Poster::Local(_))
    }

    pub fn endianness(&self) -> Endianness {
        match self {
            Poster::Local(poster) => poster.endianness(),
            Poster::Remote(poster) => poster.endianness(),
        }
    }
}

impl Taken<'_> {
    pub fn op(&self) -> Op {
        match self {
            Taken::Local(guard) => guard.op(),
            Taken::Remote(guard) => guard.op(),
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            Taken::Local(guard) => guard.data(),
            Taken::Remote(guard) => guard.data(),
        }
    }

    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Taken::Local(guard) => guard.data_mut(),
            Taken::Remote(guard) => guard.data_mut(),
        }
    }

    /// End the access. Only a remote write access can fail here, pushing its content.
    pub fn give(self) -> Result<()> {
        match self {
            Taken::Local(guard) => {
                guard.give();
                Ok(())
            }
            Taken::Remote(guard) => guard.give(),
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("node", &self.node)
            .field("registered", &self.registry.len())
            .field("clients", &self.clients.len())
            .finish()
    }
}
