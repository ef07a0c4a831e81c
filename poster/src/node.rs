//! A poster node: the arena, the directory and the lock protecting both.
use std::sync::Arc;
use std::time::Duration;

use memfile::MemFile;
use poster_arena::{Arena, ArenaStats, Region};
use poster_fd::SharedFd;

use crate::directory::{Directory, MAX_NAME};
use crate::lock::{LockGuard, TicketLock, LOCK_SIZE};
use crate::op::{Endianness, Wait};
use crate::{Error, LocalPoster, Result};

const NODE_MAGIC: u64 = 0x7265_7473_6f70_0001;

const N_MAGIC: u64 = 0;
const N_CAPACITY: u64 = 8;
const N_TABLE: u64 = 16;
const N_LOCK: u64 = 64;
const NODE_HEADER: u64 = N_LOCK + LOCK_SIZE;

/// Sizing of a newly formatted node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// Bytes of the segment, the arena and directory included.
    pub arena_size: usize,
    /// Number of posters that may exist at the same time.
    pub max_posters: u32,
    /// Wait for the node lock guarding creation, lookup and allocation.
    pub lock_wait: Wait,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            arena_size: 1 << 20,
            max_posters: 64,
            lock_wait: Wait::Timeout(Duration::from_secs(5)),
        }
    }
}

/// Statistics of a node, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStats {
    pub posters: usize,
    pub max_posters: u32,
    pub arena: ArenaStats,
}

/// The poster store of one host.
///
/// All processes attached to the same segment share one node. Handles created from it keep it
/// alive through an [`Arc`].
pub struct Node {
    region: Region,
    header: u64,
    table: u64,
    capacity: u32,
    wait: Wait,
    /// The segment we were handed, kept open for our own children.
    #[allow(dead_code)]
    segment: Option<MemFile>,
}

impl Node {
    /// A node private to this process.
    pub fn anonymous(config: &NodeConfig) -> Result<Arc<Node>> {
        let region = Region::anonymous(config.arena_size).map_err(Error::Segment)?;
        Self::format(region, config)
    }

    /// Format `region` as an empty node.
    pub fn format(region: Region, config: &NodeConfig) -> Result<Arc<Node>> {
        Self::format_in(region, config).map(Arc::new)
    }

    fn format_in(region: Region, config: &NodeConfig) -> Result<Node> {
        if config.max_posters == 0 {
            return Err(Error::ConfigurationMissing("node without room for posters"));
        }

        let (header, table) = {
            let arena = Arena::format(&region)?;
            let header = arena.malloc(NODE_HEADER)?;
            let table = arena.malloc(Directory::table_size(config.max_posters))?;

            region.fill(header, NODE_HEADER, 0);
            TicketLock::new(&region, header + N_LOCK).init();
            Directory::new(&region, table, config.max_posters).init();
            region.store_u32(header + N_CAPACITY, config.max_posters);
            region.store_u64(header + N_TABLE, table);
            region
                .atomic_u64(header + N_MAGIC)
                .store(NODE_MAGIC, core::sync::atomic::Ordering::Release);
            arena.set_root(header);
            (header, table)
        };

        tracing::debug!(
            len = region.len(),
            max_posters = config.max_posters,
            shared = region.is_shared(),
            "formatted poster node"
        );

        Ok(Node {
            region,
            header,
            table,
            capacity: config.max_posters,
            wait: config.lock_wait,
            segment: None,
        })
    }

    /// Attach to a node some process formatted in `region` before.
    pub fn attach(region: Region, config: &NodeConfig) -> Result<Arc<Node>> {
        Self::attach_in(region, config).map(Arc::new)
    }

    fn attach_in(region: Region, config: &NodeConfig) -> Result<Node> {
        let header = Arena::attach(&region)?
            .root()
            .ok_or(Error::ConfigurationMissing("segment holds no poster node"))?;

        if !region.contains(header, NODE_HEADER)
            || region
                .atomic_u64(header + N_MAGIC)
                .load(core::sync::atomic::Ordering::Acquire)
                != NODE_MAGIC
        {
            return Err(Error::ConfigurationMissing("segment holds no poster node"));
        }

        let capacity = region.load_u32(header + N_CAPACITY);
        let table = region.load_u64(header + N_TABLE);
        if capacity == 0 || !region.contains(table, Directory::table_size(capacity)) {
            return Err(Error::ProtocolCorruption("poster directory out of bounds"));
        }

        tracing::debug!(len = region.len(), capacity, "attached poster node");
        Ok(Node {
            region,
            header,
            table,
            capacity,
            wait: config.lock_wait,
            segment: None,
        })
    }

    /// Attach to the node in `region`, formatting it first if it holds none.
    ///
    /// The check is not atomic. When several processes share a segment, exactly one of them
    /// should format it before handing it out, see the `poster-host` binary.
    pub fn open(region: Region, config: &NodeConfig) -> Result<Arc<Node>> {
        Self::open_in(region, config).map(Arc::new)
    }

    fn open_in(region: Region, config: &NodeConfig) -> Result<Node> {
        if Arena::is_formatted(&region) {
            Self::attach_in(region, config)
        } else {
            Self::format_in(region, config)
        }
    }

    /// Attach to the segment handed to us in `LISTEN_FDS`, if any.
    pub fn from_env(config: &NodeConfig) -> Result<Option<Arc<Node>>> {
        // Safety: the descriptor named by the environment is owned by nothing else in this
        // process, we are the one to import it.
        let Some(fd) = (unsafe { SharedFd::from_env() }) else {
            return Ok(None);
        };

        let file = fd.into_file().map_err(Error::Segment)?;
        let region = Region::from_fd(&file).map_err(Error::Segment)?;
        let mut node = Self::open_in(region, config)?;
        node.segment = Some(file);
        Ok(Some(Arc::new(node)))
    }

    /// Create a poster of `size` zeroed bytes, owned by this process.
    pub fn create(self: &Arc<Self>, name: &str, size: usize) -> Result<LocalPoster> {
        self.create_as(name, size, Endianness::native())
    }

    /// Create a poster on behalf of a creator with byte order `order`.
    pub(crate) fn create_as(
        self: &Arc<Self>,
        name: &str,
        size: usize,
        order: Endianness,
    ) -> Result<LocalPoster> {
        if size == 0 {
            return Err(Error::BadOperation("posters can not be empty"));
        }

        if name.is_empty() || name.len() > MAX_NAME {
            return Err(Error::BadOperation("poster name length"));
        }

        let _guard = self.lock()?;
        let directory = self.directory();
        if directory.find(name).is_some() {
            return Err(Error::DuplicateName);
        }

        let slot = directory.claim().ok_or(Error::AllocationFailure)?;
        let arena = self.arena()?;
        let size = size as u64;
        let data = arena.malloc(size)?;
        self.region.fill(data, size, 0);

        let record = directory.record(slot);
        record.open(name, data, size, std::process::id(), order);
        tracing::debug!(name, size, slot, "created poster");

        Ok(LocalPoster::new(self.clone(), slot, record.generation()))
    }

    /// Look up a poster by name.
    pub fn find(self: &Arc<Self>, name: &str) -> Result<LocalPoster> {
        let _guard = self.lock()?;
        let directory = self.directory();
        let slot = directory.find(name).ok_or(Error::NotFound)?;
        let generation = directory.record(slot).generation();
        Ok(LocalPoster::new(self.clone(), slot, generation))
    }

    pub fn stats(&self) -> Result<NodeStats> {
        let _guard = self.lock()?;
        Ok(NodeStats {
            posters: self.directory().live(),
            max_posters: self.capacity,
            arena: self.arena()?.stats()?,
        })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub(crate) fn lock(&self) -> Result<LockGuard<'_>> {
        TicketLock::new(&self.region, self.header + N_LOCK).acquire(self.wait)
    }

    pub(crate) fn directory(&self) -> Directory<'_> {
        Directory::new(&self.region, self.table, self.capacity)
    }

    pub(crate) fn arena(&self) -> Result<Arena<'_>> {
        Ok(Arena::attach(&self.region)?)
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("len", &self.region.len())
            .field("shared", &self.region.is_shared())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Arc<Node> {
        let config = NodeConfig {
            arena_size: 64 << 10,
            max_posters: 4,
            ..NodeConfig::default()
        };
        Node::anonymous(&config).unwrap()
    }

    #[test]
    fn create_and_find() {
        let node = node();
        let created = node.create("speed", 8).unwrap();
        let found = node.find("speed").unwrap();
        assert_eq!(created.size(), 8);
        assert_eq!(found.size(), 8);
        assert_eq!(found.name().unwrap(), "speed");
        assert!(matches!(node.find("sped"), Err(Error::NotFound)));
    }

    #[test]
    fn rejects_bad_creations() {
        let node = node();
        node.create("speed", 8).unwrap();
        assert!(matches!(node.create("speed", 8), Err(Error::DuplicateName)));
        assert!(matches!(node.create("empty", 0), Err(Error::BadOperation(_))));
        assert!(matches!(node.create("", 4), Err(Error::BadOperation(_))));
        let long = "x".repeat(MAX_NAME + 1);
        assert!(matches!(node.create(&long, 4), Err(Error::BadOperation(_))));
        let exact = "x".repeat(MAX_NAME);
        assert!(node.create(&exact, 4).is_ok());
    }

    #[test]
    fn directory_and_arena_limits() {
        let node = node();
        for idx in 0..4 {
            node.create(&format!("p{idx}"), 16).unwrap();
        }
        assert!(matches!(node.create("p4", 16), Err(Error::AllocationFailure)));

        let node = self::node();
        assert!(matches!(
            node.create("huge", 1 << 20),
            Err(Error::AllocationFailure)
        ));
        assert_eq!(node.stats().unwrap().posters, 0);
    }

    #[test]
    fn reattach_sees_posters() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(64 << 10).unwrap();
        let config = NodeConfig::default();

        let first = Node::open(Region::from_fd(&file).unwrap(), &config).unwrap();
        first.create("shared", 32).unwrap();

        let second = Node::open(Region::from_fd(&file).unwrap(), &config).unwrap();
        let found = second.find("shared").unwrap();
        assert_eq!(found.size(), 32);
        assert_eq!(second.stats().unwrap().posters, 1);
    }
}
