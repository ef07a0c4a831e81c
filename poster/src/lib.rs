//! Named shared-memory posters.
//!
//! A poster is a named, fixed-size byte buffer that cooperating processes read and write under
//! mutual exclusion. Posters live in a node, an arena in a memory segment shared by all processes
//! of a host. Processes on other hosts reach them through a [`PosterServer`] exporting the node,
//! with the same operations on a [`Context`] regardless of where the poster lives.
//!
//! ```no_run
//! use poster::{Context, Op};
//!
//! let mut ctx = Context::from_env()?;
//! let mut speed = ctx.create("speed", 8)?;
//!
//! let mut taken = ctx.take(&mut speed, Op::Write)?;
//! taken.data_mut()?.copy_from_slice(&42u64.to_be_bytes());
//! taken.give()?;
//! # Ok::<_, poster::Error>(())
//! ```
//!
//! ## Configuration
//!
//! The segment is handed down by a host process as described in [`poster_fd`], see the
//! `poster-host` binary. The environment variables [`ENV_HOST`], [`ENV_PATH`] and
//! [`ENV_TIMEOUT`] select remote servers and the wait for contended posters.
mod client;
mod config;
mod context;
mod directory;
mod error;
mod ids;
mod ioctl;
mod local;
mod lock;
mod node;
mod op;
mod remote;
mod server;
pub mod wire;

pub use client::RpcClient;
pub use config::{Config, DEFAULT_PORT, ENV_HOST, ENV_PATH, ENV_TIMEOUT};
pub use context::{Context, Poster, Taken};
pub use directory::MAX_NAME;
pub use error::{Error, Result};
pub use ids::IdTable;
pub use ioctl::{IoctlCmd, IoctlReply, PosterDate, FIO_FRESH, FIO_GETDATE, FIO_GETSIZE, FIO_RESIZE};
pub use local::{LocalGuard, LocalPoster};
pub use node::{Node, NodeConfig, NodeStats};
pub use op::{Endianness, Op, Wait};
pub use remote::{RemoteGuard, RemotePoster};
pub use server::PosterServer;
