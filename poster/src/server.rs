//! Exports the posters of a local node to remote proxies.
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ids::IdTable;
use crate::op::{Op, Wait};
use crate::wire::{self, Reply, Request};
use crate::{Error, IoctlCmd, LocalPoster, Node, Result};

/// Time allowed for the probe of an already running server.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// A poster server bound to its listening socket.
pub struct PosterServer {
    listener: TcpListener,
    service: Service,
}

/// The request handler, shared by all connections.
#[derive(Clone)]
struct Service {
    node: Arc<Node>,
    ids: Arc<Mutex<IdTable<LocalPoster>>>,
    wait: Wait,
}

impl PosterServer {
    /// Bind to `addr`, refusing if another server already answers there.
    pub fn bind(node: Arc<Node>, addr: impl ToSocketAddrs, wait: Wait) -> Result<Self> {
        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(Error::TransportFailure)?
            .collect();

        for addr in addrs.iter().filter(|addr| addr.port() != 0) {
            if TcpStream::connect_timeout(addr, PROBE_TIMEOUT).is_ok() {
                return Err(Error::AlreadyRunning(addr.to_string()));
            }
        }

        let listener = TcpListener::bind(&addrs[..]).map_err(Error::TransportFailure)?;
        tracing::info!(addr = ?listener.local_addr().ok(), "poster server listening");

        Ok(PosterServer {
            listener,
            service: Service {
                node,
                ids: Arc::new(Mutex::new(IdTable::new())),
                wait,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::TransportFailure)
    }

    /// Accept connections forever, each served on its own thread.
    pub fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let service = self.service.clone();
            thread::Builder::new()
                .name(format!("poster-conn-{peer}"))
                .spawn(move || service.connection(stream, peer))
                .map_err(Error::TransportFailure)?;
        }
    }

    /// Serve on a background thread.
    pub fn spawn(self) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || self.serve())
    }
}

impl Service {
    fn connection(self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(%peer, "client connected");
        let _ = stream.set_nodelay(true);

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "could not split connection");
                return;
            }
        };

        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(stream);

        loop {
            let body = match wire::read_frame(&mut reader) {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%peer, error = %err, "dropping connection");
                    break;
                }
            };

            let response = Request::decode(&body).and_then(|request| self.handle(request));
            if let Err(err) = &response {
                tracing::warn!(%peer, error = %err, "request failed");
            }

            if let Err(err) = wire::write_frame(&mut writer, &wire::encode_response(&response)) {
                tracing::warn!(%peer, error = %err, "could not reply");
                break;
            }
        }

        tracing::debug!(%peer, "client disconnected");
    }

    fn poster(&self, id: u64) -> Result<LocalPoster> {
        self.ids
            .lock()
            .get(id)
            .cloned()
            .ok_or(Error::ProtocolCorruption("unknown poster id"))
    }

    fn handle(&self, request: Request) -> Result<Reply> {
        match request {
            Request::Find { name } => {
                let poster = self.node.find(&name)?;
                let len = poster.size() as u64;
                let endianness = poster.endianness();
                let id = self.ids.lock().insert(poster);
                Ok(Reply::Found {
                    id,
                    len,
                    endianness,
                })
            }
            Request::Create {
                name,
                len,
                endianness,
            } => {
                let len = usize::try_from(len)
                    .map_err(|_| Error::BadOperation("poster size out of range"))?;
                let poster = self.node.create_as(&name, len, endianness)?;
                let id = self.ids.lock().insert(poster);
                Ok(Reply::Created { id })
            }
            Request::Write { id, offset, data } => {
                let poster = self.poster(id)?;
                let len = poster.write(offset as usize, &data, self.wait)?;
                Ok(Reply::Written { len: len as u64 })
            }
            Request::Read { id, offset, len } => {
                let poster = self.poster(id)?;
                let guard = poster.take(Op::Read, self.wait)?;
                // Only a whole-poster read stands for a take.
                if len.is_none() && !guard.is_fresh() {
                    return Err(Error::ClosedOrEmpty);
                }

                let tail = guard
                    .data()
                    .get(offset as usize..)
                    .ok_or(Error::BadOperation("offset past the end of the poster"))?;
                let len = len.map_or(tail.len(), |len| tail.len().min(len as usize));
                Ok(Reply::Data {
                    data: tail[..len].to_vec(),
                })
            }
            Request::Delete { id } => {
                self.poster(id)?.delete(self.wait)?;
                self.ids.lock().remove(id);
                Ok(Reply::Deleted)
            }
            Request::Ioctl { id, cmd } => {
                let cmd = IoctlCmd::from_code(cmd)?;
                Ok(Reply::Ioctl(self.poster(id)?.ioctl(cmd, self.wait)?))
            }
            Request::Resize { id, size } => {
                let size = usize::try_from(size)
                    .map_err(|_| Error::BadOperation("poster size out of range"))?;
                self.poster(id)?.resize(size, self.wait)?;
                Ok(Reply::Resized)
            }
        }
    }
}
