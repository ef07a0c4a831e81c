//! A blocking connection to one poster server.
use std::io::{BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::with_port;
use crate::wire::{self, Reply, Request};
use crate::{Error, Result};

/// Calls into one remote poster server, one request at a time.
///
/// After a transport failure or a timeout the stream may be out of step with the server, the
/// client then reports itself [broken](RpcClient::is_broken) and must be replaced.
pub struct RpcClient {
    host: String,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    broken: bool,
}

impl RpcClient {
    /// Connect to `host`, on the default port unless it names one.
    ///
    /// The timeout bounds the connection attempt and every later reply.
    pub fn connect(host: &str, timeout: Option<Duration>) -> Result<Self> {
        let address = with_port(host);
        let mut last = None;

        for addr in address.to_socket_addrs().map_err(Error::TransportFailure)? {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };

            match attempt {
                Ok(stream) => return Self::from_stream(host, stream, timeout),
                Err(err) => last = Some(err),
            }
        }

        Err(Error::TransportFailure(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "host has no address")
        })))
    }

    fn from_stream(host: &str, stream: TcpStream, timeout: Option<Duration>) -> Result<Self> {
        stream.set_nodelay(true).map_err(Error::TransportFailure)?;
        stream
            .set_read_timeout(timeout)
            .map_err(Error::TransportFailure)?;
        stream
            .set_write_timeout(timeout)
            .map_err(Error::TransportFailure)?;
        let reader = stream.try_clone().map_err(Error::TransportFailure)?;

        tracing::debug!(host, "connected to poster server");
        Ok(RpcClient {
            host: host.to_owned(),
            reader: BufReader::new(reader),
            writer: BufWriter::new(stream),
            broken: false,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Send `request` and wait for its reply.
    ///
    /// Errors reported by the server are returned as they are, the connection stays usable.
    pub fn call(&mut self, request: &Request) -> Result<Reply> {
        if self.broken {
            return Err(Error::TransportFailure(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection was abandoned",
            )));
        }

        match self.exchange(request) {
            Ok(body) => wire::decode_response(request, &body),
            Err(err) => {
                tracing::warn!(host = %self.host, error = %err, "poster server call failed");
                self.broken = true;
                Err(err)
            }
        }
    }

    fn exchange(&mut self, request: &Request) -> Result<Vec<u8>> {
        wire::write_frame(&mut self.writer, &request.encode()).map_err(Error::transport)?;
        wire::read_frame(&mut self.reader)?.ok_or_else(|| {
            Error::TransportFailure(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))
        })
    }
}

impl core::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcClient")
            .field("host", &self.host)
            .field("broken", &self.broken)
            .finish()
    }
}
