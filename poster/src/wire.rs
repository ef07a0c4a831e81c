//! The request/response codec between a remote proxy and a poster server.
//!
//! Every message is a frame: a `u32` length followed by that many bytes of body. All scalars are
//! in network byte order, poster payloads are opaque bytes copied as is. A request body starts
//! with its procedure code, a response body with a status, `0` meaning success.
use std::io::{self, Read, Write};

use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};

use crate::op::Endianness;
use crate::{Error, IoctlCmd, IoctlReply, PosterDate, Result};

/// Largest accepted frame body.
pub const MAX_FRAME: u32 = 64 << 20;

const PROC_FIND: u32 = 1;
const PROC_CREATE: u32 = 2;
const PROC_WRITE: u32 = 3;
const PROC_READ: u32 = 4;
const PROC_DELETE: u32 = 5;
const PROC_IOCTL: u32 = 6;
const PROC_RESIZE: u32 = 7;

const STATUS_OK: u32 = 0;

/// Length sent in a read request for "up to the end of the poster".
const READ_TO_END: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Find { name: String },
    Create { name: String, len: u64, endianness: Endianness },
    Write { id: u64, offset: u64, data: Vec<u8> },
    /// Read `len` bytes at `offset`, `None` reads to the end.
    Read { id: u64, offset: u64, len: Option<u64> },
    Delete { id: u64 },
    /// An argument-less control command, by its code.
    Ioctl { id: u64, cmd: u32 },
    Resize { id: u64, size: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Found { id: u64, len: u64, endianness: Endianness },
    Created { id: u64 },
    Written { len: u64 },
    Data { data: Vec<u8> },
    Deleted,
    Ioctl(IoctlReply),
    Resized,
}

fn truncated(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Error::ProtocolCorruption("truncated message"),
        _ => Error::ProtocolCorruption("unreadable message"),
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    // Writing into a vector does not fail.
    let _ = buf.write_u32::<NetworkEndian>(bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn read_bytes(rd: &mut &[u8]) -> Result<Vec<u8>> {
    let len = rd.read_u32::<NetworkEndian>().map_err(truncated)? as usize;
    if len > rd.len() {
        return Err(Error::ProtocolCorruption("byte string longer than message"));
    }

    let bytes = *rd;
    let (head, tail) = bytes.split_at(len);
    *rd = tail;
    Ok(head.to_vec())
}

fn read_name(rd: &mut &[u8]) -> Result<String> {
    String::from_utf8(read_bytes(rd)?)
        .map_err(|_| Error::ProtocolCorruption("poster name is not utf-8"))
}

fn read_endianness(rd: &mut &[u8]) -> Result<Endianness> {
    let code = rd.read_u32::<NetworkEndian>().map_err(truncated)?;
    Endianness::from_code(code).ok_or(Error::ProtocolCorruption("unknown byte order"))
}

fn finish(rd: &[u8]) -> Result<()> {
    if rd.is_empty() {
        Ok(())
    } else {
        Err(Error::ProtocolCorruption("trailing bytes in message"))
    }
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writing into a vector does not fail.
        let _ = self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Request::Find { name } => {
                buf.write_u32::<NetworkEndian>(PROC_FIND)?;
                write_bytes(buf, name.as_bytes());
            }
            Request::Create {
                name,
                len,
                endianness,
            } => {
                buf.write_u32::<NetworkEndian>(PROC_CREATE)?;
                write_bytes(buf, name.as_bytes());
                buf.write_u64::<NetworkEndian>(*len)?;
                buf.write_u32::<NetworkEndian>(endianness.code())?;
            }
            Request::Write { id, offset, data } => {
                buf.write_u32::<NetworkEndian>(PROC_WRITE)?;
                buf.write_u64::<NetworkEndian>(*id)?;
                buf.write_u64::<NetworkEndian>(*offset)?;
                write_bytes(buf, data);
            }
            Request::Read { id, offset, len } => {
                buf.write_u32::<NetworkEndian>(PROC_READ)?;
                buf.write_u64::<NetworkEndian>(*id)?;
                buf.write_u64::<NetworkEndian>(*offset)?;
                let len = len.map_or(READ_TO_END, |len| len.min(i64::MAX as u64) as i64);
                buf.write_i64::<NetworkEndian>(len)?;
            }
            Request::Delete { id } => {
                buf.write_u32::<NetworkEndian>(PROC_DELETE)?;
                buf.write_u64::<NetworkEndian>(*id)?;
            }
            Request::Ioctl { id, cmd } => {
                buf.write_u32::<NetworkEndian>(PROC_IOCTL)?;
                buf.write_u64::<NetworkEndian>(*id)?;
                buf.write_u32::<NetworkEndian>(*cmd)?;
            }
            Request::Resize { id, size } => {
                buf.write_u32::<NetworkEndian>(PROC_RESIZE)?;
                buf.write_u64::<NetworkEndian>(*id)?;
                buf.write_u64::<NetworkEndian>(*size)?;
            }
        }

        Ok(())
    }

    pub fn decode(mut rd: &[u8]) -> Result<Self> {
        let rd = &mut rd;
        let proc = rd.read_u32::<NetworkEndian>().map_err(truncated)?;

        let request = match proc {
            PROC_FIND => Request::Find {
                name: read_name(rd)?,
            },
            PROC_CREATE => Request::Create {
                name: read_name(rd)?,
                len: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
                endianness: read_endianness(rd)?,
            },
            PROC_WRITE => Request::Write {
                id: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
                offset: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
                data: read_bytes(rd)?,
            },
            PROC_READ => {
                let id = rd.read_u64::<NetworkEndian>().map_err(truncated)?;
                let offset = rd.read_u64::<NetworkEndian>().map_err(truncated)?;
                let len = match rd.read_i64::<NetworkEndian>().map_err(truncated)? {
                    READ_TO_END => None,
                    len if len < 0 => {
                        return Err(Error::ProtocolCorruption("negative read length"))
                    }
                    len => Some(len as u64),
                };
                Request::Read { id, offset, len }
            }
            PROC_DELETE => Request::Delete {
                id: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
            },
            PROC_IOCTL => Request::Ioctl {
                id: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
                cmd: rd.read_u32::<NetworkEndian>().map_err(truncated)?,
            },
            PROC_RESIZE => Request::Resize {
                id: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
                size: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
            },
            _ => return Err(Error::ProtocolCorruption("unknown procedure")),
        };

        finish(rd)?;
        Ok(request)
    }
}

/// Encode the outcome of a request.
pub fn encode_response(response: &Result<Reply>) -> Vec<u8> {
    let mut buf = Vec::new();
    let reply = match response {
        Err(err) => {
            let _ = buf.write_u32::<NetworkEndian>(err.code());
            return buf;
        }
        Ok(reply) => reply,
    };

    let _ = buf.write_u32::<NetworkEndian>(STATUS_OK);
    let _ = match reply {
        Reply::Found {
            id,
            len,
            endianness,
        } => buf
            .write_u64::<NetworkEndian>(*id)
            .and_then(|_| buf.write_u64::<NetworkEndian>(*len))
            .and_then(|_| buf.write_u32::<NetworkEndian>(endianness.code())),
        Reply::Created { id } => buf.write_u64::<NetworkEndian>(*id),
        Reply::Written { len } => buf.write_u64::<NetworkEndian>(*len),
        Reply::Data { data } => {
            write_bytes(&mut buf, data);
            Ok(())
        }
        Reply::Deleted | Reply::Resized | Reply::Ioctl(IoctlReply::Resized) => Ok(()),
        Reply::Ioctl(IoctlReply::Date(date)) => buf
            .write_u64::<NetworkEndian>(date.secs)
            .and_then(|_| buf.write_u32::<NetworkEndian>(date.nanos)),
        Reply::Ioctl(IoctlReply::Fresh(fresh)) => buf.write_u32::<NetworkEndian>(u32::from(*fresh)),
        Reply::Ioctl(IoctlReply::Size(size)) => buf.write_u64::<NetworkEndian>(*size),
    };

    buf
}

/// Decode the response to `request`.
///
/// The reply layout depends on the request, a response can not be decoded on its own.
pub fn decode_response(request: &Request, mut rd: &[u8]) -> Result<Reply> {
    let rd = &mut rd;
    let status = rd.read_u32::<NetworkEndian>().map_err(truncated)?;
    if status != STATUS_OK {
        return Err(Error::from_code(status));
    }

    let reply = match request {
        Request::Find { .. } => Reply::Found {
            id: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
            len: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
            endianness: read_endianness(rd)?,
        },
        Request::Create { .. } => Reply::Created {
            id: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
        },
        Request::Write { .. } => Reply::Written {
            len: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
        },
        Request::Read { .. } => Reply::Data {
            data: read_bytes(rd)?,
        },
        Request::Delete { .. } => Reply::Deleted,
        Request::Resize { .. } => Reply::Resized,
        Request::Ioctl { cmd, .. } => Reply::Ioctl(match IoctlCmd::from_code(*cmd)? {
            IoctlCmd::GetDate => IoctlReply::Date(PosterDate {
                secs: rd.read_u64::<NetworkEndian>().map_err(truncated)?,
                nanos: rd.read_u32::<NetworkEndian>().map_err(truncated)?,
            }),
            IoctlCmd::Fresh => {
                IoctlReply::Fresh(rd.read_u32::<NetworkEndian>().map_err(truncated)? != 0)
            }
            IoctlCmd::GetSize => {
                IoctlReply::Size(rd.read_u64::<NetworkEndian>().map_err(truncated)?)
            }
            IoctlCmd::Resize(_) => IoctlReply::Resized,
        }),
    };

    finish(rd)?;
    Ok(reply)
}

/// Write one frame.
pub fn write_frame(wr: &mut impl Write, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    wr.write_u32::<NetworkEndian>(len)?;
    wr.write_all(body)?;
    wr.flush()
}

/// Read one frame, `None` if the peer closed the stream between frames.
pub fn read_frame(rd: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let len = match rd.read_u32::<NetworkEndian>() {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::transport(err)),
    };

    if len > MAX_FRAME {
        return Err(Error::ProtocolCorruption("frame too large"));
    }

    let mut body = vec![0; len as usize];
    rd.read_exact(&mut body).map_err(Error::transport)?;
    Ok(Some(body))
}
