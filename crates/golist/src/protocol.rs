//! Wire protocol between the golist client and daemon.
//!
//! One request and one response per connection, each a single frame:
//! - 1 byte: route (request) or status (response)
//! - 4 bytes: big-endian body length
//! - N bytes: body

use golist_types::Query;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum body size (64 MiB)
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown route byte {0:#04x}")]
    UnknownRoute(u8),

    #[error("Unknown status byte {0:#04x}")]
    UnknownStatus(u8),

    #[error("Body of {len} bytes exceeds the 64 MiB limit")]
    TooLarge { len: u64 },

    #[error("Malformed request body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the peer sent something we can answer with a rejection
    pub fn is_rejectable(&self) -> bool {
        !matches!(self, ProtocolError::Io(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Route {
    Compute = 1,
    Exit = 2,
}

impl TryFrom<u8> for Route {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            1 => Ok(Route::Compute),
            2 => Ok(Route::Exit),
            other => Err(ProtocolError::UnknownRoute(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Body is the result bytes
    Ok = 0,
    /// Body is a UTF-8 error message from the computation
    Error = 1,
    /// The request itself was malformed; retrying won't help
    Rejected = 2,
}

impl TryFrom<u8> for Status {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Error),
            2 => Ok(Status::Rejected),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub route: Route,
    pub body: Vec<u8>,
}

impl Request {
    pub fn compute(query: &Query) -> Result<Self, ProtocolError> {
        Ok(Self {
            route: Route::Compute,
            body: serde_json::to_vec(query)?,
        })
    }

    pub fn exit() -> Self {
        Self {
            route: Route::Exit,
            body: Vec::new(),
        }
    }

    /// Decode the body of a compute request
    pub fn query(&self) -> Result<Query, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        write_frame(writer, self.route as u8, &self.body).await
    }

    /// Read a request. The whole frame is consumed even when the route byte
    /// is unknown, so the caller can still answer.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let (tag, body) = read_frame(reader).await?;
        Ok(Self {
            route: Route::try_from(tag)?,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            body,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            body: message.into().into_bytes(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: Status::Rejected,
            body: message.into().into_bytes(),
        }
    }

    /// Body as text, for error and rejection responses
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        write_frame(writer, self.status as u8, &self.body).await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let (tag, body) = read_frame(reader).await?;
        Ok(Self {
            status: Status::try_from(tag)?,
            body,
        })
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: u8,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_BODY_SIZE)
        .ok_or(ProtocolError::TooLarge {
            len: body.len() as u64,
        })?;

    let mut header = [0u8; 5];
    header[0] = tag;
    header[1..].copy_from_slice(&len.to_be_bytes());

    writer.write_all(&header).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_BODY_SIZE {
        return Err(ProtocolError::TooLarge { len: len.into() });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok((header[0], body))
}
