//! Async framed JSON transport over tokio sockets.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::uri::{Address, VarlinkUri};

const READ_CHUNK: usize = 8192;

/// Async stream for TCP and Unix domain sockets.
pub enum AsyncStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AsyncStream::Tcp(stream) => stream.read(buf).await,
            #[cfg(unix)]
            AsyncStream::Unix(stream) => stream.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            AsyncStream::Tcp(stream) => stream.write_all(buf).await,
            #[cfg(unix)]
            AsyncStream::Unix(stream) => stream.write_all(buf).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            AsyncStream::Tcp(stream) => stream.flush().await,
            #[cfg(unix)]
            AsyncStream::Unix(stream) => stream.flush().await,
        }
    }
}

/// The async counterpart of [`Connection`](crate::Connection): NUL-framed
/// JSON with a buffered, resumable read side.
pub struct Connection {
    stream: AsyncStream,
    buffer: Vec<u8>,
}

impl Connection {
    pub fn new(stream: AsyncStream) -> Connection {
        Connection {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Connect to `unix:PATH` or `tcp:HOST:PORT`.
    pub async fn connect(address: &str) -> Result<Connection> {
        let uri = VarlinkUri::parse(address)?;
        let stream = match uri.address {
            Address::Tcp(addr) => AsyncStream::Tcp(TcpStream::connect(addr).await?),
            #[cfg(unix)]
            Address::Unix(path) => AsyncStream::Unix(UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            Address::Unix(_) => return Err(Error::InvalidAddress(address.into())),
        };
        tracing::debug!(address, "connected");
        Ok(Connection::new(stream))
    }

    /// Serialize `message` and write it as one frame.
    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<()> {
        let mut frame = serde_json::to_vec(message)?;
        frame.push(0);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Return the next message from the stream, reading only when the
    /// buffer holds no complete frame.
    pub async fn receive(&mut self) -> Result<Value> {
        loop {
            if let Some(end) = self.buffer.iter().position(|&b| b == 0) {
                let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                let frame = &frame[..end];
                return serde_json::from_slice(frame).map_err(|_| {
                    Error::InvalidMessage(String::from_utf8_lossy(frame).into_owned())
                });
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(Error::ConnectionClosed);
                }
                return Err(Error::InvalidMessage(
                    String::from_utf8_lossy(&self.buffer).into_owned(),
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// True when a later receive can be satisfied without a socket read.
    pub fn buffered(&self) -> bool {
        !self.buffer.is_empty()
    }
}
