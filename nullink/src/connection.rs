//! Framed JSON over a byte stream.
//!
//! Every message on the wire is one JSON value followed by a single NUL
//! byte; nothing else separates messages.

use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::uri::{Address, VarlinkUri};

const READ_CHUNK: usize = 8192;

/// A blocking NUL-framed JSON connection.
///
/// Receives are buffered: bytes past the first complete message stay in the
/// connection and satisfy later receives without touching the socket.
pub struct Connection {
    stream: Box<dyn Stream>,
    buffer: Vec<u8>,
}

impl Connection {
    pub fn new(stream: Box<dyn Stream>) -> Connection {
        Connection {
            stream,
            buffer: Vec::new(),
        }
    }

    /// Connect to `unix:PATH` or `tcp:HOST:PORT`.
    pub fn connect(address: &str) -> Result<Connection> {
        let uri = VarlinkUri::parse(address)?;
        let stream: Box<dyn Stream> = match uri.address {
            Address::Tcp(addr) => Box::new(TcpStream::connect(addr)?),
            #[cfg(unix)]
            Address::Unix(path) => Box::new(UnixStream::connect(path)?),
            #[cfg(not(unix))]
            Address::Unix(_) => return Err(Error::InvalidAddress(address.into())),
        };
        tracing::debug!(address, "connected");
        Ok(Connection::new(stream))
    }

    /// Serialize `message` and write it as one frame, retrying short writes
    /// until the frame is fully on the wire.
    pub fn send<M: Serialize>(&mut self, message: &M) -> Result<()> {
        let mut frame = serde_json::to_vec(message)?;
        frame.push(0);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Return the next message from the stream.
    pub fn receive(&mut self) -> Result<Value> {
        loop {
            if let Some(end) = self.buffer.iter().position(|&b| b == 0) {
                let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                let frame = &frame[..end];
                return serde_json::from_slice(frame).map_err(|_| {
                    Error::InvalidMessage(String::from_utf8_lossy(frame).into_owned())
                });
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Err(Error::ConnectionClosed);
                }
                // EOF in the middle of a frame
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

    pub fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown()?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown();
    }
}
