//! The byte-stream seam under the blocking transport.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// A connected byte stream a [`Connection`](crate::Connection) can frame
/// messages over.
pub trait Stream: Read + Write + Send {
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Stream for UnixStream {
    #[inline]
    fn shutdown(&mut self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}
