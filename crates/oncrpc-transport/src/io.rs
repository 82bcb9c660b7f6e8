//! Byte-stream primitives consumed by stream transports.
//!
//! `StreamIo` is the narrow seam between the record-marking state machine and
//! the host's sockets. Implementations never wait on their own when the
//! underlying descriptor is non-blocking: they surface
//! `io::ErrorKind::WouldBlock` and the caller resumes after the next
//! readiness notification.

use std::io::{self, Read, Write};

/// Partial read/write access to a connected byte stream.
pub trait StreamIo {
    /// Reads at most `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes at most `buf.len()` bytes, returning how many were accepted.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<T: StreamIo + ?Sized> StreamIo for &mut T {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_some(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write_some(buf)
    }
}

impl StreamIo for std::net::TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }
}

#[cfg(unix)]
impl StreamIo for std::os::unix::net::UnixStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }
}

impl StreamIo for tokio::net::TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

#[cfg(unix)]
impl StreamIo for tokio::net::UnixStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

/// Writes the whole buffer, retrying on interruption. Returns the number of
/// bytes written before the stream reported would-block.
pub fn write_available<I: StreamIo + ?Sized>(io: &mut I, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match io.write_some(&buf[written..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
