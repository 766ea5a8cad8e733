//! Minimal framed request/reply plumbing for the metadata endpoint.
//!
//! Frames are `u8 length || bytes`, so a frame body never exceeds 255 bytes;
//! list replies that do not fit are truncated at an entry boundary. The
//! endpoint is a UNIX stream socket path, or `host:port` when the unit runs
//! in socket mode.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

/// Largest frame body the `u8` length prefix can carry.
pub(crate) const MAX_FRAME: usize = u8::MAX as usize;

/// One-byte request body asking for the distinct module names. Unambiguous
/// on the wire: a control update always starts with a kind byte, and 0 is
/// not a valid kind.
pub(crate) const MODULE_LIST_REQUEST: u8 = 0;

pub(crate) enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl Listener {
    pub(crate) fn bind(endpoint: &str) -> io::Result<Self> {
        match endpoint.parse::<SocketAddr>() {
            Ok(address) => TcpListener::bind(address).map(Listener::Tcp),
            Err(_) => {
                let path = PathBuf::from(endpoint);
                // A stale socket from a previous run blocks the bind.
                let _ = std::fs::remove_file(&path);
                UnixListener::bind(&path).map(|listener| Listener::Unix(listener, path))
            }
        }
    }

    pub(crate) fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Unix(listener, _) => listener.accept().map(|(stream, _)| Stream::Unix(stream)),
            Listener::Tcp(listener) => listener.accept().map(|(stream, _)| Stream::Tcp(stream)),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub(crate) enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

pub(crate) fn connect(endpoint: &str) -> io::Result<Stream> {
    match endpoint.parse::<SocketAddr>() {
        Ok(address) => TcpStream::connect(address).map(Stream::Tcp),
        Err(_) => UnixStream::connect(endpoint).map(Stream::Unix),
    }
}

impl Read for Stream {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(stream) => stream.read(buffer),
            Stream::Tcp(stream) => stream.read(buffer),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(stream) => stream.write(buffer),
            Stream::Tcp(stream) => stream.write(buffer),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(stream) => stream.flush(),
            Stream::Tcp(stream) => stream.flush(),
        }
    }
}

/// Reads one frame into `buffer`, returning the body length.
pub(crate) fn read_frame(stream: &mut Stream, buffer: &mut [u8]) -> io::Result<usize> {
    debug_assert!(buffer.len() >= MAX_FRAME);

    let mut length = [0u8; 1];
    stream.read_exact(&mut length)?;
    let length = length[0] as usize;

    stream.read_exact(&mut buffer[..length])?;
    Ok(length)
}

/// Writes one frame. Bodies longer than [`MAX_FRAME`] are a caller bug.
pub(crate) fn write_frame(stream: &mut Stream, body: &[u8]) -> io::Result<()> {
    debug_assert!(body.len() <= MAX_FRAME);

    stream.write_all(&[body.len() as u8])?;
    stream.write_all(body)?;
    stream.flush()
}
