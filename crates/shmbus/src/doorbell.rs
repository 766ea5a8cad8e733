//! Named, edge-triggered cross-process event.
//!
//! A doorbell wakes one waiting process when another has produced data. The
//! endpoint is either a filesystem path (UNIX datagram socket) or a
//! `host:port` pair (UDP on the loopback). Delivery is edge-triggered and
//! coalescing: any number of rings between two waits collapse into a single
//! wakeup, and [`Doorbell::acknowledge`] drains whatever piled up.
//!
//! The waiting side binds the endpoint lazily on its first wait; ringers
//! connect lazily on their first ring. An endpoint with no bound waiter
//! reports [`Error::Unavailable`], which producers are free to ignore.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Payload of a normal ring.
const RING: u8 = b'!';
/// Payload of a relinquish: unblocks a waiter with `Unavailable`.
const REVOKE: u8 = b'~';

enum Endpoint {
    Path(PathBuf),
    Inet(SocketAddr),
}

enum Socket {
    Unix(UnixDatagram),
    Inet(UdpSocket),
}

impl Socket {
    fn send(&self, byte: u8) -> std::io::Result<usize> {
        match self {
            Socket::Unix(socket) => socket.send(&[byte]),
            Socket::Inet(socket) => socket.send(&[byte]),
        }
    }

    fn recv(&self, buffer: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Socket::Unix(socket) => socket.recv(buffer),
            Socket::Inet(socket) => socket.recv_from(buffer).map(|(n, _)| n),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Socket::Unix(socket) => socket.set_read_timeout(timeout),
            Socket::Inet(socket) => socket.set_read_timeout(timeout),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Socket::Unix(socket) => socket.set_nonblocking(nonblocking),
            Socket::Inet(socket) => socket.set_nonblocking(nonblocking),
        }
    }
}

/// See the module documentation.
pub struct Doorbell {
    endpoint: Endpoint,
    /// Bound receive socket, owned by the waiting side.
    waiter: Mutex<Option<Socket>>,
    /// Connected send socket, owned by the ringing side.
    ringer: Mutex<Option<Socket>>,
}

impl Doorbell {
    /// Creates a doorbell for `identifier`: `host:port` selects UDP,
    /// anything else is a socket path. No sockets are opened yet.
    pub fn new(identifier: &str) -> Self {
        let endpoint = identifier
            .parse::<SocketAddr>()
            .map_or_else(|_| Endpoint::Path(PathBuf::from(identifier)), Endpoint::Inet);

        Self {
            endpoint,
            waiter: Mutex::new(None),
            ringer: Mutex::new(None),
        }
    }

    fn bind(&self) -> std::io::Result<Socket> {
        match &self.endpoint {
            Endpoint::Path(path) => UnixDatagram::bind(path).map(Socket::Unix),
            Endpoint::Inet(addr) => UdpSocket::bind(addr).map(Socket::Inet),
        }
    }

    fn connect(&self) -> std::io::Result<Socket> {
        match &self.endpoint {
            Endpoint::Path(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                Ok(Socket::Unix(socket))
            }
            Endpoint::Inet(addr) => {
                let socket = UdpSocket::bind(("127.0.0.1", 0))?;
                socket.connect(addr)?;
                Ok(Socket::Inet(socket))
            }
        }
    }

    /// Signals the waiter, non-blocking. Rings coalesce; a missing waiter is
    /// reported as [`Error::Unavailable`].
    pub fn ring(&self) -> Result<()> {
        let mut guard = self.ringer.lock().unwrap();

        if guard.is_none() {
            match self.connect() {
                Ok(socket) => *guard = Some(socket),
                Err(_) => return Err(Error::Unavailable),
            }
        }

        match guard.as_ref().unwrap().send(RING) {
            Ok(_) => Ok(()),
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                // The receive queue is full; a wakeup is pending anyway.
                Ok(())
            }
            Err(_) => {
                // The counterpart went away; reconnect on the next ring.
                *guard = None;
                Err(Error::Unavailable)
            }
        }
    }

    /// Blocks until rung, the timeout passes, or the bell is relinquished.
    /// The caller becomes (and stays) the waiting side on first use.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut guard = self.waiter.lock().unwrap();

        if guard.is_none() {
            match self.bind() {
                Ok(socket) => *guard = Some(socket),
                Err(_) => return Err(Error::Unavailable),
            }
        }

        let socket = guard.as_ref().unwrap();
        socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))
            .map_err(|_| Error::Unavailable)?;

        let mut byte = [0u8; 1];
        match socket.recv(&mut byte) {
            Ok(0) => Err(Error::Unavailable),
            Ok(_) if byte[0] == REVOKE => Err(Error::Unavailable),
            Ok(_) => Ok(()),
            Err(error)
                if error.kind() == ErrorKind::WouldBlock || error.kind() == ErrorKind::TimedOut =>
            {
                Err(Error::TimedOut)
            }
            Err(_) => Err(Error::Unavailable),
        }
    }

    /// Consumes any rings still queued, collapsing them into the wakeup that
    /// already happened.
    pub fn acknowledge(&self) {
        let guard = self.waiter.lock().unwrap();

        if let Some(socket) = guard.as_ref() {
            if socket.set_nonblocking(true).is_ok() {
                let mut byte = [0u8; 1];
                while socket.recv(&mut byte).is_ok() {}
                let _ = socket.set_nonblocking(false);
            }
        }
    }

    /// Breaks an in-progress [`wait`](Self::wait); the waiter observes
    /// [`Error::Unavailable`].
    pub fn relinquish(&self) {
        if let Ok(socket) = self.connect() {
            let _ = socket.send(REVOKE);
        }
    }
}

impl Drop for Doorbell {
    fn drop(&mut self) {
        // A bound path socket leaves a filesystem entry behind.
        let bound = self.waiter.get_mut().map(|w| w.is_some()).unwrap_or(false);
        if bound {
            if let Endpoint::Path(path) = &self.endpoint {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}
