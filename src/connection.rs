//! Wrapper around one accepted socket.
//!
//! Handlers receive a [`Connection`] and use its blocking send/receive
//! calls; the configured per-listener timeout is applied to both directions
//! when the connection is constructed. Works for TCP and Unix-domain
//! sockets alike.

use socket2::Socket;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

/// One accepted connection, handed to the user handler.
pub struct Connection {
    socket: Socket,
    open: bool,
}

impl Connection {
    /// Wrap an accepted socket, applying the given timeout to reads and
    /// writes. A `None` timeout leaves the socket fully blocking.
    pub(crate) fn new(socket: Socket, timeout: Option<Duration>) -> io::Result<Self> {
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)?;
        Ok(Self { socket, open: true })
    }

    /// Receive bytes into `buf`. Returns `Ok(0)` on peer EOF.
    ///
    /// A stalled peer surfaces as an error for which [`Connection::is_timeout`]
    /// returns true.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.read(buf)
    }

    /// Send bytes, returning how many were written.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    /// Send the entire buffer.
    pub fn send_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.socket.write_all(buf)
    }

    /// The peer's address, for inet connections.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok().and_then(|a| a.as_socket())
    }

    /// Whether the connection has not been explicitly closed.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Shut down and mark the connection closed. Idempotent; the second
    /// call is a no-op. The file descriptor is released on drop.
    pub fn close(&mut self) {
        if self.open {
            let _ = self.socket.shutdown(Shutdown::Both);
            self.open = false;
        }
    }

    /// Whether an I/O error from [`recv`](Connection::recv) or
    /// [`send`](Connection::send) was caused by the configured timeout
    /// rather than a hard failure.
    pub fn is_timeout(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Type};

    fn pair() -> (Connection, Socket) {
        let (a, b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        let conn = Connection::new(a, Some(Duration::from_millis(50))).unwrap();
        (conn, b)
    }

    #[test]
    fn test_recv_times_out() {
        let (mut conn, _peer) = pair();
        let mut buf = [0u8; 16];

        let err = conn.recv(&mut buf).unwrap_err();
        assert!(Connection::is_timeout(&err));
    }

    #[test]
    fn test_send_and_recv() {
        let (mut conn, peer) = pair();

        let mut peer = Connection::new(peer, Some(Duration::from_millis(200))).unwrap();
        conn.send_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut conn, _peer) = pair();
        assert!(conn.is_open());
        conn.close();
        assert!(!conn.is_open());
        conn.close();
        assert!(!conn.is_open());
    }

    #[test]
    fn test_recv_after_peer_close_is_eof() {
        let (mut conn, peer) = pair();
        drop(peer);

        let mut buf = [0u8; 16];
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);
    }
}
