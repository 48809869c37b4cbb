//! Blocking byte-stream abstraction under a connection.
//!
//! A [`Transport`] is a plain TCP stream, a TLS wrapped stream (produced by
//! a [`TlsProvider`]) or a tunneled TLS stream. The connection state
//! machine only ever talks to this trait, which is what lets the rest of
//! the crate be tested against scripted in-memory transports.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::Error;

mod resolve;
mod tls;

pub use resolve::{FamilyPref, GaiResolver, Resolver};
pub use tls::{TlsConfig, TlsProvider, TlsSetup, TlsVersion, VerifyMode};

/// Outcome of the idle health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleProbe {
    /// Nothing to read; the peer has not closed.
    Healthy,
    /// The peer sent FIN while the connection was idle.
    Eof,
    /// Unexpected bytes are waiting. A previous response was not fully
    /// consumed, or the server is talking out of turn.
    PendingBytes,
    /// The probe itself failed.
    Failed,
}

/// A blocking bidirectional byte stream.
///
/// Each call carries its own time budget; `None` blocks indefinitely.
pub trait Transport: Send + fmt::Debug {
    /// Read some bytes. `Ok(0)` is EOF.
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error>;

    /// Write the entire buffer.
    fn write_all(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<(), Error>;

    /// Shut the stream down. Best effort, idempotent.
    fn close(&mut self);

    /// Address of the connected peer.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Zero-byte non-blocking peek to detect a dead idle connection.
    fn probe_idle(&mut self) -> IdleProbe;

    /// Whether the peer certificate was verified. TLS transports only.
    fn is_verified(&self) -> bool {
        false
    }

    /// The underlying TCP stream, when there is one.
    ///
    /// TLS wrappers delegate here so the health probe and timeout plumbing
    /// can reach the socket.
    fn tcp_stream(&self) -> Option<&TcpStream> {
        None
    }
}

/// Plain TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<TcpTransport, Error> {
        let peer = stream.peer_addr().map_err(Error::Io)?;
        Ok(TcpTransport {
            stream,
            peer,
            closed: false,
        })
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport").field("peer", &self.peer).finish()
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(Error::Io)?;
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(map_timeout(e, Error::ReadTimeout)),
        }
    }

    fn write_all(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        self.stream
            .set_write_timeout(timeout)
            .map_err(Error::Io)?;
        self.stream
            .write_all(buf)
            .map_err(|e| map_timeout(e, Error::ReadTimeout))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn probe_idle(&mut self) -> IdleProbe {
        probe_tcp(&self.stream)
    }

    fn tcp_stream(&self) -> Option<&TcpStream> {
        Some(&self.stream)
    }
}

/// Timeout kinds differ per platform: unix reports `WouldBlock`, windows
/// `TimedOut`.
pub(crate) fn map_timeout(e: io::Error, on_timeout: Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => on_timeout,
        _ => Error::Io(e),
    }
}

/// Shared probe for any transport that can reach its TCP stream.
pub(crate) fn probe_tcp(stream: &TcpStream) -> IdleProbe {
    if stream.set_nonblocking(true).is_err() {
        return IdleProbe::Failed;
    }
    let mut byte = [0u8; 1];
    let result = match stream.peek(&mut byte) {
        Ok(0) => IdleProbe::Eof,
        Ok(_) => IdleProbe::PendingBytes,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IdleProbe::Healthy,
        Err(_) => IdleProbe::Failed,
    };
    if stream.set_nonblocking(false).is_err() {
        return IdleProbe::Failed;
    }
    result
}

/// Establish a TCP connection honoring the per-attempt connect budget.
///
/// Addresses are tried in resolver order; the first success wins. The
/// budget applies to each attempt, matching how a `connect` timeout is
/// documented.
pub(crate) fn connect_tcp(
    addrs: &[SocketAddr],
    timeout: Option<Duration>,
    nodelay: bool,
) -> Result<TcpStream, Error> {
    let mut last_err = None;

    for addr in addrs {
        let attempt = match timeout {
            Some(t) if t.is_zero() => return Err(Error::ConnectTimeout),
            Some(t) => TcpStream::connect_timeout(addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                if nodelay {
                    let _ = stream.set_nodelay(true);
                }
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                last_err = Some(Error::ConnectTimeout);
            }
            Err(e) => last_err = Some(Error::Connect(e)),
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Resolve("no addresses".into())))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_round_trip_and_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            s.write_all(b"pong").unwrap();
            // Hold the socket open until the client is done probing.
            std::thread::sleep(Duration::from_millis(200));
        });

        let stream = connect_tcp(&[addr], Some(Duration::from_secs(5)), true).unwrap();
        let mut t = TcpTransport::new(stream).unwrap();

        t.write_all(b"ping", None).unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += t.read(&mut buf[got..], Some(Duration::from_secs(5))).unwrap();
        }
        assert_eq!(&buf, b"pong");

        assert_eq!(t.probe_idle(), IdleProbe::Healthy);
        assert_eq!(t.peer_addr(), Some(addr));

        t.close();
        server.join().unwrap();
    }

    #[test]
    fn probe_detects_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (s, _) = listener.accept().unwrap();
            drop(s);
        });

        let stream = connect_tcp(&[addr], Some(Duration::from_secs(5)), false).unwrap();
        let mut t = TcpTransport::new(stream).unwrap();
        server.join().unwrap();

        // Give the FIN a moment to arrive.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(t.probe_idle(), IdleProbe::Eof);
    }

    #[test]
    fn read_timeout_maps_to_read_timeout_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_tcp(&[addr], Some(Duration::from_secs(5)), false).unwrap();
        let mut t = TcpTransport::new(stream).unwrap();

        let mut buf = [0u8; 1];
        let err = t.read(&mut buf, Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, Error::ReadTimeout));
        drop(listener);
    }

    #[test]
    fn connect_refused_is_connect_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_tcp(&[addr], Some(Duration::from_secs(1)), false).unwrap_err();
        assert!(matches!(err, Error::Connect(_) | Error::ConnectTimeout));
    }
}
