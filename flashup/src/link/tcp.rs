//! TCP link over a non-blocking `std::net` socket.

use crate::error::{Error, Result};
use crate::link::Link;
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Upper bound on connection establishment.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a stalled write; past this the peer is treated as gone.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A TCP link. Connects on [`Link::open`] and switches the socket to
/// non-blocking mode so reads behave as polls.
pub struct TcpLink {
    endpoint: String,
    stream: Option<TcpStream>,
}

impl TcpLink {
    /// Create an unconnected link for `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("{host}:{port}"),
            stream: None,
        }
    }
}

impl Link for TcpLink {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr: SocketAddr = self
            .endpoint
            .to_socket_addrs()
            .map_err(|e| Error::ConnectFailed(format!("{}: {e}", self.endpoint)))?
            .next()
            .ok_or_else(|| {
                Error::ConnectFailed(format!("{}: no address resolved", self.endpoint))
            })?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                Error::Timeout(format!("{}: connect timed out", self.endpoint))
            } else {
                Error::ConnectFailed(format!("{}: {e}", self.endpoint))
            }
        })?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", self.endpoint);
        self.stream = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ConnectFailed("socket is not connected".into()));
        };

        match stream.read(buf) {
            // A zero-length read on TCP means the peer closed the connection.
            Ok(0) => Err(Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ))),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::ConnectFailed("socket is not connected".into()));
        };

        // The socket is non-blocking; retry briefly on WouldBlock so request
        // writes stay whole, but give up once the peer stops draining.
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut written = 0;
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(format!(
                            "{}: write stalled after {written} bytes",
                            self.endpoint
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Disconnected from {}", self.endpoint);
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
