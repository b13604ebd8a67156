//! Portable stream-socket wrapper used by both sides of a debug session.
//!
//! TCP for remote sessions, Unix domain sockets for local ones. Accepted
//! sockets inherit a fixed read timeout so the connection receiver never
//! blocks unboundedly and can observe its end flag.

use crate::error::Error;
use crate::{gl_debug, muted_error};
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

/// Read timeout installed on accepted and connected sockets.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a debug session lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// A connected stream socket. Exclusively owned by its [`Connection`].
///
/// [`Connection`]: crate::connection::Connection
pub struct Transport {
    stream: Stream,
    peer: String,
}

impl Transport {
    /// Connect to a listening debug endpoint.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, Error> {
        let stream = match endpoint {
            Endpoint::Tcp { host, port } => {
                let s = TcpStream::connect((host.as_str(), *port))?;
                s.set_nodelay(true)?;
                Stream::Tcp(s)
            }
            Endpoint::Unix { path } => Stream::Unix(UnixStream::connect(path)?),
        };

        let t = Self {
            stream,
            peer: endpoint.to_string(),
        };
        t.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(t)
    }

    fn from_tcp(stream: TcpStream) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp://?".to_string());
        Ok(Self {
            stream: Stream::Tcp(stream),
            peer,
        })
    }

    fn from_unix(stream: UnixStream, path: &std::path::Path) -> Self {
        Self {
            stream: Stream::Unix(stream),
            peer: format!("unix://{}", path.display()),
        }
    }

    /// Clone the socket handle. Used to split one socket into a read half
    /// (receiver thread) and a write half (sender thread); both refer to
    /// the same open socket.
    pub fn try_clone(&self) -> Result<Self, Error> {
        let stream = match &self.stream {
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
        };
        Ok(Self {
            stream,
            peer: self.peer.clone(),
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        match &self.stream {
            Stream::Tcp(s) => s.set_read_timeout(timeout)?,
            Stream::Unix(s) => s.set_read_timeout(timeout)?,
        }
        Ok(())
    }

    /// Shut the socket down in both directions, waking any blocked reader
    /// or writer on either half.
    pub fn shutdown(&self) {
        let _ = match &self.stream {
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }

    /// Human-readable peer description for diagnostics.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.stream {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.stream {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.stream {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// A listening socket accepting debug sessions.
pub struct Listener {
    acceptor: Acceptor,
    endpoint: Endpoint,
}

impl Listener {
    /// Bind to `endpoint`. A stale Unix socket path is unlinked first.
    pub fn bind(endpoint: &Endpoint) -> Result<Self, Error> {
        let acceptor = match endpoint {
            Endpoint::Tcp { host, port } => {
                Acceptor::Tcp(TcpListener::bind((host.as_str(), *port))?)
            }
            Endpoint::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Acceptor::Unix(UnixListener::bind(path)?, path.clone())
            }
        };
        Ok(Self {
            acceptor,
            endpoint: endpoint.clone(),
        })
    }

    /// The bound endpoint. For TCP with port 0 this carries the actual
    /// OS-assigned port.
    pub fn local_endpoint(&self) -> Result<Endpoint, Error> {
        match &self.acceptor {
            Acceptor::Tcp(l) => {
                let addr = l.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            Acceptor::Unix(_, path) => Ok(Endpoint::Unix { path: path.clone() }),
        }
    }

    /// Block until a peer connects and hand back its transport with the
    /// read timeout already installed.
    pub fn accept(&self) -> Result<Transport, Error> {
        let transport = match &self.acceptor {
            Acceptor::Tcp(l) => {
                let (stream, _) = l.accept()?;
                Transport::from_tcp(stream)?
            }
            Acceptor::Unix(l, path) => {
                let (stream, _) = l.accept()?;
                Transport::from_unix(stream, path)
            }
        };
        transport.set_read_timeout(Some(READ_TIMEOUT))?;

        gl_debug!(target: "connection", "accepted peer {} on {}", transport.peer(), self.endpoint);
        Ok(transport)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Acceptor::Unix(_, path) = &self.acceptor {
            muted_error!(std::fs::remove_file(path), "socket unlink failed:");
        }
    }
}
