//! Transport abstraction for the control bus and the pixel feed.
//!
//! The bus core never names a concrete socket type; it connects through a
//! [`Transport`] and works with any duplex byte stream. The device agent
//! wires [`UnixTransport`] to the local control socket and [`TcpTransport`]
//! to the remote compute service; tests wire in-memory duplex pipes.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Boxed connect future.
pub type ConnectFuture<'a, S> = Pin<Box<dyn Future<Output = io::Result<S>> + Send + 'a>>;

/// A way to (re)establish one duplex byte stream to a peer.
///
/// `connect` is called again after every stream teardown, so implementations
/// must be reusable.
pub trait Transport: Send + Sync + 'static {
    /// The connected stream type.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Establish a fresh stream to the peer.
    fn connect(&self) -> ConnectFuture<'_, Self::Stream>;
}

/// Unix domain socket transport (the local control bus).
#[derive(Debug, Clone)]
pub struct UnixTransport {
    path: PathBuf,
}

impl UnixTransport {
    /// Transport connecting to the socket file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The socket path this transport connects to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for UnixTransport {
    type Stream = UnixStream;

    fn connect(&self) -> ConnectFuture<'_, UnixStream> {
        Box::pin(UnixStream::connect(&self.path))
    }
}

/// TCP transport (the remote pixel feed endpoint).
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    /// Transport connecting to `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// The address this transport connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn connect(&self) -> ConnectFuture<'_, TcpStream> {
        Box::pin(TcpStream::connect(self.addr.clone()))
    }
}
