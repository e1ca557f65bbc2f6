//! Duplex channel transports.
//!
//! A server is addressed by an `Endpoint`. Named endpoints on the local host
//! rendezvous through a Unix domain socket in the user's runtime directory;
//! TCP endpoints are available for everything else.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::IpcConfig;
use crate::error::{RemexError, Result};

/// A byte stream that can be read and written from one task.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

/// One established connection.
pub type Channel = Box<dyn DuplexStream>;

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A channel rendezvous name on a host (`.` is the local machine).
    Named { host: String, name: String },
    Tcp(SocketAddr),
}

impl Endpoint {
    /// A named endpoint on the local machine.
    pub fn named(name: impl Into<String>) -> Self {
        Self::on_host(IpcConfig::LOCAL_HOST, name)
    }

    pub fn on_host(host: impl Into<String>, name: impl Into<String>) -> Self {
        Endpoint::Named {
            host: host.into(),
            name: name.into(),
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Endpoint::Tcp(addr)
    }

    /// TCP on the loopback interface with an OS-assigned port.
    pub fn loopback() -> Self {
        Endpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    pub fn is_local(&self) -> bool {
        match self {
            Endpoint::Named { host, .. } => {
                host == IpcConfig::LOCAL_HOST || host.eq_ignore_ascii_case("localhost")
            }
            Endpoint::Tcp(addr) => addr.ip().is_loopback(),
        }
    }

    /// Filesystem path of a local named endpoint's socket.
    pub fn socket_path(&self) -> Result<PathBuf> {
        let name = match self {
            Endpoint::Named { name, .. } if self.is_local() => name,
            Endpoint::Named { host, .. } => {
                return Err(RemexError::Config {
                    message: format!(
                        "named endpoints on remote host {} are not supported; use a TCP endpoint",
                        host
                    ),
                })
            }
            Endpoint::Tcp(addr) => {
                return Err(RemexError::Config {
                    message: format!("TCP endpoint {} has no socket path", addr),
                })
            }
        };

        if name.is_empty() || name.contains(['/', '\\', '\0']) {
            return Err(RemexError::Config {
                message: format!("invalid endpoint name {:?}", name),
            });
        }

        let dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Ok(dir.join(format!("{}{}.sock", IpcConfig::SOCKET_FILE_PREFIX, name)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Named { host, name } => write!(f, "\\\\{}\\{}", host, name),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

/// A bound, accepting server socket.
#[derive(Debug)]
pub enum ChannelListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl ChannelListener {
    /// Bind `endpoint`, replacing a stale socket file left by a dead server.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(ChannelListener::Tcp(TcpListener::bind(addr).await?)),
            Endpoint::Named { .. } => Self::bind_named(endpoint).await,
        }
    }

    #[cfg(unix)]
    async fn bind_named(endpoint: &Endpoint) -> Result<Self> {
        let path = endpoint.socket_path()?;
        if path.exists() {
            if tokio::net::UnixStream::connect(&path).await.is_ok() {
                return Err(RemexError::Config {
                    message: format!("endpoint {} is already in use", endpoint),
                });
            }
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(ChannelListener::Unix { listener, path })
    }

    #[cfg(not(unix))]
    async fn bind_named(endpoint: &Endpoint) -> Result<Self> {
        Err(RemexError::Config {
            message: format!("named endpoint {} requires Unix domain sockets", endpoint),
        })
    }

    /// Wait for the next connection; returns the channel and a peer label.
    pub async fn accept(&self) -> Result<(Channel, String)> {
        match self {
            ChannelListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            ChannelListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    /// The endpoint clients should connect to.
    ///
    /// For TCP this carries the OS-assigned port.
    pub fn local_endpoint(&self, requested: &Endpoint) -> Result<Endpoint> {
        match self {
            ChannelListener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            ChannelListener::Unix { .. } => Ok(requested.clone()),
        }
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let ChannelListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Open a channel to `endpoint`.
pub async fn connect(endpoint: &Endpoint) -> Result<Channel> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Endpoint::Named { .. } => connect_named(endpoint).await,
    }
}

#[cfg(unix)]
async fn connect_named(endpoint: &Endpoint) -> Result<Channel> {
    let path = endpoint.socket_path()?;
    let stream = tokio::net::UnixStream::connect(&path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_named(endpoint: &Endpoint) -> Result<Channel> {
    Err(RemexError::Config {
        message: format!("named endpoint {} requires Unix domain sockets", endpoint),
    })
}
