//! Listener binding, fd adoption, and the accepted-stream type.
//!
//! The supervisor binds exactly once; workers adopt the inherited
//! descriptor and never re-bind. Accept errors that are transient (EMFILE
//! and friends) log and back off instead of killing the accept loop.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error};

use crate::config::Endpoint;
use crate::error::Error;

const ACCEPT_BACKLOG: i32 = 1024;

/// Environment variable naming the inherited listener descriptor.
pub(crate) const LISTEN_FD_ENV: &str = "GANTRY_LISTEN_FD";

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
        /// Whether this process owns the socket file (and unlinks it).
        owned: bool,
    },
}

impl Listener {
    /// Bind the configured endpoint. TCP listeners get `SO_REUSEADDR`; a
    /// stale Unix socket file is unlinked iff nothing is listening on it.
    pub(crate) fn bind(endpoint: &Endpoint) -> crate::Result<Listener> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                // bare IPv6 literals need bracketing before parse
                let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
                    Ok(addr) => addr,
                    Err(_) => format!("[{}]:{}", host, port)
                        .parse()
                        .map_err(Error::new_config)?,
                };
                let domain = if addr.is_ipv4() {
                    Domain::IPV4
                } else {
                    Domain::IPV6
                };
                let socket =
                    Socket::new(domain, Type::STREAM, None).map_err(Error::new_listen)?;
                socket.set_reuse_address(true).map_err(Error::new_listen)?;
                socket.set_nonblocking(true).map_err(Error::new_listen)?;
                socket.bind(&addr.into()).map_err(Error::new_listen)?;
                socket.listen(ACCEPT_BACKLOG).map_err(Error::new_listen)?;
                let listener =
                    TcpListener::from_std(socket.into()).map_err(Error::new_listen)?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                if path.exists() {
                    reclaim_stale_socket(path)?;
                }
                let listener = UnixListener::bind(path).map_err(Error::new_listen)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                    owned: true,
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(Error::new_config(
                "unix sockets are not supported on this platform",
            )),
        }
    }

    /// Adopt the listener a supervisor left in `GANTRY_LISTEN_FD`.
    #[cfg(unix)]
    pub(crate) fn from_inherited_fd(endpoint: &Endpoint) -> crate::Result<Listener> {
        use std::os::unix::io::FromRawFd;

        let fd: i32 = std::env::var(LISTEN_FD_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::new_config("worker started without GANTRY_LISTEN_FD"))?;

        match endpoint {
            Endpoint::Tcp { .. } => {
                let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
                std_listener
                    .set_nonblocking(true)
                    .map_err(Error::new_listen)?;
                let listener =
                    TcpListener::from_std(std_listener).map_err(Error::new_listen)?;
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Unix { path } => {
                let std_listener =
                    unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
                std_listener
                    .set_nonblocking(true)
                    .map_err(Error::new_listen)?;
                let listener =
                    UnixListener::from_std(std_listener).map_err(Error::new_listen)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                    owned: false,
                })
            }
        }
    }

    /// Make the descriptor survive exec so spawned workers can adopt it.
    /// Returns the fd number to pass in the environment.
    #[cfg(unix)]
    pub(crate) fn prepare_inherit(&self) -> crate::Result<i32> {
        use std::os::unix::io::AsRawFd;

        let fd = match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix { listener, .. } => listener.as_raw_fd(),
        };
        // Clear FD_CLOEXEC so the fd crosses exec.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
        if rc != 0 {
            return Err(Error::new_listen(io::Error::last_os_error()));
        }
        Ok(fd)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }

    /// Accept one connection. Transient errors are logged and retried
    /// after a short sleep so an fd-exhausted process keeps serving.
    pub(crate) async fn accept(&self, nodelay: bool) -> crate::Result<Accepted> {
        loop {
            let result = match self {
                Listener::Tcp(listener) => {
                    listener.accept().await.map(|(stream, peer)| {
                        if nodelay {
                            let _ = stream.set_nodelay(true);
                        }
                        let local = stream.local_addr().ok();
                        Accepted {
                            stream: Stream::Tcp(stream),
                            peer: Some(peer),
                            local,
                        }
                    })
                }
                #[cfg(unix)]
                Listener::Unix { listener, .. } => {
                    listener.accept().await.map(|(stream, _)| Accepted {
                        stream: Stream::Unix(stream),
                        peer: None,
                        local: None,
                    })
                }
            };
            match result {
                Ok(accepted) => return Ok(accepted),
                Err(err) if is_connection_error(&err) => {
                    debug!("accept error: {}", err);
                    continue;
                }
                Err(err) => {
                    // e.g. EMFILE: closing some connections may recover us
                    error!("accept error: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix { path, owned: true, .. } = self {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Errors the peer caused that say nothing about the listener's health.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// A stale socket file is reclaimed only when no process answers on it.
#[cfg(unix)]
fn reclaim_stale_socket(path: &Path) -> crate::Result<()> {
    match std::os::unix::net::UnixStream::connect(path) {
        Ok(_) => Err(Error::new_listen(format!(
            "{} is in use by another process",
            path.display()
        ))),
        Err(_) => {
            debug!("unlinking stale socket {}", path.display());
            std::fs::remove_file(path).map_err(Error::new_listen)
        }
    }
}

pub(crate) struct Accepted {
    pub(crate) stream: Stream,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) local: Option<SocketAddr>,
}

/// One accepted transport, TCP or Unix.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Stream::Unix(s) => s.is_write_vectored(),
        }
    }
}
