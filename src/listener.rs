use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;

use crate::addr::Protocol;
use crate::bridge::BoxedStream;
use crate::config::ListenConfig;
use crate::error::Error;
use crate::fdpass;
use crate::sockact;
use crate::socket_domain;

/// The accept side of a strategy: a freshly bound socket, a listener
/// inherited through socket activation, or a pseudo-listener whose accept
/// receives descriptors from a parent process.
pub enum ProxyListener {
    Tcp {
        inner: TcpListener,
        acceptor: Option<TlsAcceptor>,
    },
    Unix {
        inner: UnixListener,
        acceptor: Option<TlsAcceptor>,
    },
    /// UNIX socket carrying accepted connections as SCM_RIGHTS messages.
    FdChannel { channel: tokio::net::UnixStream },
}

impl ProxyListener {
    /// Binds (or takes over) the configured listen endpoint. Binding
    /// happens on a pinned thread inside the listen-side namespace.
    pub async fn bind(cfg: &ListenConfig) -> Result<ProxyListener, Error> {
        let acceptor = cfg.tls.server_config()?.map(TlsAcceptor::from);

        if cfg.addr.is_fd() {
            let fd = sockact::take_fd(cfg.addr.fd()?)?;
            return Self::from_inherited(fd, acceptor);
        }

        match cfg.protocol {
            Protocol::Tcp => {
                let netns = Arc::clone(&cfg.netns);
                let addr = cfg.addr.addr.clone();
                let std_listener = tokio::task::spawn_blocking(
                    move || -> Result<std::net::TcpListener, Error> {
                        let _guard = netns.enter()?;
                        let listener = std::net::TcpListener::bind(&addr).map_err(Error::Listen)?;
                        listener.set_nonblocking(true).map_err(Error::Listen)?;
                        Ok(listener)
                    },
                )
                .await
                .map_err(|e| Error::Listen(std::io::Error::other(e)))??;
                Ok(ProxyListener::Tcp {
                    inner: TcpListener::from_std(std_listener).map_err(Error::Listen)?,
                    acceptor,
                })
            }
            Protocol::Unix => {
                let netns = Arc::clone(&cfg.netns);
                let path = cfg.addr.addr.clone();
                let std_listener = tokio::task::spawn_blocking(
                    move || -> Result<std::os::unix::net::UnixListener, Error> {
                        let _guard = netns.enter()?;
                        let listener =
                            std::os::unix::net::UnixListener::bind(&path).map_err(Error::Listen)?;
                        listener.set_nonblocking(true).map_err(Error::Listen)?;
                        Ok(listener)
                    },
                )
                .await
                .map_err(|e| Error::Listen(std::io::Error::other(e)))??;
                Ok(ProxyListener::Unix {
                    inner: UnixListener::from_std(std_listener).map_err(Error::Listen)?,
                    acceptor,
                })
            }
            other => Err(Error::config(format!(
                "cannot accept streams on datagram protocol {other}"
            ))),
        }
    }

    /// Wraps an inherited descriptor as a listener, picking TCP or UNIX by
    /// the socket's domain.
    pub fn from_inherited(fd: OwnedFd, acceptor: Option<TlsAcceptor>) -> Result<Self, Error> {
        match socket_domain(fd.as_raw_fd()) {
            Ok(libc::AF_INET) | Ok(libc::AF_INET6) => {
                let listener = std::net::TcpListener::from(fd);
                listener.set_nonblocking(true).map_err(Error::Listen)?;
                Ok(ProxyListener::Tcp {
                    inner: TcpListener::from_std(listener).map_err(Error::Listen)?,
                    acceptor,
                })
            }
            Ok(libc::AF_UNIX) => {
                let listener = std::os::unix::net::UnixListener::from(fd);
                listener.set_nonblocking(true).map_err(Error::Listen)?;
                Ok(ProxyListener::Unix {
                    inner: UnixListener::from_std(listener).map_err(Error::Listen)?,
                    acceptor,
                })
            }
            Ok(domain) => Err(Error::config(format!(
                "inherited fd has unsupported socket domain {domain}"
            ))),
            Err(e) => Err(Error::config(format!("inherited fd: {e}"))),
        }
    }

    /// Pseudo-listener over a descriptor-passing channel.
    pub fn from_fd_channel(channel: tokio::net::UnixStream) -> Self {
        ProxyListener::FdChannel { channel }
    }

    pub async fn accept(&mut self) -> Result<Accepted, Error> {
        match self {
            ProxyListener::Tcp { inner, acceptor } => {
                let (stream, _) = inner.accept().await.map_err(Error::Listen)?;
                Ok(wrap_accepted(PlainStream::Tcp(stream), acceptor))
            }
            ProxyListener::Unix { inner, acceptor } => {
                let (stream, _) = inner.accept().await.map_err(Error::Listen)?;
                Ok(wrap_accepted(PlainStream::Unix(stream), acceptor))
            }
            ProxyListener::FdChannel { channel } => {
                let fd = fdpass::recv_fd(channel).await?;
                Ok(Accepted::Plain(stream_from_fd(fd)?))
            }
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            ProxyListener::Tcp { inner, .. } => inner.local_addr().ok(),
            _ => None,
        }
    }
}

fn wrap_accepted(stream: PlainStream, acceptor: &Option<TlsAcceptor>) -> Accepted {
    match acceptor {
        // the handshake future is handed to the per-connection task; a slow
        // or hostile client must not stall the accept loop
        Some(acceptor) => Accepted::Tls(acceptor.accept(stream.into_boxed())),
        None => Accepted::Plain(stream),
    }
}

/// Re-opens a received descriptor as an async stream, picking the type by
/// socket domain: TCP sockets arrive from fd passthrough, UNIX sockets from
/// a TLS-terminating sender.
pub fn stream_from_fd(fd: OwnedFd) -> Result<PlainStream, Error> {
    match socket_domain(fd.as_raw_fd()) {
        Ok(libc::AF_INET) | Ok(libc::AF_INET6) => {
            let stream = std::net::TcpStream::from(fd);
            stream.set_nonblocking(true).map_err(Error::Listen)?;
            Ok(PlainStream::Tcp(
                TcpStream::from_std(stream).map_err(Error::Listen)?,
            ))
        }
        Ok(libc::AF_UNIX) => {
            let stream = std::os::unix::net::UnixStream::from(fd);
            stream.set_nonblocking(true).map_err(Error::Listen)?;
            Ok(PlainStream::Unix(
                UnixStream::from_std(stream).map_err(Error::Listen)?,
            ))
        }
        Ok(domain) => Err(Error::config(format!(
            "received fd has unsupported socket domain {domain}"
        ))),
        Err(e) => Err(Error::config(format!("received fd: {e}"))),
    }
}

pub enum PlainStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl PlainStream {
    pub fn into_boxed(self) -> BoxedStream {
        match self {
            PlainStream::Tcp(stream) => Box::new(stream),
            PlainStream::Unix(stream) => Box::new(stream),
        }
    }

    /// Converts back into an owned descriptor for SCM_RIGHTS shipping.
    pub fn into_owned_fd(self) -> std::io::Result<OwnedFd> {
        match self {
            PlainStream::Tcp(stream) => Ok(stream.into_std()?.into()),
            PlainStream::Unix(stream) => Ok(stream.into_std()?.into()),
        }
    }
}

/// One accepted connection. TLS handshakes are deferred so the accept loop
/// stays responsive; `into_stream` drives them to completion.
pub enum Accepted {
    Plain(PlainStream),
    Tls(tokio_rustls::Accept<BoxedStream>),
}

impl Accepted {
    pub fn is_tls(&self) -> bool {
        matches!(self, Accepted::Tls(_))
    }

    pub async fn into_stream(self) -> std::io::Result<BoxedStream> {
        match self {
            Accepted::Plain(stream) => Ok(stream.into_boxed()),
            Accepted::Tls(handshake) => Ok(Box::new(handshake.await?)),
        }
    }
}
