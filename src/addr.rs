use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;

use crate::error::Error;

/// Transport protocol of an endpoint. Datagram protocols parse but are
/// rejected when a strategy starts, since the forwarding path is
/// stream-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Unix,
    Unixgram,
}

impl Protocol {
    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Unix)
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "unix" => Ok(Protocol::Unix),
            "unixgram" => Ok(Protocol::Unixgram),
            other => Err(format!("unknown protocol {other:?}")),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Unix => "unix",
            Protocol::Unixgram => "unixgram",
        };
        f.write_str(s)
    }
}

/// A textual endpoint address. `FD:<n>` denotes a descriptor inherited from
/// the parent process; anything else is opaque here and interpreted by the
/// protocol-aware listener or dialer.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub addr: String,
}

const FD_PREFIX: &str = "FD:";

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Endpoint { addr: addr.into() }
    }

    pub fn is_set(&self) -> bool {
        !self.addr.is_empty()
    }

    pub fn is_fd(&self) -> bool {
        self.addr.starts_with(FD_PREFIX)
    }

    /// The inherited descriptor number. Descriptors 0-2 are stdio and never
    /// valid endpoints.
    pub fn fd(&self) -> Result<RawFd, Error> {
        if !self.is_fd() {
            return Err(Error::config(format!("not an FD: {}", self.addr)));
        }
        let n: RawFd = self.addr[FD_PREFIX.len()..]
            .parse()
            .map_err(|e| Error::config(format!("bad fd number in {:?}: {e}", self.addr)))?;
        if n < 3 {
            return Err(Error::config(format!("fd {n} is reserved for stdio")));
        }
        Ok(n)
    }

    /// Takes ownership of the inherited descriptor. The caller owns the fd
    /// from here on and releases it into a listener or stream.
    pub fn as_file(&self) -> Result<OwnedFd, Error> {
        let fd = self.fd()?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Classifies the address against the configured protocol and fd-channel
    /// flag.
    pub fn classify(&self, protocol: Protocol, accepts_conn: bool) -> EndpointAddr {
        if !self.is_set() {
            return EndpointAddr::Unspecified;
        }
        match self.fd() {
            Ok(fd) => EndpointAddr::InheritedFd { fd, accepts_conn },
            Err(_) => EndpointAddr::Inet {
                protocol,
                addr: self.addr.clone(),
            },
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddr {
    Inet { protocol: Protocol, addr: String },
    InheritedFd { fd: RawFd, accepts_conn: bool },
    Unspecified,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_prefix_parses() {
        let e = Endpoint::new("FD:3");
        assert!(e.is_fd());
        assert_eq!(e.fd().unwrap(), 3);
    }

    #[test]
    fn stdio_fds_rejected() {
        for n in 0..3 {
            assert!(Endpoint::new(format!("FD:{n}")).fd().is_err());
        }
    }

    #[test]
    fn host_port_is_not_fd() {
        let e = Endpoint::new("127.0.0.1:9000");
        assert!(!e.is_fd());
        assert!(e.fd().is_err());
        assert_eq!(
            e.classify(Protocol::Tcp, false),
            EndpointAddr::Inet {
                protocol: Protocol::Tcp,
                addr: "127.0.0.1:9000".into()
            }
        );
    }

    #[test]
    fn garbage_after_prefix_is_error() {
        assert!(Endpoint::new("FD:three").fd().is_err());
        assert!(Endpoint::new("FD:-1").fd().is_err());
    }

    #[test]
    fn empty_is_unspecified() {
        assert_eq!(
            Endpoint::default().classify(Protocol::Tcp, false),
            EndpointAddr::Unspecified
        );
    }
}
