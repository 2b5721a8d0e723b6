use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::addr::{Endpoint, Protocol};
use crate::netns::{NetnsSpec, NsDialer};
use crate::tls::TlsSettings;
use crate::user::UserSpec;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept-side configuration of one proxy.
#[derive(Debug, Default)]
pub struct ListenConfig {
    pub addr: Endpoint,
    pub protocol: Protocol,
    /// The inherited fd is a UNIX socket delivering accepted connections
    /// rather than a listener.
    pub conn: bool,
    pub fork: bool,
    pub user: UserSpec,
    pub netns: Arc<NetnsSpec>,
    pub tls: TlsSettings,
}

/// Dial-side configuration of one proxy.
#[derive(Debug)]
pub struct ClientConfig {
    pub addr: Endpoint,
    pub protocol: Protocol,
    pub fork: bool,
    pub source_ip: Option<IpAddr>,
    pub timeout: Duration,
    pub user: UserSpec,
    pub netns: Arc<NetnsSpec>,
    pub tls: TlsSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: Endpoint::default(),
            protocol: Protocol::Tcp,
            fork: false,
            source_ip: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
            user: UserSpec::default(),
            netns: Arc::default(),
            tls: TlsSettings::default(),
        }
    }
}

impl ClientConfig {
    pub fn dialer(&self) -> NsDialer {
        self.netns
            .dialer(self.protocol, self.source_ip, self.timeout)
    }
}

/// The six ways to wire accept and dial sides together. Selection rules are
/// disjoint and evaluated top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ForkListenForkClient,
    ForkListen,
    ForkClient,
    UnixSend,
    UnixDial,
    Simple,
}

impl Strategy {
    pub fn select(listen: &ListenConfig, client: &ClientConfig) -> Strategy {
        if listen.fork && client.fork {
            Strategy::ForkListenForkClient
        } else if listen.fork {
            Strategy::ForkListen
        } else if client.fork {
            Strategy::ForkClient
        } else if client.addr.is_fd() {
            Strategy::UnixSend
        } else if listen.addr.is_fd() && listen.conn {
            Strategy::UnixDial
        } else {
            Strategy::Simple
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::ForkListenForkClient => "fork-listen-fork-client",
            Strategy::ForkListen => "fork-listen",
            Strategy::ForkClient => "fork-client",
            Strategy::UnixSend => "unix-send",
            Strategy::UnixDial => "unix-dial",
            Strategy::Simple => "simple",
        };
        f.write_str(name)
    }
}
