use std::os::fd::AsFd;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{copy_duplex, BoxedStream};
use crate::config::{ClientConfig, ListenConfig, Strategy};
use crate::error::Error;
use crate::fdpass::{self, AncillaryError};
use crate::launcher::ChildHandle;
use crate::listener::Accepted;
use crate::netns::NsDialer;
use crate::tls::server_name_for;

mod fork_both;
mod fork_client;
mod fork_listen;
mod simple;
mod unix_dial;
mod unix_send;

/// Runs the strategy selected by the configuration until cancellation or a
/// fatal error. Closing is implicit: returning drops the listener and the
/// child supervisors interrupt their processes.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    if !listen.protocol.is_stream() || !client.protocol.is_stream() {
        return Err(Error::config(
            "only stream protocols (tcp, unix) can be forwarded",
        ));
    }

    let strategy = Strategy::select(listen, client);
    debug!(%strategy, listen = %listen.addr, client = %client.addr, "starting proxy");

    match strategy {
        Strategy::Simple => simple::run(listen, client, cancel).await,
        Strategy::UnixDial => unix_dial::run(listen, client, cancel).await,
        Strategy::UnixSend => unix_send::run(listen, client, cancel).await,
        Strategy::ForkClient => fork_client::run(listen, client, cancel).await,
        Strategy::ForkListen => fork_listen::run(listen, client, cancel).await,
        Strategy::ForkListenForkClient => fork_both::run(listen, client, cancel).await,
    }
}

/// Dial side of a running strategy: namespace-aware dialer plus optional
/// TLS wrapping, shared across bridge tasks.
pub(crate) struct Upstream {
    addr: String,
    dialer: NsDialer,
    connector: Option<TlsConnector>,
    server_name: Option<ServerName<'static>>,
}

impl Upstream {
    pub(crate) fn new(client: &ClientConfig) -> Result<Self, Error> {
        let connector = client.tls.client_config()?.map(TlsConnector::from);
        let server_name = connector
            .as_ref()
            .map(|_| server_name_for(&client.addr.addr))
            .transpose()?;
        Ok(Upstream {
            addr: client.addr.addr.clone(),
            dialer: client.dialer(),
            connector,
            server_name,
        })
    }

    pub(crate) async fn connect(&self) -> Result<BoxedStream, Error> {
        let stream = self.dialer.connect(&self.addr).await?;
        match (&self.connector, &self.server_name) {
            (Some(connector), Some(name)) => {
                let tls = connector
                    .connect(name.clone(), stream.into_boxed())
                    .await
                    .map_err(|e| Error::Dial {
                        addr: self.addr.clone(),
                        source: e,
                    })?;
                Ok(Box::new(tls))
            }
            _ => Ok(stream.into_boxed()),
        }
    }
}

/// Hands an accepted connection to its own bridge task: finish the TLS
/// handshake if any, dial upstream, copy both ways. Per-connection failures
/// end that connection only.
pub(crate) fn spawn_bridge(accepted: Accepted, upstream: Arc<Upstream>) {
    tokio::spawn(async move {
        let src = match accepted.into_stream().await {
            Ok(src) => src,
            Err(e) => {
                debug!("handshake failed: {e}");
                return;
            }
        };
        let dst = match upstream.connect().await {
            Ok(dst) => dst,
            Err(e) => {
                debug!("unable to dial: {e}");
                return;
            }
        };
        if let Err(e) = copy_duplex(src, dst).await {
            debug!("copy ended with error: {e}");
        }
    });
}

/// Ships an accepted connection over the fd channel. Plain sockets travel
/// as their own descriptor; TLS connections are terminated here and the
/// plaintext side of a socketpair is shipped instead.
pub(crate) async fn send_accepted(
    channel: &UnixStream,
    accepted: Accepted,
) -> Result<(), Error> {
    match accepted {
        Accepted::Plain(plain) => {
            let fd = plain
                .into_owned_fd()
                .map_err(|e| Error::Ancillary(AncillaryError::Io(e)))?;
            fdpass::send_fd(channel, fd.as_fd()).await?;
            Ok(())
        }
        Accepted::Tls(handshake) => {
            let (ours, theirs) = crate::bridge::unix_pair()
                .map_err(|e| Error::Ancillary(AncillaryError::Io(e)))?;
            tokio::spawn(async move {
                let tls = match handshake.await {
                    Ok(tls) => tls,
                    Err(e) => {
                        debug!("handshake failed: {e}");
                        return;
                    }
                };
                if let Err(e) = copy_duplex(tls, ours).await {
                    debug!("terminated copy ended with error: {e}");
                }
            });
            fdpass::send_fd(channel, theirs.as_fd()).await?;
            drop(theirs);
            Ok(())
        }
    }
}

/// Takes over a child: waits for it and cancels the scope when it exits, or
/// interrupts and reaps it when the scope is cancelled first. Returns our
/// half of the child's socketpair and the supervisor task.
pub(crate) fn supervise_child(
    handle: ChildHandle,
    scope: CancellationToken,
    label: &'static str,
) -> (UnixStream, tokio::task::JoinHandle<Result<(), Error>>) {
    let ChildHandle {
        mut child,
        pid,
        channel,
    } = handle;

    let task = tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                scope.cancel();
                match status {
                    Ok(status) if status.success() => {
                        debug!("{label} child exited cleanly");
                        Ok(())
                    }
                    Ok(status) => Err(Error::Child(format!("{label} child exited: {status}"))),
                    Err(e) => Err(Error::Child(format!("{label} child wait: {e}"))),
                }
            }
            _ = scope.cancelled() => {
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT);
                }
                if tokio::time::timeout(std::time::Duration::from_secs(2), child.wait())
                    .await
                    .is_err()
                {
                    warn!("{label} child ignored SIGINT, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                Ok(())
            }
        }
    });

    (channel, task)
}

/// Argv for a child that receives connections on fd 3 and dials outward:
/// the other half of a fork-client pair.
pub(crate) fn unix_dial_child_args(client: &ClientConfig, netns_disable: bool) -> Vec<String> {
    let mut args = vec![
        format!("--client.addr={}", client.addr),
        "--listen.addr=FD:3".to_string(),
        "--listen.conn".to_string(),
    ];
    args.extend(client.tls.to_args("client.tls"));
    if netns_disable {
        args.push("--listen.netns.disable".to_string());
        args.push("--client.netns.disable".to_string());
    }
    args
}

/// Argv for a child that listens on the external address and ships accepted
/// connections back over fd 3: the other half of a fork-listen pair.
pub(crate) fn unix_send_child_args(listen: &ListenConfig, netns_disable: bool) -> Vec<String> {
    let mut args = vec![
        format!("--listen.addr={}", listen.addr),
        "--client.addr=FD:3".to_string(),
    ];
    args.extend(listen.tls.to_args("listen.tls"));
    if netns_disable {
        args.push("--listen.netns.disable".to_string());
        args.push("--client.netns.disable".to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Endpoint;

    #[test]
    fn child_argv_round_trips_roles() {
        let client = ClientConfig {
            addr: Endpoint::new("10.0.0.1:9001"),
            ..Default::default()
        };
        let args = unix_dial_child_args(&client, true);
        assert_eq!(args[0], "--client.addr=10.0.0.1:9001");
        assert!(args.contains(&"--listen.addr=FD:3".to_string()));
        assert!(args.contains(&"--listen.conn".to_string()));
        assert!(args.contains(&"--listen.netns.disable".to_string()));

        let listen = ListenConfig {
            addr: Endpoint::new("0.0.0.0:443"),
            ..Default::default()
        };
        let args = unix_send_child_args(&listen, false);
        assert_eq!(args[0], "--listen.addr=0.0.0.0:443");
        assert!(args.contains(&"--client.addr=FD:3".to_string()));
        assert!(!args.iter().any(|a| a.contains("netns.disable")));
    }
}
