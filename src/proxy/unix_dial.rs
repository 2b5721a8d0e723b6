use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ListenConfig};
use crate::error::Error;
use crate::fdpass::AncillaryError;
use crate::listener::ProxyListener;
use crate::proxy::{spawn_bridge, Upstream};

/// Child side of a fork-client pair: the listen endpoint is an inherited
/// UNIX socket whose accept is an fd receive; the dial side is ordinary.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let fd = listen.addr.as_file()?;
    let channel = std::os::unix::net::UnixStream::from(fd);
    channel
        .set_nonblocking(true)
        .map_err(Error::Listen)?;
    let channel = tokio::net::UnixStream::from_std(channel).map_err(Error::Listen)?;
    let mut ln = ProxyListener::from_fd_channel(channel);

    let upstream = Arc::new(Upstream::new(client)?);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = ln.accept() => match res {
                Ok(accepted) => spawn_bridge(accepted, Arc::clone(&upstream)),
                // the parent hanging up is our shutdown signal
                Err(Error::Ancillary(AncillaryError::Closed)) => return Ok(()),
                Err(Error::Ancillary(e)) => debug!("dropping connection: {e}"),
                Err(e) => return Err(e),
            },
        }
    }
}
