use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ListenConfig};
use crate::error::Error;
use crate::fdpass::AncillaryError;
use crate::listener::ProxyListener;
use crate::proxy::send_accepted;

/// Child side of a fork-listen pair: accept (and terminate TLS) here, ship
/// every connection to the parent over the inherited UNIX socket.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut ln = ProxyListener::bind(listen).await?;
    listen.user.switch()?;

    let fd = client.addr.as_file()?;
    let channel = std::os::unix::net::UnixStream::from(fd);
    channel
        .set_nonblocking(true)
        .map_err(|e| Error::Ancillary(AncillaryError::Io(e)))?;
    let channel =
        tokio::net::UnixStream::from_std(channel).map_err(|e| Error::Ancillary(AncillaryError::Io(e)))?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = ln.accept() => match res {
                Ok(accepted) => match send_accepted(&channel, accepted).await {
                    Ok(()) => {}
                    Err(Error::Ancillary(AncillaryError::Closed)) => return Ok(()),
                    Err(e) => debug!("dropping connection: {e}"),
                },
                Err(e) => return Err(e),
            },
        }
    }
}
