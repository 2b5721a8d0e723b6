use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, ListenConfig};
use crate::error::Error;
use crate::listener::ProxyListener;
use crate::proxy::{spawn_bridge, Upstream};

/// Accept locally, dial upstream, bridge. The baseline everything else is a
/// variation of.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut ln = ProxyListener::bind(listen).await?;

    // outbound connections may be driven by any runtime worker, so the
    // whole runtime joins the client namespace up front
    client.netns.change_every_thread().await?;
    listen.user.switch()?;

    let upstream = Arc::new(Upstream::new(client)?);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = ln.accept() => match res {
                Ok(accepted) => spawn_bridge(accepted, Arc::clone(&upstream)),
                Err(e) => return Err(e),
            },
        }
    }
}
