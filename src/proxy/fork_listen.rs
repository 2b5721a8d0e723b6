use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ListenConfig};
use crate::error::Error;
use crate::fdpass::AncillaryError;
use crate::launcher::spawn_child;
use crate::listener::ProxyListener;
use crate::proxy::{spawn_bridge, supervise_child, unix_send_child_args, Upstream};

/// Accept in an isolated child, dial here: the child listens on the
/// external address and ships each accepted descriptor back over the
/// socketpair.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let scope = cancel.child_token();
    let child = spawn_child(
        &listen.user,
        &listen.netns,
        unix_send_child_args(listen, false),
    )
    .await?;
    let (channel, supervisor) = supervise_child(child, scope.clone(), "listen");
    let mut ln = ProxyListener::from_fd_channel(channel);

    client.netns.change_every_thread().await?;
    let upstream = Arc::new(Upstream::new(client)?);

    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            res = ln.accept() => match res {
                Ok(accepted) => spawn_bridge(accepted, Arc::clone(&upstream)),
                Err(Error::Ancillary(AncillaryError::Closed)) => break,
                Err(Error::Ancillary(e)) => debug!("dropping connection: {e}"),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            },
        }
    }

    scope.cancel();
    let child_result = supervisor
        .await
        .unwrap_or_else(|e| Err(Error::Child(format!("supervisor: {e}"))));
    result.and(child_result)
}
