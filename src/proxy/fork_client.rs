use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ListenConfig};
use crate::error::Error;
use crate::fdpass::AncillaryError;
use crate::launcher::spawn_child;
use crate::listener::ProxyListener;
use crate::proxy::{send_accepted, supervise_child, unix_dial_child_args};

/// Listen here, dial in an isolated child: accepted descriptors travel to a
/// child that connects outward from its own namespaces.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut ln = ProxyListener::bind(listen).await?;

    let scope = cancel.child_token();
    let child = spawn_child(
        &client.user,
        &client.netns,
        unix_dial_child_args(client, false),
    )
    .await?;
    let (channel, supervisor) = supervise_child(child, scope.clone(), "client");

    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            res = ln.accept() => match res {
                Ok(accepted) => match send_accepted(&channel, accepted).await {
                    Ok(()) => {}
                    Err(Error::Ancillary(AncillaryError::Closed)) => break,
                    Err(e) => debug!("dropping connection: {e}"),
                },
                Err(e) => {
                    result = Err(e);
                    break;
                }
            },
        }
    }
    drop(ln);

    scope.cancel();
    let child_result = supervisor
        .await
        .unwrap_or_else(|e| Err(Error::Child(format!("supervisor: {e}"))));
    result.and(child_result)
}
