use std::os::fd::AsFd;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ClientConfig, ListenConfig};
use crate::error::Error;
use crate::fdpass::{self, AncillaryError};
use crate::launcher::spawn_child;
use crate::proxy::{supervise_child, unix_dial_child_args, unix_send_child_args};

/// Both sides isolated: a listen child accepts and ships descriptors, a
/// client child receives them and dials. The parent only shuttles
/// ancillary messages between the two socketpairs.
pub async fn run(
    listen: &ListenConfig,
    client: &ClientConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let scope = cancel.child_token();

    let listen_child = spawn_child(
        &listen.user,
        &listen.netns,
        unix_send_child_args(listen, true),
    )
    .await?;
    let (listen_channel, listen_supervisor) = supervise_child(listen_child, scope.clone(), "listen");

    let client_child = match spawn_child(
        &client.user,
        &client.netns,
        unix_dial_child_args(client, true),
    )
    .await
    {
        Ok(child) => child,
        Err(e) => {
            scope.cancel();
            let _ = listen_supervisor.await;
            return Err(e);
        }
    };
    let (client_channel, client_supervisor) = supervise_child(client_child, scope.clone(), "client");

    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            received = fdpass::recv_fd(&listen_channel) => match received {
                Ok(fd) => match fdpass::send_fd(&client_channel, fd.as_fd()).await {
                    Ok(()) => {}
                    Err(AncillaryError::Closed) => break,
                    Err(e) => debug!("dropping connection: {e}"),
                },
                Err(AncillaryError::Closed) => break,
                Err(e) => {
                    result = Err(Error::Ancillary(e));
                    break;
                }
            },
        }
    }

    scope.cancel();
    let listen_result = listen_supervisor
        .await
        .unwrap_or_else(|e| Err(Error::Child(format!("supervisor: {e}"))));
    let client_result = client_supervisor
        .await
        .unwrap_or_else(|e| Err(Error::Child(format!("supervisor: {e}"))));
    result.and(listen_result).and(client_result)
}
