use std::os::fd::{AsFd, IntoRawFd};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use nspipe::addr::Endpoint;
use nspipe::config::{ClientConfig, ListenConfig, Strategy};
use nspipe::fdpass::{recv_fd, send_fd};
use nspipe::listener::stream_from_fd;
use nspipe::proxy;

const PAYLOAD: &[u8] = b"hello there";

/// The unix-send role: accept TCP locally, ship each accepted descriptor to
/// a harness playing the parent on the other end of the channel.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unix_send_ships_accepted_fds() {
    // channel the strategy will see as its inherited client fd
    let (harness_end, strategy_end) = std::os::unix::net::UnixStream::pair().unwrap();
    harness_end.set_nonblocking(true).unwrap();
    let harness_end = tokio::net::UnixStream::from_std(harness_end).unwrap();
    let channel_fd = strategy_end.into_raw_fd();

    // pre-bound listener handed over as an activated fd
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let listen_fd = listener.into_raw_fd();
    std::env::set_var("LISTEN_PID", std::process::id().to_string());
    std::env::set_var("LISTEN_FDS", (listen_fd - 2).to_string());
    std::env::remove_var("FIX_LISTEN_PID");

    let listen = ListenConfig {
        addr: Endpoint::new(format!("FD:{listen_fd}")),
        ..Default::default()
    };
    let client = ClientConfig {
        addr: Endpoint::new(format!("FD:{channel_fd}")),
        ..Default::default()
    };
    assert_eq!(Strategy::select(&listen, &client), Strategy::UnixSend);

    let cancel = CancellationToken::new();
    let proxy_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { proxy::run(&listen, &client, cancel).await })
    };

    let mut conn = tokio::net::TcpStream::connect(listen_addr).await.unwrap();
    conn.write_all(PAYLOAD).await.unwrap();

    // the harness receives the very connection that was just accepted
    let received = recv_fd(&harness_end).await.unwrap();
    let mut stream = stream_from_fd(received).unwrap().into_boxed();
    let mut buf = vec![0u8; PAYLOAD.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, PAYLOAD);

    // and it is live in both directions
    stream.write_all(b"roger").await.unwrap();
    let mut reply = vec![0u8; 5];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"roger");

    cancel.cancel();
    proxy_task.await.unwrap().unwrap();
}

/// The unix-dial role: receive accepted descriptors over the inherited
/// channel, dial upstream for each and bridge.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unix_dial_bridges_received_fds() {
    let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match echo.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });

    let (harness_end, strategy_end) = std::os::unix::net::UnixStream::pair().unwrap();
    harness_end.set_nonblocking(true).unwrap();
    let harness_end = tokio::net::UnixStream::from_std(harness_end).unwrap();
    let channel_fd = strategy_end.into_raw_fd();

    let listen = ListenConfig {
        addr: Endpoint::new(format!("FD:{channel_fd}")),
        conn: true,
        ..Default::default()
    };
    let client = ClientConfig {
        addr: Endpoint::new(echo_addr.to_string()),
        ..Default::default()
    };
    assert_eq!(Strategy::select(&listen, &client), Strategy::UnixDial);

    let cancel = CancellationToken::new();
    let proxy_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { proxy::run(&listen, &client, cancel).await })
    };

    // fabricate an "accepted" TCP connection and pass its server half in
    let external = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let external_addr = external.local_addr().unwrap();
    let (mut app, accepted) = tokio::join!(
        async { tokio::net::TcpStream::connect(external_addr).await.unwrap() },
        async { external.accept().await.unwrap().0 }
    );
    let accepted: std::os::fd::OwnedFd = accepted.into_std().unwrap().into();
    send_fd(&harness_end, accepted.as_fd()).await.unwrap();
    drop(accepted);

    app.write_all(PAYLOAD).await.unwrap();
    app.shutdown().await.unwrap();
    let mut reply = Vec::new();
    app.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, PAYLOAD);

    // dropping our end of the channel is the child's shutdown signal
    drop(harness_end);
    proxy_task.await.unwrap().unwrap();
    cancel.cancel();
}
