use std::os::fd::AsFd;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};

use nspipe::fdpass::{recv_fd, send_fd};
use nspipe::listener::stream_from_fd;

const PAYLOAD: &[u8] = b"hello there";

#[tokio::test]
async fn fd_passthrough() {
    let (left, right) = UnixStream::pair().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let consumer = tokio::spawn(async move {
        // accept one connection and hand its descriptor across the pair
        let (conn, _) = listener.accept().await.unwrap();
        let fd: std::os::fd::OwnedFd = conn.into_std().unwrap().into();
        send_fd(&left, fd.as_fd()).await.unwrap();
        drop(fd);

        // re-open it on the other side and read what the dialer wrote
        let received = recv_fd(&right).await.unwrap();
        let mut stream = stream_from_fd(received).unwrap().into_boxed();
        let mut buf = vec![0u8; PAYLOAD.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, PAYLOAD);
    });

    let mut dialer = TcpStream::connect(addr).await.unwrap();
    dialer.write_all(PAYLOAD).await.unwrap();

    consumer.await.unwrap();
}

#[tokio::test]
async fn fd_forwarded_across_two_channels() {
    // the shape of the fork-listen-fork-client relay: a descriptor received
    // on one channel is re-sent on another, ancillary data only
    let (send_half, recv_half) = UnixStream::pair().unwrap();
    let (fwd_in, fwd_out) = UnixStream::pair().unwrap();

    let relay = tokio::spawn(async move {
        loop {
            let fd = match recv_fd(&recv_half).await {
                Ok(fd) => fd,
                Err(_) => return,
            };
            if send_fd(&fwd_in, fd.as_fd()).await.is_err() {
                return;
            }
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let consumer = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let fd: std::os::fd::OwnedFd = conn.into_std().unwrap().into();
        send_fd(&send_half, fd.as_fd()).await.unwrap();
        drop(fd);

        let received = recv_fd(&fwd_out).await.unwrap();
        let mut stream = stream_from_fd(received).unwrap().into_boxed();
        let mut buf = vec![0u8; PAYLOAD.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, PAYLOAD);
        drop(send_half);
    });

    let mut dialer = TcpStream::connect(addr).await.unwrap();
    dialer.write_all(PAYLOAD).await.unwrap();

    consumer.await.unwrap();
    relay.await.unwrap();
}
