use std::os::fd::OwnedFd;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Object-safe alias for anything we can forward: plain TCP, unix stream,
/// TLS-wrapped, or a re-opened received descriptor.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Copies bytes both ways until both directions have seen EOF, then returns
/// the transferred byte counts.
///
/// When one direction hits EOF, the opposite side gets a write shutdown
/// (SHUT_WR on sockets, close_notify on TLS) so an idle peer observes
/// end-of-stream and may drain the other direction. Both streams are closed
/// when the call returns and the halves drop.
pub async fn copy_duplex<A, B>(a: A, b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = async {
        let n = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        n
    };
    let backward = async {
        let n = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        n
    };

    let (sent, received) = tokio::join!(forward, backward);
    Ok((sent?, received?))
}

/// A connected socketpair: one end stays in this process as an async
/// stream, the other is an owned descriptor ready to ship elsewhere.
pub fn unix_pair() -> std::io::Result<(tokio::net::UnixStream, OwnedFd)> {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
    ours.set_nonblocking(true)?;
    Ok((tokio::net::UnixStream::from_std(ours)?, OwnedFd::from(theirs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_cross_both_ways_and_half_close_propagates() {
        let (a_local, a_remote) = tokio::net::UnixStream::pair().unwrap();
        let (b_local, b_remote) = tokio::net::UnixStream::pair().unwrap();

        let bridge = tokio::spawn(copy_duplex(a_remote, b_remote));

        let (mut client, mut upstream) = (a_local, b_local);
        client.write_all(b"hello there").await.unwrap();
        client.shutdown().await.unwrap();

        // upstream sees the payload, then EOF
        let mut buf = vec![0u8; 32];
        let n = upstream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello there");
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);

        // and the reverse direction still works after the half-close
        upstream.write_all(b"general kenobi").await.unwrap();
        upstream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"general kenobi");

        let (sent, received) = bridge.await.unwrap().unwrap();
        assert_eq!(sent, 11);
        assert_eq!(received, 14);
    }

    #[tokio::test]
    async fn large_payload_is_byte_exact() {
        let (a_local, a_remote) = tokio::net::UnixStream::pair().unwrap();
        let (b_local, b_remote) = tokio::net::UnixStream::pair().unwrap();
        tokio::spawn(copy_duplex(a_remote, b_remote));

        let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let expect = payload.clone();
        let mut writer = a_local;
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut got = Vec::new();
        let mut reader = b_local;
        reader.read_to_end(&mut got).await.unwrap();
        write.await.unwrap();
        assert_eq!(got, expect);
    }
}
