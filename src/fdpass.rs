//! Descriptor passing over a UNIX stream socket: one SCM_RIGHTS control
//! message per descriptor, no payload bytes. The kernel duplicates the
//! descriptor at send time, so the sender may close its copy as soon as
//! `send_fd` returns.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg,
};
use tokio::io::Interest;
use tokio::net::UnixStream;

#[derive(Debug, thiserror::Error)]
pub enum AncillaryError {
    /// Peer closed the channel; on a strategy's fd channel this means the
    /// other process is gone.
    #[error("fd channel closed by peer")]
    Closed,

    #[error("expected exactly one control message, got {0}")]
    WrongControlCount(usize),

    #[error("control message carried no usable descriptor")]
    ParseRightsFailed,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Ships one descriptor. The message has no data payload, so the kernel
/// reports zero bytes sent on success.
pub async fn send_fd(channel: &UnixStream, fd: BorrowedFd<'_>) -> Result<(), AncillaryError> {
    let raw = fd.as_raw_fd();
    loop {
        channel.writable().await?;
        let res = channel.try_io(Interest::WRITABLE, || {
            let fds = [raw];
            let cmsgs = [ControlMessage::ScmRights(&fds)];
            let iov: [IoSlice; 0] = [];
            match sendmsg::<()>(
                channel.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                None,
            ) {
                Ok(_) => Ok(()),
                Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32)),
            }
        });
        match res {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.raw_os_error() == Some(Errno::EPIPE as i32) => {
                return Err(AncillaryError::Closed)
            }
            Err(e) => return Err(AncillaryError::Io(e)),
        }
    }
}

/// Receives one descriptor. The control buffer is sized for a single fd
/// and the data buffer for nothing at all: recvmsg returning zero bytes
/// with a valid rights message is the normal case, zero bytes with no
/// control message is the peer hanging up.
pub async fn recv_fd(channel: &UnixStream) -> Result<OwnedFd, AncillaryError> {
    loop {
        channel.readable().await?;
        let res = channel.try_io(Interest::READABLE, || {
            let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
            let mut iov: [IoSliceMut; 0] = [];
            match recvmsg::<()>(
                channel.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => Ok(parse_single_fd(msg)),
                Err(errno) => Err(std::io::Error::from_raw_os_error(errno as i32)),
            }
        });
        match res {
            Ok(outcome) => return outcome,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(AncillaryError::Io(e)),
        }
    }
}

fn parse_single_fd(msg: RecvMsg<'_, '_, ()>) -> Result<OwnedFd, AncillaryError> {
    let cmsgs: Vec<ControlMessageOwned> = msg
        .cmsgs()
        .map_err(|e| AncillaryError::Io(std::io::Error::from_raw_os_error(e as i32)))?
        .collect();

    if cmsgs.is_empty() {
        return Err(AncillaryError::Closed);
    }
    if cmsgs.len() != 1 {
        return Err(AncillaryError::WrongControlCount(cmsgs.len()));
    }

    match &cmsgs[0] {
        ControlMessageOwned::ScmRights(fds) if fds.len() == 1 => {
            Ok(unsafe { OwnedFd::from_raw_fd(fds[0]) })
        }
        ControlMessageOwned::ScmRights(fds) => {
            // close stray descriptors instead of leaking them
            for &fd in fds.iter() {
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            Err(AncillaryError::ParseRightsFailed)
        }
        _ => Err(AncillaryError::ParseRightsFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn descriptor_crosses_the_pair() {
        let (left, right) = UnixStream::pair().unwrap();
        let (mut payload_in, payload_out) = tokio::net::UnixStream::pair().unwrap();

        let payload_out = payload_out.into_std().unwrap();
        send_fd(&left, payload_out.as_fd()).await.unwrap();
        drop(payload_out);

        let received = recv_fd(&right).await.unwrap();
        let received = std::os::unix::net::UnixStream::from(received);
        received.set_nonblocking(true).unwrap();
        let mut received = tokio::net::UnixStream::from_std(received).unwrap();

        payload_in.write_all(b"hello there").await.unwrap();
        payload_in.shutdown().await.unwrap();
        let mut got = Vec::new();
        received.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello there");
    }

    #[tokio::test]
    async fn closed_peer_reports_closed() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(left);
        match recv_fd(&right).await {
            Err(AncillaryError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }
}
