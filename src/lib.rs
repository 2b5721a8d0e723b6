use nix::errno::Errno;
use std::os::fd::RawFd;

pub mod addr;
pub mod bridge;
pub mod cloneflags;
pub mod config;
pub mod error;
pub mod fdpass;
pub mod kernel;
pub mod launcher;
pub mod listener;
pub mod netns;
pub mod proxy;
pub mod sockact;
pub mod tls;
pub mod user;

pub use error::Error;

/// Maps a raw libc return value to the current errno.
pub fn err<T: IsMinusOne>(ret: T) -> nix::Result<T> {
    if ret.is_minus_one() {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

pub trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for i64 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for i32 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    err(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

pub fn unset_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    err(unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) })?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    err(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// SO_DOMAIN of a socket fd: AF_INET, AF_INET6 or AF_UNIX.
pub fn socket_domain(fd: RawFd) -> nix::Result<libc::c_int> {
    let mut domain: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    err(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_DOMAIN,
            &mut domain as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(domain)
}
