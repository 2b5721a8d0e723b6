//! Listener takeover following the systemd socket-activation convention:
//! `LISTEN_FDS` descriptors starting at fd 3, valid only when `LISTEN_PID`
//! matches our own pid. `FIX_LISTEN_PID=1` rewrites `LISTEN_PID` on entry,
//! because a parent that clones us cannot know the child pid in advance.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::unistd::getpid;

use crate::error::Error;
use crate::set_cloexec;

pub const LISTEN_FDS_START: RawFd = 3;

/// Claims inherited descriptor `fd` from the activation environment.
///
/// The environment is only consulted, never consumed: a process may hold
/// several activated sockets and claim them one by one.
pub fn take_fd(fd: RawFd) -> Result<OwnedFd, Error> {
    if std::env::var_os("FIX_LISTEN_PID").is_some_and(|v| !v.is_empty()) {
        std::env::set_var("LISTEN_PID", getpid().to_string());
    }

    let pid: i32 = match std::env::var("LISTEN_PID") {
        Ok(v) => v
            .parse()
            .map_err(|e| Error::config(format!("bad LISTEN_PID {v:?}: {e}")))?,
        Err(_) => return Err(Error::config("LISTEN_PID not set")),
    };
    if pid != getpid().as_raw() {
        return Err(Error::config(format!(
            "LISTEN_PID {pid} is not us ({})",
            getpid()
        )));
    }

    let nfds: i32 = match std::env::var("LISTEN_FDS") {
        Ok(v) => v
            .parse()
            .map_err(|e| Error::config(format!("bad LISTEN_FDS {v:?}: {e}")))?,
        Err(_) => return Err(Error::config("LISTEN_FDS not set")),
    };
    // fd == 3 needs one descriptor, fd == 4 needs two, ...
    if nfds < fd - LISTEN_FDS_START + 1 {
        return Err(Error::config(format!(
            "not enough fds from activation, got {nfds} wanted {}",
            fd - LISTEN_FDS_START + 1
        )));
    }

    set_cloexec(fd).map_err(|e| Error::config(format!("cloexec on fd {fd}: {e}")))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
