use std::os::fd::{AsRawFd, RawFd};
use std::process::Stdio;
use std::sync::Arc;

use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::cloneflags::{CloneFlag, CloneFlagsBuilder};
use crate::err;
use crate::error::Error;
use crate::netns::NetnsSpec;
use crate::user::UserSpec;

/// The single descriptor a child inherits beyond stdio: either its listener
/// or the fd-passing channel to us.
pub const CHILD_CHANNEL_FD: RawFd = 3;

/// A spawned child plus our half of its socketpair. The pid is kept
/// separately so the child can be signalled while a wait is in flight.
pub struct ChildHandle {
    pub child: Child,
    pub pid: Option<Pid>,
    pub channel: tokio::net::UnixStream,
}

/// Re-invokes the current executable with `args` in a fresh set of
/// namespaces, handing it one half of a socketpair as fd 3 and returning
/// the other half. The caller owns waiting on the child and folding its
/// exit into the surrounding cancellation scope.
pub async fn spawn_child(
    user: &UserSpec,
    netns: &Arc<NetnsSpec>,
    args: Vec<String>,
) -> Result<ChildHandle, Error> {
    let (uid, gid) = user.lookup()?;

    let mut builder = CloneFlagsBuilder::new()?;
    builder
        .enable(CloneFlag::PrivateMounts)
        .enable(CloneFlag::PrivatePid)
        .enable(CloneFlag::PrivateUts)
        .enable(CloneFlag::PrivateIpc)
        .enable(CloneFlag::PrivateClock)
        .enable(CloneFlag::PrivateCgroup);
    // only root can keep its privileges through a user namespace
    if uid == 0 && gid == 0 {
        builder.enable(CloneFlag::PrivateUsers);
    }
    // CLONE_SETTLS hangs the child, keep it off
    let flags = builder.commit()?;

    let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()
        .map_err(|e| Error::Child(format!("socketpair: {e}")))?;

    let exe =
        std::env::current_exe().map_err(|e| Error::Child(format!("current executable: {e}")))?;
    debug!(?exe, ?args, "spawning child");

    let mut cmd = Command::new(exe);
    cmd.args(&args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .env_clear()
        .env("LISTEN_FDS", "1")
        .env("LISTEN_FDNAMES", "connection")
        // the real pid is unknowable before the clone; the child repairs it
        .env("LISTEN_PID", "0")
        .env("FIX_LISTEN_PID", "1");
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }

    let child_raw = child_end.as_raw_fd();
    let unshare_flags = flags.unshare_flags();
    unsafe {
        cmd.pre_exec(move || {
            // between fork and exec: isolate while still privileged, wire
            // our half of the socketpair to the conventional descriptor,
            // then drop credentials (uid strictly last)
            err(libc::unshare(unshare_flags)).map_err(errno_to_io)?;
            if child_raw == CHILD_CHANNEL_FD {
                err(libc::fcntl(CHILD_CHANNEL_FD, libc::F_SETFD, 0)).map_err(errno_to_io)?;
            } else {
                // dup2 leaves CLOEXEC clear on the new descriptor
                err(libc::dup2(child_raw, CHILD_CHANNEL_FD)).map_err(errno_to_io)?;
            }
            if gid > 0 {
                err(libc::setgroups(0, std::ptr::null())).map_err(errno_to_io)?;
                err(libc::setgid(gid)).map_err(errno_to_io)?;
            }
            if uid > 0 {
                err(libc::setuid(uid)).map_err(errno_to_io)?;
            }
            Ok(())
        });
    }

    // the child inherits the network namespace of the forking thread, so
    // enter it for exactly the duration of the spawn
    let netns = Arc::clone(netns);
    let child = tokio::task::spawn_blocking(move || -> Result<Child, Error> {
        let guard = netns.enter()?;
        let child = cmd
            .spawn()
            .map_err(|e| Error::Child(format!("unable to start process: {e}")))?;
        drop(child_end);
        if let Some(guard) = guard {
            guard.exit()?;
        }
        Ok(child)
    })
    .await
    .map_err(|e| Error::Child(format!("spawn task: {e}")))??;

    let pid = child.id().map(|id| Pid::from_raw(id as i32));

    parent_end
        .set_nonblocking(true)
        .map_err(|e| Error::Child(format!("channel: {e}")))?;
    let channel = tokio::net::UnixStream::from_std(parent_end)
        .map_err(|e| Error::Child(format!("channel: {e}")))?;

    Ok(ChildHandle { child, pid, channel })
}

fn errno_to_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
