use std::fs::File;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use nix::sched::{setns, CloneFlags};
use socket2::{Domain, Socket, Type};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::addr::Protocol;
use crate::bridge::BoxedStream;
use crate::err;
use crate::error::Error;

/// Identifiers naming a network namespace to enter. At most one of them is
/// expected to resolve; with none set, the current namespace is used and
/// entry is a no-op.
///
/// setns(2) moves only the calling thread, so everything here is built
/// around explicit per-thread entry: `enter` hands back a guard that
/// restores the previous namespace, `change_every_thread` converts a whole
/// runtime, and `dialer` creates outbound sockets from inside the target.
#[derive(Debug, Default)]
pub struct NetnsSpec {
    pub path: Option<PathBuf>,
    pub net_name: Option<String>,
    pub docker_name: Option<String>,
    pub systemd_unit: Option<String>,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub disable: bool,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    resolved: bool,
    handle: Option<OwnedFd>,
    failure: Option<String>,
}

impl NetnsSpec {
    pub fn is_set(&self) -> bool {
        self.path.is_some()
            || self.net_name.is_some()
            || self.docker_name.is_some()
            || self.systemd_unit.is_some()
            || self.pid.is_some_and(|pid| pid > 0)
            || self.tid.is_some_and(|tid| tid > 0)
    }

    /// Moves the calling thread into the namespace. Returns `None` without
    /// switching when nothing is configured or the thread is already
    /// inside. The guard restores the previous namespace when dropped; the
    /// caller must keep the thread pinned for the guard's lifetime.
    pub fn enter(&self) -> Result<Option<NetnsGuard>, Error> {
        if self.disable || !self.is_set() {
            return Ok(None);
        }

        let mut state = self.state.lock().unwrap();
        self.resolve_locked(&mut state)?;
        let handle = state
            .handle
            .as_ref()
            .ok_or_else(|| Error::namespace("namespace handle closed"))?;

        let previous = current_thread_ns()?;
        if ns_id(previous.as_fd())? == ns_id(handle.as_fd())? {
            return Ok(None);
        }
        setns(handle.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::namespace(format!("setns: {e}")))?;
        Ok(Some(NetnsGuard {
            previous: Some(previous),
        }))
    }

    /// Like `enter` but leaves the thread switched for good. Used to
    /// convert runtime workers.
    fn enter_permanent(&self) -> Result<(), Error> {
        if self.disable || !self.is_set() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        self.resolve_locked(&mut state)?;
        let handle = state
            .handle
            .as_ref()
            .ok_or_else(|| Error::namespace("namespace handle closed"))?;
        let current = current_thread_ns()?;
        if ns_id(current.as_fd())? == ns_id(handle.as_fd())? {
            return Ok(());
        }
        setns(handle.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::namespace(format!("setns: {e}")))
    }

    /// Forces every runtime worker thread into the namespace before
    /// returning.
    ///
    /// The runtime prestarts its workers, and an outbound connection may be
    /// driven by any of them. One task per worker switches its thread and
    /// then blocks on a shared barrier; the barrier only releases once all
    /// workers report entry, so no task can observe a half-converted
    /// runtime. setns is permanent for a thread, so the workers stay
    /// converted after the tasks return.
    pub async fn change_every_thread(self: &Arc<Self>) -> Result<(), Error> {
        if self.disable || !self.is_set() {
            return Ok(());
        }

        // one fan-out at a time; two interleaved barriers would starve each
        // other of worker threads
        static CONVERSION: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());
        let _serial = CONVERSION.lock().await;

        let workers = tokio::runtime::Handle::current().metrics().num_workers();
        let barrier = Arc::new(Barrier::new(workers));
        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            let ns = Arc::clone(self);
            let barrier = Arc::clone(&barrier);
            tasks.spawn(async move {
                let res = ns.enter_permanent();
                // deliberately blocks the worker thread; every worker holds
                // here until all of them have switched
                barrier.wait();
                res
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| Error::namespace(format!("worker conversion: {e}")))??;
        }
        debug!(workers, "network namespace applied to all runtime workers");
        Ok(())
    }

    /// An outbound-connection factory that creates every socket inside the
    /// namespace.
    pub fn dialer(
        self: &Arc<Self>,
        protocol: Protocol,
        source_ip: Option<IpAddr>,
        timeout: Duration,
    ) -> NsDialer {
        NsDialer {
            netns: Arc::clone(self),
            protocol,
            source_ip,
            timeout,
        }
    }

    /// Drops the kernel handle. Any later `enter` fails.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.handle = None;
    }

    fn resolve_locked(&self, state: &mut State) -> Result<(), Error> {
        if state.resolved {
            if let Some(failure) = &state.failure {
                return Err(Error::namespace(failure.clone()));
            }
            return Ok(());
        }
        state.resolved = true;

        let mut errors = Vec::new();

        if self.pid.unwrap_or(0) < 1 {
            if let Some(unit) = &self.systemd_unit {
                match systemd_unit_main_pid(unit).and_then(|pid| open_pid_ns(pid)) {
                    Ok(handle) => {
                        state.handle = Some(handle);
                        return Ok(());
                    }
                    Err(e) => errors.push(format!("systemd.unit: {e}")),
                }
            }
        }

        if let Some(pid) = self.pid.filter(|&pid| pid > 0) {
            match open_pid_ns(pid) {
                Ok(handle) => {
                    state.handle = Some(handle);
                    return Ok(());
                }
                Err(e) => errors.push(format!("pid: {e}")),
            }

            if let Some(tid) = self.tid.filter(|&tid| tid > 0) {
                match open_ns(&PathBuf::from(format!("/proc/{pid}/task/{tid}/ns/net"))) {
                    Ok(handle) => {
                        state.handle = Some(handle);
                        return Ok(());
                    }
                    Err(e) => errors.push(format!("tid: {e}")),
                }
            }
        }

        if let Some(name) = &self.net_name {
            match open_ns(&Path::new("/run/netns").join(name)) {
                Ok(handle) => {
                    state.handle = Some(handle);
                    return Ok(());
                }
                Err(e) => errors.push(format!("net-name: {e}")),
            }
        }

        if let Some(id) = &self.docker_name {
            match docker_container_pid(id).and_then(open_pid_ns) {
                Ok(handle) => {
                    state.handle = Some(handle);
                    return Ok(());
                }
                Err(e) => errors.push(format!("docker-name: {e}")),
            }
        }

        if let Some(path) = &self.path {
            match open_ns(path) {
                Ok(handle) => {
                    state.handle = Some(handle);
                    return Ok(());
                }
                Err(e) => errors.push(format!("path: {e}")),
            }
        }

        let failure = errors.join(", ");
        state.failure = Some(failure.clone());
        Err(Error::namespace(failure))
    }
}

/// Restores the previous namespace of the entering thread on drop.
#[derive(Debug)]
pub struct NetnsGuard {
    previous: Option<OwnedFd>,
}

impl NetnsGuard {
    /// Explicit exit with error reporting; dropping the guard does the same
    /// but can only log.
    pub fn exit(mut self) -> Result<(), Error> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), Error> {
        if let Some(previous) = self.previous.take() {
            setns(previous.as_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|e| Error::namespace(format!("failed to switch back to ns: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("{e}");
        }
    }
}

fn current_thread_ns() -> Result<OwnedFd, Error> {
    open_ns(Path::new("/proc/thread-self/ns/net")).map_err(Error::Namespace)
}

fn open_ns(path: &Path) -> Result<OwnedFd, String> {
    File::open(path)
        .map(OwnedFd::from)
        .map_err(|e| format!("{}: {e}", path.display()))
}

fn open_pid_ns(pid: i32) -> Result<OwnedFd, String> {
    open_ns(&PathBuf::from(format!("/proc/{pid}/ns/net")))
}

fn ns_id(fd: BorrowedFd<'_>) -> Result<(u64, u64), Error> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    err(unsafe { libc::fstat(fd.as_raw_fd(), &mut st) })
        .map_err(|e| Error::namespace(format!("fstat ns handle: {e}")))?;
    Ok((st.st_dev, st.st_ino))
}

fn systemd_unit_main_pid(unit: &str) -> Result<i32, String> {
    let output = std::process::Command::new("systemctl")
        .args(["show", "--property=MainPID", "--value", unit])
        .output()
        .map_err(|e| format!("systemctl: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "systemctl show {unit}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|e| format!("MainPID of {unit} ({}): {e}", raw.trim()))?;
    if pid < 1 {
        return Err(format!("unit {unit} has no main pid"));
    }
    Ok(pid)
}

/// Finds a pid of the container by scanning the cgroup tree for the
/// (possibly abbreviated) container id, covering both the systemd
/// (`docker-<id>.scope`) and cgroupfs (`docker/<id>`) drivers.
fn docker_container_pid(id: &str) -> Result<i32, String> {
    let candidates = [
        ("/sys/fs/cgroup/system.slice", format!("docker-{id}")),
        ("/sys/fs/cgroup/docker", id.to_string()),
        ("/sys/fs/cgroup/pids/docker", id.to_string()),
    ];

    for (base, prefix) in &candidates {
        let entries = match std::fs::read_dir(base) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(prefix.as_str()) {
                continue;
            }
            let procs = entry.path().join("cgroup.procs");
            if let Ok(content) = std::fs::read_to_string(&procs) {
                if let Some(first) = content.lines().next() {
                    if let Ok(pid) = first.trim().parse::<i32>() {
                        return Ok(pid);
                    }
                }
            }
        }
    }
    Err(format!("no cgroup found for container {id}"))
}

/// Opens outbound connections whose sockets are created inside the target
/// namespace. The actual connect runs on a dedicated blocking thread that
/// enters before the socket syscall and leaves before handing the stream
/// back to the runtime.
#[derive(Debug, Clone)]
pub struct NsDialer {
    netns: Arc<NetnsSpec>,
    protocol: Protocol,
    source_ip: Option<IpAddr>,
    timeout: Duration,
}

impl NsDialer {
    pub async fn connect(&self, addr: &str) -> Result<DialedStream, Error> {
        match self.protocol {
            Protocol::Tcp => self.connect_tcp(addr).await.map(DialedStream::Tcp),
            Protocol::Unix => self.connect_unix(addr).await.map(DialedStream::Unix),
            other => Err(Error::config(format!(
                "cannot forward over datagram protocol {other}"
            ))),
        }
    }

    async fn connect_tcp(&self, addr: &str) -> Result<tokio::net::TcpStream, Error> {
        let netns = Arc::clone(&self.netns);
        let target = addr.to_string();
        let source_ip = self.source_ip;
        let timeout = self.timeout;

        let stream = tokio::task::spawn_blocking(move || -> Result<std::net::TcpStream, Error> {
            let guard = netns.enter()?;
            // name resolution and socket creation both happen inside the
            // namespace
            let sock_addr = resolve_one(&target)?;
            let domain = if sock_addr.is_ipv6() {
                Domain::IPV6
            } else {
                Domain::IPV4
            };
            let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| dial_error(&target, e))?;
            if let Some(ip) = source_ip {
                socket
                    .bind(&SocketAddr::new(ip, 0).into())
                    .map_err(|e| dial_error(&target, e))?;
            }
            socket
                .connect_timeout(&sock_addr.into(), timeout)
                .map_err(|e| dial_error(&target, e))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| dial_error(&target, e))?;
            if let Some(guard) = guard {
                guard.exit()?;
            }
            Ok(socket.into())
        })
        .await
        .map_err(|e| Error::Dial {
            addr: addr.to_string(),
            source: std::io::Error::other(e),
        })??;

        tokio::net::TcpStream::from_std(stream).map_err(|e| dial_error(addr, e))
    }

    async fn connect_unix(&self, addr: &str) -> Result<tokio::net::UnixStream, Error> {
        let netns = Arc::clone(&self.netns);
        let target = addr.to_string();

        let stream =
            tokio::task::spawn_blocking(move || -> Result<std::os::unix::net::UnixStream, Error> {
                // abstract unix sockets are per network namespace
                let _guard = netns.enter()?;
                let stream = std::os::unix::net::UnixStream::connect(&target)
                    .map_err(|e| dial_error(&target, e))?;
                stream
                    .set_nonblocking(true)
                    .map_err(|e| dial_error(&target, e))?;
                Ok(stream)
            })
            .await
            .map_err(|e| Error::Dial {
                addr: addr.to_string(),
                source: std::io::Error::other(e),
            })??;

        tokio::net::UnixStream::from_std(stream).map_err(|e| dial_error(addr, e))
    }
}

fn resolve_one(addr: &str) -> Result<SocketAddr, Error> {
    addr.to_socket_addrs()
        .map_err(|e| dial_error(addr, e))?
        .next()
        .ok_or_else(|| {
            dial_error(
                addr,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            )
        })
}

fn dial_error(addr: &str, source: std::io::Error) -> Error {
    Error::Dial {
        addr: addr.to_string(),
        source,
    }
}

/// An established upstream connection, before any TLS wrapping.
#[derive(Debug)]
pub enum DialedStream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

impl DialedStream {
    pub fn into_boxed(self) -> BoxedStream {
        match self {
            DialedStream::Tcp(stream) => Box::new(stream),
            DialedStream::Unix(stream) => Box::new(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_spec_never_switches() {
        let spec = NetnsSpec::default();
        assert!(!spec.is_set());
        assert!(spec.enter().unwrap().is_none());
    }

    #[test]
    fn disabled_spec_never_switches() {
        let spec = NetnsSpec {
            pid: Some(1),
            disable: true,
            ..Default::default()
        };
        assert!(spec.enter().unwrap().is_none());
    }

    #[test]
    fn resolution_failures_aggregate() {
        let spec = NetnsSpec {
            net_name: Some("no-such-netns".into()),
            path: Some("/no/such/path".into()),
            ..Default::default()
        };
        let err = spec.enter().unwrap_err().to_string();
        assert!(err.contains("net-name"), "{err}");
        assert!(err.contains("path"), "{err}");
        // failure is sticky
        assert!(spec.enter().is_err());
    }

    #[test]
    fn own_pid_resolves_to_current_ns() {
        let spec = NetnsSpec {
            pid: Some(std::process::id() as i32),
            ..Default::default()
        };
        // same namespace: resolves but no switch happens
        assert!(spec.enter().unwrap().is_none());
    }

    #[test]
    fn close_poisons_the_handle() {
        let spec = NetnsSpec {
            pid: Some(std::process::id() as i32),
            ..Default::default()
        };
        assert!(spec.enter().unwrap().is_none());
        spec.close();
        assert!(spec.enter().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn change_every_thread_with_current_ns_is_a_noop() {
        let spec = Arc::new(NetnsSpec {
            pid: Some(std::process::id() as i32),
            ..Default::default()
        });
        spec.change_every_thread().await.unwrap();
    }
}
