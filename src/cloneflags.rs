use crate::error::Error;
use crate::kernel::KernelVersion;

// clone3-era bits beyond the c_int range of the classic flags
const CLONE_CLEAR_SIGHAND: u64 = 0x1_0000_0000;
const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;
// new time namespace, added with clone3 but also valid for unshare(2)
const CLONE_NEWTIME: u64 = 0x0000_0080;

/// One candidate `CLONE_*` flag. Naming follows what each flag does to the
/// child rather than the kernel constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneFlag {
    ShareVirtualMemory,
    ShareFsInfo,
    ShareFiles,
    ProtectSignals,
    AllowPtrace,
    SetVfork,
    SetPpid,
    SetThread,
    PrivateMounts,
    SetSystemV,
    ParentPidfd,
    PrivateTls,
    ParentTid,
    ClearTid,
    DisablePtrace,
    CloneTid,
    PrivateCgroup,
    PrivateUts,
    PrivateIpc,
    PrivateUsers,
    PrivatePid,
    PrivateNetwork,
    PrivateIo,
    ResetSignals,
    JoinCgroup,
    PrivateClock,
}

impl CloneFlag {
    pub fn bit(self) -> u64 {
        use CloneFlag::*;
        match self {
            ShareVirtualMemory => libc::CLONE_VM as u64,
            ShareFsInfo => libc::CLONE_FS as u64,
            ShareFiles => libc::CLONE_FILES as u64,
            ProtectSignals => libc::CLONE_SIGHAND as u64,
            AllowPtrace => libc::CLONE_PTRACE as u64,
            SetVfork => libc::CLONE_VFORK as u64,
            SetPpid => libc::CLONE_PARENT as u64,
            SetThread => libc::CLONE_THREAD as u64,
            PrivateMounts => libc::CLONE_NEWNS as u64,
            SetSystemV => libc::CLONE_SYSVSEM as u64,
            ParentPidfd => libc::CLONE_PIDFD as u64,
            PrivateTls => libc::CLONE_SETTLS as u64,
            ParentTid => libc::CLONE_PARENT_SETTID as u64,
            ClearTid => libc::CLONE_CHILD_CLEARTID as u64,
            DisablePtrace => libc::CLONE_UNTRACED as u64,
            CloneTid => libc::CLONE_CHILD_SETTID as u64,
            PrivateCgroup => libc::CLONE_NEWCGROUP as u64,
            PrivateUts => libc::CLONE_NEWUTS as u64,
            PrivateIpc => libc::CLONE_NEWIPC as u64,
            PrivateUsers => libc::CLONE_NEWUSER as u64,
            PrivatePid => libc::CLONE_NEWPID as u64,
            PrivateNetwork => libc::CLONE_NEWNET as u64,
            PrivateIo => libc::CLONE_IO as u64,
            ResetSignals => CLONE_CLEAR_SIGHAND,
            JoinCgroup => CLONE_INTO_CGROUP,
            PrivateClock => CLONE_NEWTIME,
        }
    }

    pub fn name(self) -> &'static str {
        use CloneFlag::*;
        match self {
            ShareVirtualMemory => "CLONE_VM",
            ShareFsInfo => "CLONE_FS",
            ShareFiles => "CLONE_FILES",
            ProtectSignals => "CLONE_SIGHAND",
            AllowPtrace => "CLONE_PTRACE",
            SetVfork => "CLONE_VFORK",
            SetPpid => "CLONE_PARENT",
            SetThread => "CLONE_THREAD",
            PrivateMounts => "CLONE_NEWNS",
            SetSystemV => "CLONE_SYSVSEM",
            ParentPidfd => "CLONE_PIDFD",
            PrivateTls => "CLONE_SETTLS",
            ParentTid => "CLONE_PARENT_SETTID",
            ClearTid => "CLONE_CHILD_CLEARTID",
            DisablePtrace => "CLONE_UNTRACED",
            CloneTid => "CLONE_CHILD_SETTID",
            PrivateCgroup => "CLONE_NEWCGROUP",
            PrivateUts => "CLONE_NEWUTS",
            PrivateIpc => "CLONE_NEWIPC",
            PrivateUsers => "CLONE_NEWUSER",
            PrivatePid => "CLONE_NEWPID",
            PrivateNetwork => "CLONE_NEWNET",
            PrivateIo => "CLONE_IO",
            ResetSignals => "CLONE_CLEAR_SIGHAND",
            JoinCgroup => "CLONE_INTO_CGROUP",
            PrivateClock => "CLONE_NEWTIME",
        }
    }

    fn since(self) -> KernelVersion {
        use CloneFlag::*;
        match self {
            ShareVirtualMemory | ShareFsInfo | ShareFiles | ProtectSignals => {
                KernelVersion::new(2, 0, 0)
            }
            AllowPtrace | SetVfork => KernelVersion::new(2, 2, 0),
            SetPpid => KernelVersion::new(2, 3, 12),
            SetThread => KernelVersion::new(2, 4, 0),
            PrivateMounts => KernelVersion::new(2, 4, 19),
            SetSystemV => KernelVersion::new(2, 5, 10),
            PrivateTls => KernelVersion::new(2, 5, 32),
            DisablePtrace => KernelVersion::new(2, 5, 46),
            ParentTid | ClearTid | CloneTid => KernelVersion::new(2, 5, 49),
            PrivateUts | PrivateIpc => KernelVersion::new(2, 6, 19),
            // before 3.8, CLONE_NEWUSER additionally required CAP_SYS_ADMIN,
            // CAP_SETUID and CAP_SETGID
            PrivateUsers => KernelVersion::new(2, 6, 23),
            PrivatePid | PrivateNetwork => KernelVersion::new(2, 6, 24),
            PrivateIo => KernelVersion::new(2, 6, 25),
            PrivateCgroup => KernelVersion::new(4, 6, 0),
            ParentPidfd => KernelVersion::new(5, 2, 0),
            ResetSignals => KernelVersion::new(5, 5, 0),
            PrivateClock => KernelVersion::new(5, 6, 0),
            JoinCgroup => KernelVersion::new(5, 7, 0),
        }
    }

    fn requires(self) -> &'static [CloneFlag] {
        use CloneFlag::*;
        match self {
            ProtectSignals | CloneTid => &[ShareVirtualMemory],
            SetThread => &[ProtectSignals, ShareVirtualMemory],
            _ => &[],
        }
    }

    fn conflicts(self) -> &'static [CloneFlag] {
        use CloneFlag::*;
        match self {
            ResetSignals => &[ProtectSignals],
            PrivateIpc => &[SetSystemV],
            // it is not permitted to specify both CLONE_NEWNS and CLONE_FS
            // in the same clone call
            PrivateMounts => &[ShareFsInfo],
            // CLONE_NEWPID can't be combined with CLONE_THREAD or
            // CLONE_PARENT; CLONE_NEWUSER additionally not with CLONE_FS
            PrivatePid => &[SetThread, SetPpid],
            PrivateUsers => &[SetThread, SetPpid, ShareFsInfo],
            _ => &[],
        }
    }

    fn all() -> &'static [CloneFlag] {
        use CloneFlag::*;
        &[
            ShareVirtualMemory,
            ShareFsInfo,
            ShareFiles,
            ProtectSignals,
            AllowPtrace,
            SetVfork,
            SetPpid,
            SetThread,
            PrivateMounts,
            SetSystemV,
            ParentPidfd,
            PrivateTls,
            ParentTid,
            ClearTid,
            DisablePtrace,
            CloneTid,
            PrivateCgroup,
            PrivateUts,
            PrivateIpc,
            PrivateUsers,
            PrivatePid,
            PrivateNetwork,
            PrivateIo,
            ResetSignals,
            JoinCgroup,
            PrivateClock,
        ]
    }
}

/// Builder over the `CLONE_*` flag set. Each enabled flag is checked on
/// commit against the running kernel version, the flags it requires and the
/// flags it conflicts with; violations accumulate instead of failing fast.
#[derive(Debug, Clone)]
pub struct CloneFlagsBuilder {
    kernel: KernelVersion,
    enabled: Vec<CloneFlag>,
}

impl CloneFlagsBuilder {
    pub fn new() -> Result<Self, Error> {
        Ok(Self::with_kernel(KernelVersion::current()?))
    }

    pub fn with_kernel(kernel: KernelVersion) -> Self {
        CloneFlagsBuilder {
            kernel,
            enabled: Vec::new(),
        }
    }

    pub fn enable(&mut self, flag: CloneFlag) -> &mut Self {
        if !self.enabled.contains(&flag) {
            self.enabled.push(flag);
        }
        self
    }

    pub fn commit(&self) -> Result<CloneFlagSet, Error> {
        let mut violations = Vec::new();

        for &flag in &self.enabled {
            let since = flag.since();
            if !self.kernel.at_least(since) {
                violations.push(format!(
                    "clone flag {} requires kernel {since}, but running {}",
                    flag.name(),
                    self.kernel
                ));
            }
            for &required in flag.requires() {
                if !self.enabled.contains(&required) {
                    violations.push(format!(
                        "clone flag {} requires {}",
                        flag.name(),
                        required.name()
                    ));
                }
            }
            for &conflict in flag.conflicts() {
                if self.enabled.contains(&conflict) {
                    violations.push(format!(
                        "clone flag {} conflicts with {}",
                        flag.name(),
                        conflict.name()
                    ));
                }
            }
        }

        if !violations.is_empty() {
            return Err(Error::Config(violations.join(", ")));
        }

        let bits = self.enabled.iter().fold(0u64, |acc, f| acc | f.bit());
        Ok(CloneFlagSet { bits })
    }
}

/// A validated flag combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneFlagSet {
    bits: u64,
}

impl CloneFlagSet {
    pub fn bits(self) -> u64 {
        self.bits
    }

    pub fn contains(self, flag: CloneFlag) -> bool {
        self.bits & flag.bit() != 0
    }

    /// The subset of these flags that unshare(2) accepts. Sharing flags and
    /// tid bookkeeping only exist at clone time.
    pub fn unshare_flags(self) -> libc::c_int {
        let valid = CloneFlag::all()
            .iter()
            .filter(|f| {
                use CloneFlag::*;
                matches!(
                    f,
                    ShareFiles
                        | ShareFsInfo
                        | PrivateCgroup
                        | PrivateIpc
                        | PrivateNetwork
                        | PrivateMounts
                        | PrivatePid
                        | PrivateClock
                        | PrivateUsers
                        | PrivateUts
                        | SetSystemV
                )
            })
            .fold(0u64, |acc, f| acc | f.bit());
        (self.bits & valid) as libc::c_int
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recent() -> CloneFlagsBuilder {
        CloneFlagsBuilder::with_kernel(KernelVersion::new(6, 1, 0))
    }

    #[test]
    fn namespace_set_commits_clean() {
        let mut b = recent();
        b.enable(CloneFlag::PrivateMounts)
            .enable(CloneFlag::PrivatePid)
            .enable(CloneFlag::PrivateUts)
            .enable(CloneFlag::PrivateIpc)
            .enable(CloneFlag::PrivateClock)
            .enable(CloneFlag::PrivateCgroup);
        let set = b.commit().unwrap();
        assert!(set.contains(CloneFlag::PrivatePid));
        assert_eq!(
            set.unshare_flags() as u64 & CloneFlag::PrivateMounts.bit(),
            CloneFlag::PrivateMounts.bit()
        );
    }

    #[test]
    fn newuser_conflicts_with_fs() {
        let mut b = recent();
        b.enable(CloneFlag::PrivateUsers).enable(CloneFlag::ShareFsInfo);
        let err = b.commit().unwrap_err().to_string();
        assert!(err.contains("CLONE_NEWUSER"), "{err}");
        assert!(err.contains("CLONE_FS"), "{err}");
    }

    #[test]
    fn thread_requires_sighand_and_vm() {
        let mut b = recent();
        b.enable(CloneFlag::SetThread);
        let err = b.commit().unwrap_err().to_string();
        assert!(err.contains("CLONE_SIGHAND"), "{err}");
        assert!(err.contains("CLONE_VM"), "{err}");
    }

    #[test]
    fn clear_sighand_conflicts_with_sighand() {
        let mut b = recent();
        b.enable(CloneFlag::ResetSignals)
            .enable(CloneFlag::ProtectSignals)
            .enable(CloneFlag::ShareVirtualMemory);
        assert!(b.commit().is_err());
    }

    #[test]
    fn old_kernel_rejects_new_flags() {
        let mut b = CloneFlagsBuilder::with_kernel(KernelVersion::new(4, 19, 0));
        b.enable(CloneFlag::PrivateClock);
        let err = b.commit().unwrap_err().to_string();
        assert!(err.contains("requires kernel 5.6.0"), "{err}");
    }

    #[test]
    fn violations_accumulate() {
        let mut b = CloneFlagsBuilder::with_kernel(KernelVersion::new(4, 19, 0));
        b.enable(CloneFlag::PrivateClock)
            .enable(CloneFlag::PrivatePid)
            .enable(CloneFlag::SetThread)
            .enable(CloneFlag::ProtectSignals)
            .enable(CloneFlag::ShareVirtualMemory);
        let err = b.commit().unwrap_err().to_string();
        // kernel violation and the NEWPID/THREAD conflict both reported
        assert!(err.contains("requires kernel"), "{err}");
        assert!(err.contains("conflicts with CLONE_THREAD"), "{err}");
    }

    #[test]
    fn clone3_bits_are_outside_unshare_mask() {
        let mut b = recent();
        b.enable(CloneFlag::ResetSignals).enable(CloneFlag::JoinCgroup);
        let set = b.commit().unwrap();
        assert_eq!(set.unshare_flags(), 0);
        assert_ne!(set.bits(), 0);
    }
}
