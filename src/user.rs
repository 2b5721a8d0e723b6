use nix::unistd::{setgid, setgroups, setuid, Gid, Group, Uid, User};

use crate::error::Error;

/// Credentials to apply to the accepting thread or a forked child.
/// Names are resolved to ids on first use; explicit ids win over names.
#[derive(Debug, Clone, Default)]
pub struct UserSpec {
    pub user: Option<String>,
    pub group: Option<String>,
    pub uid: u32,
    pub gid: u32,
}

impl UserSpec {
    pub fn is_set(&self) -> bool {
        self.user.is_some() || self.group.is_some() || self.uid > 0 || self.gid > 0
    }

    /// Resolves names to numeric (uid, gid). A user name also supplies the
    /// primary gid unless a group overrides it.
    pub fn lookup(&self) -> Result<(u32, u32), Error> {
        let mut uid = self.uid;
        let mut gid = self.gid;

        if uid == 0 {
            if let Some(name) = &self.user {
                let user = User::from_name(name)
                    .map_err(|e| Error::Privilege(format!("lookup user {name:?}: {e}")))?
                    .ok_or_else(|| Error::Privilege(format!("no such user {name:?}")))?;
                uid = user.uid.as_raw();
                gid = user.gid.as_raw();
            }
        }

        if gid == 0 {
            if let Some(name) = &self.group {
                let group = Group::from_name(name)
                    .map_err(|e| Error::Privilege(format!("lookup group {name:?}: {e}")))?
                    .ok_or_else(|| Error::Privilege(format!("no such group {name:?}")))?;
                gid = group.gid.as_raw();
            }
        }

        Ok((uid, gid))
    }

    /// Drops to the configured credentials. Must run after every descriptor
    /// the caller needs is open and after namespace entry; the uid switch
    /// comes last because a nonzero uid can no longer change gid.
    pub fn switch(&self) -> Result<(), Error> {
        let (uid, gid) = self.lookup()?;

        if gid > 0 {
            setgroups(&[]).map_err(|e| Error::Privilege(format!("setgroups: {e}")))?;
            setgid(Gid::from_raw(gid)).map_err(|e| Error::Privilege(format!("setgid {gid}: {e}")))?;
        }

        if uid > 0 {
            setuid(Uid::from_raw(uid)).map_err(|e| Error::Privilege(format!("setuid {uid}: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_ids_pass_through() {
        let spec = UserSpec {
            uid: 1000,
            gid: 1000,
            ..Default::default()
        };
        assert_eq!(spec.lookup().unwrap(), (1000, 1000));
    }

    #[test]
    fn root_lookup_resolves_to_zero() {
        let spec = UserSpec {
            user: Some("root".into()),
            ..Default::default()
        };
        assert_eq!(spec.lookup().unwrap(), (0, 0));
    }

    #[test]
    fn unknown_user_is_an_error() {
        let spec = UserSpec {
            user: Some("no-such-user-here".into()),
            ..Default::default()
        };
        assert!(spec.lookup().is_err());
    }

    #[test]
    fn unset_spec_switch_is_a_noop() {
        UserSpec::default().switch().unwrap();
    }
}
