use crate::error::Error;

/// Running kernel version, parsed from /proc/version
/// ("Linux version 6.1.0-13-amd64 ...").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub dot: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, dot: u32) -> Self {
        KernelVersion { major, minor, dot }
    }

    pub fn current() -> Result<Self, Error> {
        let proc_version = std::fs::read_to_string("/proc/version")
            .map_err(|e| Error::config(format!("read /proc/version: {e}")))?;
        Self::parse(&proc_version)
    }

    fn parse(proc_version: &str) -> Result<Self, Error> {
        let mut parts = proc_version.split_ascii_whitespace();
        match (parts.next(), parts.next()) {
            (Some("Linux"), Some("version")) => {}
            (first, _) => {
                return Err(Error::config(format!(
                    "kernel ({}) is not supported, requires Linux",
                    first.unwrap_or("")
                )))
            }
        }
        let version = parts
            .next()
            .ok_or_else(|| Error::config(format!("unable to split proc version: {proc_version}")))?;

        // release strings look like 6.1.0-13-amd64; ignore everything after
        // the dot-separated triple
        let mut nums = version.split(['.', '-']);
        let mut next_num = |what: &str| -> Result<u32, Error> {
            nums.next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::config(format!("unable to parse {what} version: {version}")))
        };
        Ok(KernelVersion {
            major: next_num("major")?,
            minor: next_num("minor")?,
            dot: next_num("dot")?,
        })
    }

    /// Whether this running kernel satisfies `required`.
    pub fn at_least(self, required: KernelVersion) -> bool {
        (self.major, self.minor, self.dot) >= (required.major, required.minor, required.dot)
    }
}

impl std::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.dot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_debian_style_release() {
        let v =
            KernelVersion::parse("Linux version 6.1.0-13-amd64 (debian-kernel@lists.debian.org)")
                .unwrap();
        assert_eq!(v, KernelVersion::new(6, 1, 0));
    }

    #[test]
    fn rejects_non_linux() {
        assert!(KernelVersion::parse("Darwin version 23.0.0").is_err());
    }

    #[test]
    fn ordering() {
        let running = KernelVersion::new(5, 10, 0);
        assert!(running.at_least(KernelVersion::new(2, 6, 24)));
        assert!(running.at_least(KernelVersion::new(5, 10, 0)));
        assert!(!running.at_least(KernelVersion::new(5, 11, 0)));
    }

    #[test]
    fn current_kernel_parses() {
        assert!(KernelVersion::current().unwrap().major >= 2);
    }
}
