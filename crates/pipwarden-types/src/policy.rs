//! Requested-access and policy bit sets.

bit_set! {
    /// The kind of access a process asked for on a path.
    pub struct RequestedAccess: u8 {
        const NONE = 0;
        const READ = 0x01;
        const WRITE = 0x02;
        const PROBE = 0x04;
        const ENUMERATE = 0x08;
        const ENUMERATION_PROBE = 0x10;
    }
}

bit_set! {
    /// Policy bits attached to a manifest node.
    ///
    /// The low byte holds the allow bits, the high byte the reporting and
    /// override flags.
    pub struct FileAccessPolicy: u16 {
        const DENY = 0;
        const ALLOW_READ = 0x0001;
        const ALLOW_WRITE = 0x0002;
        const ALLOW_PROBE = 0x0004;
        const ALLOW_ENUMERATE = 0x0008;
        const ALLOW_READ_IF_NONEXISTENT = 0x0010;
        const ALLOW_CREATE_DIRECTORY = 0x0020;
        const ALLOW_SYMLINK_CREATION = 0x0040;
        const REPORT_ACCESS_IF_EXISTENT = 0x0100;
        const REPORT_ACCESS_IF_NONEXISTENT = 0x0200;
        const REPORT_DIRECTORY_ENUMERATION = 0x0400;
        /// Writes to files that already exist are decided by existence, not
        /// by `ALLOW_WRITE`.
        const OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES = 0x0800;
        const REPORT_ACCESS = 0x0300;
        const ALLOW_ALL = 0x006F;
        const DENY_WITH_REPORT = 0x0300;
    }
}

bit_set! {
    /// Manifest-wide switches consumed by the interception backend and the
    /// report processor.
    pub struct ManifestFlags: u32 {
        const NONE = 0;
        const FAIL_UNEXPECTED_ACCESSES = 0x01;
        const REPORT_FILE_ACCESSES = 0x02;
        const REPORT_UNEXPECTED_ACCESSES = 0x04;
        const MONITOR_CHILD_PROCESSES = 0x08;
        const RESOLVE_SYMLINKS = 0x10;
        const REPORT_PROCESS_ARGS = 0x20;
    }
}

impl FileAccessPolicy {
    /// Read, probe and enumerate, the usual policy for declared inputs.
    pub const ALLOW_READ_ONLY: Self = Self::from_bits(0x000D);

    /// True when this policy permits `requested`.
    ///
    /// `exists` is only consulted for `ALLOW_READ_IF_NONEXISTENT`; pass `None`
    /// when the existence of the target is unknown, which is treated as
    /// existing.
    pub fn permits(self, requested: RequestedAccess, exists: Option<bool>) -> bool {
        let absent = exists == Some(false);
        let read_if_absent = absent && self.contains(Self::ALLOW_READ_IF_NONEXISTENT);

        if requested.contains(RequestedAccess::WRITE) && !self.contains(Self::ALLOW_WRITE) {
            return false;
        }
        if requested.contains(RequestedAccess::READ)
            && !(self.contains(Self::ALLOW_READ) || read_if_absent)
        {
            return false;
        }
        if requested.intersects(RequestedAccess::PROBE | RequestedAccess::ENUMERATION_PROBE)
            && !(self.intersects(Self::ALLOW_PROBE | Self::ALLOW_READ) || read_if_absent)
        {
            return false;
        }
        if requested.contains(RequestedAccess::ENUMERATE)
            && !self.intersects(Self::ALLOW_ENUMERATE | Self::ALLOW_READ)
        {
            return false;
        }
        true
    }

    /// Whether an access under this policy must be reported.
    pub fn should_report(self, exists: Option<bool>) -> bool {
        match exists {
            Some(false) => self.contains(Self::REPORT_ACCESS_IF_NONEXISTENT),
            _ => self.contains(Self::REPORT_ACCESS_IF_EXISTENT),
        }
    }

    /// Whether the existing-file write override is active.
    pub fn overrides_writes_for_existing_files(self) -> bool {
        self.contains(Self::OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_policy() {
        let policy = FileAccessPolicy::ALLOW_READ_ONLY;
        assert!(policy.permits(RequestedAccess::READ, Some(true)));
        assert!(policy.permits(RequestedAccess::PROBE, None));
        assert!(policy.permits(RequestedAccess::ENUMERATE, Some(true)));
        assert!(!policy.permits(RequestedAccess::WRITE, Some(false)));
        assert!(!policy.permits(RequestedAccess::READ | RequestedAccess::WRITE, Some(true)));
    }

    #[test]
    fn test_deny_permits_nothing_but_none() {
        let policy = FileAccessPolicy::DENY;
        assert!(policy.permits(RequestedAccess::NONE, None));
        assert!(!policy.permits(RequestedAccess::READ, None));
        assert!(!policy.permits(RequestedAccess::PROBE, None));
    }

    #[test]
    fn test_read_if_nonexistent() {
        let policy = FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT;
        assert!(policy.permits(RequestedAccess::PROBE, Some(false)));
        assert!(policy.permits(RequestedAccess::READ, Some(false)));
        assert!(!policy.permits(RequestedAccess::READ, Some(true)));
        assert!(!policy.permits(RequestedAccess::READ, None));
    }

    #[test]
    fn test_write_policy_allows_probe_only_when_granted() {
        let write_only = FileAccessPolicy::ALLOW_WRITE;
        assert!(write_only.permits(RequestedAccess::WRITE, None));
        assert!(!write_only.permits(RequestedAccess::PROBE, None));
        assert!(FileAccessPolicy::ALLOW_ALL.permits(RequestedAccess::PROBE, None));
    }

    #[test]
    fn test_should_report() {
        let policy = FileAccessPolicy::REPORT_ACCESS_IF_NONEXISTENT;
        assert!(policy.should_report(Some(false)));
        assert!(!policy.should_report(Some(true)));
        assert!(FileAccessPolicy::REPORT_ACCESS.should_report(None));
    }

    #[test]
    fn test_debug_lists_flag_names() {
        let policy = FileAccessPolicy::ALLOW_READ | FileAccessPolicy::ALLOW_WRITE;
        let rendered = format!("{policy:?}");
        assert!(rendered.contains("ALLOW_READ"));
        assert!(rendered.contains("ALLOW_WRITE"));
        assert_eq!(format!("{:?}", RequestedAccess::NONE), "RequestedAccess(empty)");
    }
}
