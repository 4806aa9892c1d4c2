//! Unix-style permissions on collections.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the built-in administrator group.
pub const DBA_GROUP: &str = "dba";

/// The identity on whose behalf a transaction runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    name: String,
    groups: Vec<String>,
}

impl Subject {
    const SYSTEM: &'static str = "SYSTEM";

    /// A plain user with no groups.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    /// The internal superuser. Bypasses every permission check.
    pub fn system() -> Self {
        Self {
            name: Self::SYSTEM.to_string(),
            groups: vec![DBA_GROUP.to_string()],
        }
    }

    /// Add a group membership.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// primary group, used as group owner of new collections
    pub fn primary_group(&self) -> &str {
        self.groups.first().map(String::as_str).unwrap_or(DBA_GROUP)
    }

    pub fn is_system(&self) -> bool {
        self.name == Self::SYSTEM
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Kind of access requested against a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Owner, group and `rwx` mode bits for user/group/other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub owner: String,
    pub group: String,
    pub mode: u16,
}

impl Permissions {
    /// mode given to newly created collections
    pub const DEFAULT_MODE: u16 = 0o755;

    pub fn new(owner: impl Into<String>, group: impl Into<String>, mode: u16) -> Self {
        Self {
            owner: owner.into(),
            group: group.into(),
            mode: mode & 0o777,
        }
    }

    /// default permissions for a collection created by `subject`
    pub fn owned_by(subject: &Subject) -> Self {
        Self::new(subject.name(), subject.primary_group(), Self::DEFAULT_MODE)
    }

    /// Check whether `subject` may perform `access`.
    pub fn allows(&self, subject: &Subject, access: Access) -> bool {
        if subject.is_system() {
            return true;
        }

        let bit = match access {
            Access::Read => 0o4,
            Access::Write => 0o2,
        };

        let shift = if subject.name() == self.owner {
            6
        } else if subject.in_group(&self.group) {
            3
        } else {
            0
        };

        (self.mode >> shift) & bit != 0
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::owned_by(&Subject::system())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_group_other() {
        let perms = Permissions::new("alice", "staff", 0o750);
        let alice = Subject::new("alice");
        let bob = Subject::new("bob").with_group("staff");
        let eve = Subject::new("eve");

        assert!(perms.allows(&alice, Access::Write));
        assert!(perms.allows(&bob, Access::Read));
        assert!(!perms.allows(&bob, Access::Write));
        assert!(!perms.allows(&eve, Access::Read));
    }

    #[test]
    fn test_system_bypasses() {
        let perms = Permissions::new("alice", "staff", 0o000);
        assert!(perms.allows(&Subject::system(), Access::Write));
    }

    #[test]
    fn test_owned_by_defaults() {
        let subject = Subject::new("carol").with_group("editors");
        let perms = Permissions::owned_by(&subject);
        assert_eq!(perms.owner, "carol");
        assert_eq!(perms.group, "editors");
        assert_eq!(perms.mode, 0o755);
    }
}
