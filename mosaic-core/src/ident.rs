//! Node and commit identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of a node on the message substrate.
///
/// Participants are named by their CLI `node_id`; the coordinator has the
/// well-known name returned by [`NodeId::coordinator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The coordinator's well-known name.
    #[must_use]
    pub fn coordinator() -> Self {
        Self("coordinator".to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// A commit is identified by the name of the composite file it produces.
///
/// The name is treated opaquely; collisions between live commits are
/// forbidden by caller contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl CommitId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The commit's file name with everything from the first `.` stripped,
    /// used to derive its log-file name.
    #[must_use]
    pub fn stem(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_from_first_dot() {
        assert_eq!(CommitId::new("composites/1.jpg").stem(), "composites/1");
        assert_eq!(CommitId::new("a.b.jpg").stem(), "a");
        assert_eq!(CommitId::new("noext").stem(), "noext");
    }
}
