//! Commit manifest: the composite name and its contributed sources.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use mosaic_core::{CommitId, NodeId};

/// One contribution, `<node_id>:<source_file>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub node: NodeId,
    pub file: String,
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.file)
    }
}

/// Error parsing a contribution reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSource(pub String);

impl fmt::Display for InvalidSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid source (expected <node>:<file>): {:?}", self.0)
    }
}

impl std::error::Error for InvalidSource {}

impl FromStr for SourceRef {
    type Err = InvalidSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((node, file)) if !node.is_empty() && !file.is_empty() => Ok(Self {
                node: NodeId::new(node),
                file: file.to_owned(),
            }),
            _ => Err(InvalidSource(s.to_owned())),
        }
    }
}

/// The immutable description of one commit: composite name, the ordered
/// source list as supplied by the caller (duplicates preserved), and the
/// per-node view derived from it.
#[derive(Debug, Clone)]
pub struct CommitManifest {
    file_name: CommitId,
    sources: Vec<SourceRef>,
    by_node: BTreeMap<NodeId, Vec<String>>,
}

impl CommitManifest {
    #[must_use]
    pub fn new(file_name: CommitId, sources: Vec<SourceRef>) -> Self {
        let mut by_node: BTreeMap<NodeId, Vec<String>> = BTreeMap::new();
        for source in &sources {
            by_node
                .entry(source.node.clone())
                .or_default()
                .push(source.file.clone());
        }
        Self {
            file_name,
            sources,
            by_node,
        }
    }

    /// Parse raw `<node>:<file>` strings into a manifest.
    ///
    /// # Errors
    ///
    /// Returns an error on the first reference that does not split into a
    /// non-empty node and file.
    pub fn parse(file_name: CommitId, raw: &[String]) -> Result<Self, InvalidSource> {
        let sources = raw
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(file_name, sources))
    }

    #[must_use]
    pub fn file_name(&self) -> &CommitId {
        &self.file_name
    }

    #[must_use]
    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    /// The source list as it appears on the log's `Sources:` line.
    #[must_use]
    pub fn sources_line(&self) -> String {
        self.sources
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Distinct participants, in deterministic order.
    pub fn participants(&self) -> impl Iterator<Item = &NodeId> {
        self.by_node.keys()
    }

    #[must_use]
    pub fn num_participants(&self) -> usize {
        self.by_node.len()
    }

    #[must_use]
    pub fn is_participant(&self, node: &NodeId) -> bool {
        self.by_node.contains_key(node)
    }

    /// Files contributed by one node.
    #[must_use]
    pub fn files_for(&self, node: &NodeId) -> &[String] {
        self.by_node.get(node).map_or(&[], Vec::as_slice)
    }
}
