//! Applied-state types.
//!
//! An [`AppliedState`] is the last graph a stack was provisioned to, plus the
//! bookkeeping needed to detect concurrent applies and to show history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{GraphHasher, ResourceGraph};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept per stack.
pub const MAX_HISTORY: usize = 100;

/// The applied state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedState {
    /// State format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Incremented on every save. The first saved state has revision 1.
    pub revision: u64,
    /// Content hash of `resources`.
    pub graph_hash: String,
    /// When this state was recorded.
    pub applied_at: DateTime<Utc>,
    /// The applied resource graph.
    pub resources: ResourceGraph,
    /// Recent apply history, oldest first.
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyHistoryEntry {
    /// When the apply finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: ApplyOperation,
    /// Revision written by this run.
    pub revision: u64,
    /// Graph hash after this run.
    pub graph_hash: String,
    /// Operations completed, e.g. `CREATE web1`.
    pub resources: Vec<String>,
    /// Whether every planned operation completed.
    pub success: bool,
    /// Error that stopped the run, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of apply runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Converge to the declared graph.
    Apply,
    /// Remove every resource.
    Destroy,
}

impl AppliedState {
    /// Creates the successor of `previous` holding `resources`.
    ///
    /// The revision is one past the previous revision (1 when there is no
    /// previous state) and the history is carried over.
    #[must_use]
    pub fn next(stack: &str, previous: Option<&Self>, resources: ResourceGraph) -> Self {
        let graph_hash = GraphHasher::new().hash_graph(&resources);
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            revision: previous.map_or(1, |p| p.revision + 1),
            graph_hash,
            applied_at: Utc::now(),
            resources,
            history: previous.map(|p| p.history.clone()).unwrap_or_default(),
        }
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns the most recent history entry.
    #[must_use]
    pub fn last_run(&self) -> Option<&ApplyHistoryEntry> {
        self.history.last()
    }
}

impl ApplyHistoryEntry {
    /// Creates a history entry for the given state.
    #[must_use]
    pub fn new(
        operation: ApplyOperation,
        state: &AppliedState,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            revision: state.revision,
            graph_hash: state.graph_hash.clone(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ResourceDeclaration, ResourceKind};

    fn graph() -> ResourceGraph {
        ResourceGraph::build(vec![
            ResourceDeclaration::new("net1", ResourceKind::Network).cidr("cidr", "10.0.0.0/16"),
        ])
        .unwrap()
    }

    #[test]
    fn test_revisions_increase() {
        let first = AppliedState::next("blog", None, graph());
        assert_eq!(first.revision, 1);
        assert_eq!(first.graph_hash.len(), 64);

        let second = AppliedState::next("blog", Some(&first), ResourceGraph::empty());
        assert_eq!(second.revision, 2);
        assert_ne!(second.graph_hash, first.graph_hash);
    }

    #[test]
    fn test_history_is_bounded_and_carried() {
        let mut state = AppliedState::next("blog", None, graph());
        for _ in 0..(MAX_HISTORY + 5) {
            let entry = ApplyHistoryEntry::new(ApplyOperation::Apply, &state, Vec::new(), None);
            state.add_history(entry);
        }
        assert_eq!(state.history.len(), MAX_HISTORY);

        let failed = ApplyHistoryEntry::new(
            ApplyOperation::Destroy,
            &state,
            vec![String::from("DELETE net1")],
            Some(String::from("boom")),
        );
        state.add_history(failed);
        assert!(!state.last_run().unwrap().success);

        let next = AppliedState::next("blog", Some(&state), graph());
        assert_eq!(next.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_state_json_roundtrip() {
        let state = AppliedState::next("blog", None, graph());
        let json = serde_json::to_string_pretty(&state).unwrap();
        let restored: AppliedState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
