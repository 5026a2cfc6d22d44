//! Failure classification shared by every pipeline stage.

use serde::Serialize;

/// Scope-independent kind of a contained failure, used for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Enumeration or block open failure.
    Storage,
    /// Selector or query construction failure on a block.
    Query,
    /// Mid-stream series or sample read failure.
    Iteration,
    /// Batch encode failure.
    Codec,
    /// Network-level failure that outlived the retry budget.
    Transport,
    /// Non-2xx answer from the remote endpoint.
    ServerRejection,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Query => "query",
            Self::Iteration => "iteration",
            Self::Codec => "codec",
            Self::Transport => "transport",
            Self::ServerRejection => "server_rejection",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
