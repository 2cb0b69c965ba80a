//! Core identifiers and the log entry type shared across the wire codec,
//! the consensus node, and the application log.

use serde::{Deserialize, Serialize};

/// A peer's index in the cluster-wide sorted address list. The sort
/// discipline is the sole source of agreement on ids.
pub type NodeId = u64;

/// Monotonically non-decreasing leadership epoch.
pub type Term = u64;

/// 1-based, strictly increasing, dense log position. Index 0 is a sentinel
/// meaning "no entry" and is never occupied.
pub type LogIndex = u64;

/// An ordered `(term, command, index)` triple. `command` is opaque to the
/// consensus core; only the application state machine interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: serde_json::Value,
    pub index: LogIndex,
}

impl LogEntry {
    pub fn new(term: Term, command: serde_json::Value, index: LogIndex) -> Self {
        LogEntry { term, command, index }
    }
}
