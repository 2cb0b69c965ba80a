//! Example application state machine: a replicated counter.
//!
//! Commands are `{"type": "increment", "value": N}` or `{"type": "set",
//! "value": N}`, applied in commit order via `on_log_committed`. This is the
//! "example application state machine (a counter)" the spec names as an
//! out-of-scope collaborator, specified only by interface — its internals
//! are ours to choose, mirroring `ec2_server.py`'s `app_state` dict.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::StateMachine;
use crate::types::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub value: i64,
    pub applied_count: u64,
}

/// Applies committed counter commands behind one mutex. `RaftServer` hands
/// this an `Arc<Counter>` as its `StateMachine` sink.
#[derive(Debug, Default)]
pub struct Counter {
    inner: Mutex<CounterSnapshot>,
}

impl Counter {
    pub fn new() -> Self {
        Counter { inner: Mutex::new(CounterSnapshot { value: 0, applied_count: 0 }) }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.inner.lock().unwrap()
    }

    pub fn increment_command(value: i64) -> Value {
        serde_json::json!({ "type": "increment", "value": value })
    }

    pub fn set_command(value: i64) -> Value {
        serde_json::json!({ "type": "set", "value": value })
    }

    fn apply(&self, command: &Value) {
        let mut state = self.inner.lock().unwrap();
        match command.get("type").and_then(Value::as_str) {
            Some("increment") => {
                let delta = command.get("value").and_then(Value::as_i64).unwrap_or(1);
                state.value += delta;
            }
            Some("set") => {
                let value = command.get("value").and_then(Value::as_i64).unwrap_or(0);
                state.value = value;
            }
            _ => {
                log::warn!("counter: unrecognised command {command}");
            }
        }
        state.applied_count += 1;
    }
}

impl StateMachine for Counter {
    fn on_become_leader(&self) {
        log::info!("counter app: this node is now the leader");
    }

    fn on_become_follower(&self) {
        log::info!("counter app: this node is now a follower");
    }

    fn on_log_committed(&self, entry: &LogEntry) {
        self.apply(&entry.command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_accumulates_across_committed_entries() {
        let counter = Counter::new();
        counter.on_log_committed(&LogEntry::new(1, Counter::increment_command(3), 1));
        counter.on_log_committed(&LogEntry::new(1, Counter::increment_command(4), 2));
        let snap = counter.snapshot();
        assert_eq!(snap.value, 7);
        assert_eq!(snap.applied_count, 2);
    }

    #[test]
    fn set_overwrites_rather_than_accumulating() {
        let counter = Counter::new();
        counter.on_log_committed(&LogEntry::new(1, Counter::increment_command(10), 1));
        counter.on_log_committed(&LogEntry::new(1, Counter::set_command(2), 2));
        assert_eq!(counter.snapshot().value, 2);
    }

    #[test]
    fn unrecognised_command_type_is_ignored_but_still_counted() {
        let counter = Counter::new();
        counter.on_log_committed(&LogEntry::new(1, serde_json::json!({"type": "noop"}), 1));
        let snap = counter.snapshot();
        assert_eq!(snap.value, 0);
        assert_eq!(snap.applied_count, 1);
    }
}
