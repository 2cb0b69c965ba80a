//! S-Raft: Raft consensus augmented with a sub-leader instant-promotion
//! fast path for faster leader failover.
//!
//! The consensus core (`node`, `message`, `transport`, `config`, `metrics`)
//! has no opinion on what a cluster's commands mean; `server` and `app` wire
//! it to a concrete TCP deployment and a toy counter application the same
//! way `ec2_server.py` wired the original node to AWS.

pub mod app;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod node;
pub mod server;
pub mod transport;
pub mod types;

pub use config::{ClusterConfig, ClusterNode, Config};
pub use error::{RaftError, Result};
pub use message::Message;
pub use metrics::{MetricsCollector, MetricsSummary};
pub use node::{NodeSnapshot, NodeStats, RaftNode, StateMachine};
pub use types::{LogEntry, LogIndex, NodeId, Term};
