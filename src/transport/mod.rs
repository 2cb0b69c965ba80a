//! Network abstraction the consensus node talks to. `TcpTransport` is the
//! real implementation; `ChannelTransport` is an in-process stand-in used
//! by tests and the local multi-node harness so the same node code runs
//! under both without a branch anywhere in `node`.

pub mod channel;
pub mod tcp;

use std::time::Duration;

use crate::message::Message;
use crate::types::NodeId;

pub use channel::ChannelTransport;
pub use tcp::TcpTransport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub send_count: u64,
    pub recv_count: u64,
    pub send_errors: u64,
    pub connect_errors: u64,
    pub reconnects: u64,
}

/// Everything `node::RaftNode` needs from the network. One send call per
/// outbound message, blocking with a bounded retry budget; one receive
/// call per tick, non-blocking past `timeout`.
pub trait Transport: Send {
    fn self_id(&self) -> NodeId;

    /// Deliver `message` to `target_id`, or to itself via loopback.
    /// Never blocks longer than the transport's own send timeout; failures
    /// are swallowed (logged) rather than propagated, matching the
    /// fire-and-forget nature of Raft RPCs under an unreliable network.
    fn send(&self, target_id: NodeId, message: Message);

    /// Wait up to `timeout` for the next inbound message.
    fn receive(&self, timeout: Duration) -> Option<Message>;

    /// Number of peers with a live connection, including self.
    fn connected_count(&self) -> usize;

    fn stats(&self) -> TransportStats;

    fn stop(&self);
}
