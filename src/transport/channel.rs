//! In-process transport backed by `std::sync::mpsc`. Used by integration
//! tests and `local-cluster` so a whole cluster can run in one process
//! without touching loopback sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::message::Message;
use crate::types::NodeId;

use super::{Transport, TransportStats};

struct Counters {
    send_count: AtomicU64,
    recv_count: AtomicU64,
    send_errors: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Counters {
            send_count: AtomicU64::new(0),
            recv_count: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }
}

/// One end of an in-memory cluster. Construct a full set with
/// [`ChannelTransport::cluster`]; each node gets its own receiver and a
/// shared view of every peer's sender.
pub struct ChannelTransport {
    self_id: NodeId,
    senders: Arc<Mutex<HashMap<NodeId, Sender<Message>>>>,
    receiver: Mutex<Receiver<Message>>,
    running: AtomicBool,
    counters: Counters,
}

impl ChannelTransport {
    /// Build `node_count` linked transports, ids `0..node_count`.
    pub fn cluster(node_count: usize) -> Vec<Arc<ChannelTransport>> {
        let mut senders = HashMap::new();
        let mut receivers = Vec::with_capacity(node_count);
        for id in 0..node_count {
            let (tx, rx) = std::sync::mpsc::channel();
            senders.insert(id as NodeId, tx);
            receivers.push(rx);
        }
        let senders = Arc::new(Mutex::new(senders));
        receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| {
                Arc::new(ChannelTransport {
                    self_id: id as NodeId,
                    senders: Arc::clone(&senders),
                    receiver: Mutex::new(rx),
                    running: AtomicBool::new(true),
                    counters: Counters::default(),
                })
            })
            .collect()
    }

    /// Sever this node's sender so no other node's `send` can reach it,
    /// simulating a crashed/partitioned process without dropping the
    /// `ChannelTransport` value the node still holds.
    pub fn partition(&self) {
        self.senders.lock().unwrap().remove(&self.self_id);
    }
}

impl Transport for ChannelTransport {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn send(&self, target_id: NodeId, message: Message) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let sender = self.senders.lock().unwrap().get(&target_id).cloned();
        match sender {
            Some(tx) => {
                if tx.send(message).is_ok() {
                    self.counters.send_count.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn receive(&self, timeout: Duration) -> Option<Message> {
        let rx = self.receiver.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(msg) => {
                self.counters.recv_count.fetch_add(1, Ordering::Relaxed);
                Some(msg)
            }
            Err(_) => None,
        }
    }

    fn connected_count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            send_count: self.counters.send_count.load(Ordering::Relaxed),
            recv_count: self.counters.recv_count.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            connect_errors: 0,
            reconnects: 0,
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.senders.lock().unwrap().remove(&self.self_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[test]
    fn send_to_self_is_delivered_back_through_receive() {
        let cluster = ChannelTransport::cluster(3);
        let node = &cluster[0];
        let msg = Message::request_vote(0, 1, 0, 0);
        node.send(0, msg);
        let received = node.receive(Duration::from_millis(100)).unwrap();
        assert_eq!(received.sender_id, 0);
        assert_eq!(received.message_type, MessageType::RequestVote);
    }

    #[test]
    fn partitioned_node_drops_inbound_sends() {
        let cluster = ChannelTransport::cluster(3);
        cluster[1].partition();
        cluster[0].send(1, Message::request_vote(0, 1, 0, 0));
        assert!(cluster[1].receive(Duration::from_millis(50)).is_none());
        assert_eq!(cluster[0].stats().send_errors, 1);
    }

    #[test]
    fn connected_count_drops_after_partition() {
        let cluster = ChannelTransport::cluster(5);
        assert_eq!(cluster[0].connected_count(), 5);
        cluster[2].partition();
        assert_eq!(cluster[0].connected_count(), 4);
    }
}
