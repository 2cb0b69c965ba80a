//! Server shell: wires `TcpTransport` + `RaftNode` + the counter application
//! together and runs a status-monitor loop, mirroring `ec2_server.py`'s
//! `EC2RaftServer`. EC2 metadata discovery (`get_ec2_private_ip`/
//! `get_ec2_instance_id`) is the spec's named non-goal and is not
//! implemented here: `host` must be supplied explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::app::{Counter, CounterSnapshot};
use crate::config::{ClusterConfig, Config};
use crate::error::Result;
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::node::{NodeSnapshot, RaftNode};
use crate::transport::{TcpTransport, Transport, TransportStats};
use crate::types::NodeId;

/// Full status payload for a running server, combining the node's
/// consensus-level snapshot with the application's counter value and
/// transport counters — `get_status` in `ec2_server.py`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub node: NodeSnapshot,
    pub counter: CounterSnapshot,
    pub transport: TransportStats,
}

pub struct RaftServer {
    node: Arc<RaftNode<TcpTransport>>,
    transport: Arc<TcpTransport>,
    counter: Arc<Counter>,
    metrics: Arc<MetricsCollector>,
    running: AtomicBool,
    node_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RaftServer {
    /// Binds the listener, derives this node's id from the sorted cluster
    /// address list, and connects to peers. Does not start the consensus
    /// worker thread yet — call `start` for that.
    pub fn bootstrap(self_addr: &str, cluster: ClusterConfig, config: Config) -> Result<Self> {
        config.validate(cluster.len())?;

        // `ClusterConfig::nodes` is a public field, so a caller could have
        // built `cluster` without going through `from_addresses`/`load`'s
        // id normalization. Re-derive every id from the sorted address
        // order here too, rather than trust whatever `id` is already on
        // each node — the sort is the only thing every peer agrees on
        // (spec §3, §6).
        let cluster = ClusterConfig::from_addresses(cluster.all_addresses())?;

        let self_id = cluster
            .nodes
            .iter()
            .find(|n| n.address() == self_addr)
            .map(|n| n.id)
            .ok_or_else(|| {
                crate::error::RaftError::InvalidClusterConfig(format!(
                    "{self_addr} is not present in the cluster address list"
                ))
            })?;

        let metrics = Arc::new(MetricsCollector::new());
        let counter = Arc::new(Counter::new());

        log::info!("server: initializing transport for node {self_id} at {self_addr}");
        let transport = TcpTransport::start(self_id, &cluster, &config)?;
        transport.connect_all();

        log::info!("server: creating raft node {self_id}");
        let node = RaftNode::new(
            self_id,
            cluster.len(),
            config,
            Arc::clone(&transport),
            Arc::clone(&metrics),
            Arc::clone(&counter) as Arc<dyn crate::node::StateMachine>,
        );

        Ok(RaftServer {
            node,
            transport,
            counter,
            metrics,
            running: AtomicBool::new(false),
            node_thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// Spawns the consensus worker thread. Idempotent: a second call is a
    /// no-op while the server is already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = Arc::clone(&self.node);
        let handle = std::thread::Builder::new()
            .name(format!("raft-node-{}", self.id()))
            .spawn(move || node.run())
            .expect("failed to spawn consensus worker thread");
        *self.node_thread.lock().unwrap() = Some(handle);
        log::info!("server: node {} started", self.id());
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("server: stopping node {}", self.id());
        self.node.stop();
        self.transport.stop();
        self.metrics.log_summary();
        if let Some(handle) = self.node_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn submit_increment(&self, value: i64) -> bool {
        self.node.submit_command(Counter::increment_command(value))
    }

    pub fn submit_set(&self, value: i64) -> bool {
        self.node.submit_command(Counter::set_command(value))
    }

    pub fn counter_value(&self) -> i64 {
        self.counter.snapshot().value
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            node: self.node.snapshot(),
            counter: self.counter.snapshot(),
            transport: self.transport.stats(),
        }
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Blocking status-monitor loop: logs a status line every `interval`,
    /// matching `ec2_server.py`'s `main()` monitor loop. Returns once
    /// `stop()` has been called from another thread.
    pub fn run_status_monitor(&self, interval: Duration) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(interval);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let status = self.status();
            let role_str = match (status.node.role.as_str(), status.node.leader_id) {
                ("Leader", _) => "LEADER".to_string(),
                (role, Some(leader)) => format!("{role} (leader={leader})"),
                (role, None) => format!("{role} (no leader yet)"),
            };
            let subleader_str = if status.node.is_sub_leader {
                let rank = if status.node.subleader_rank == Some(0) { "Primary" } else { "Secondary" };
                format!(" [{rank} sub-leader]")
            } else {
                String::new()
            };
            log::info!(
                "status: {role_str}{subleader_str} | term={} | log={} | counter={}",
                status.node.term,
                status.node.log_length,
                status.counter.value,
            );
        }
    }
}
