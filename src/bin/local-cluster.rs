//! Local in-process N-node harness, mirroring `local_test.py`'s
//! `LocalCluster`: spins up a full cluster on `ChannelTransport` (no real
//! sockets) and drives the same two scenarios the original script offered
//! — basic leader election, and leader failover timing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};

use sraft::app::Counter;
use sraft::config::Config;
use sraft::metrics::MetricsCollector;
use sraft::node::{NodeSnapshot, RaftNode, StateMachine};
use sraft::transport::ChannelTransport;
use sraft::types::NodeId;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Scenario {
    Basic,
    Failover,
}

#[derive(Parser, Debug)]
#[command(name = "local-cluster", about = "Run an in-process S-Raft cluster locally")]
struct Args {
    #[arg(long, default_value_t = 5)]
    nodes: usize,

    #[arg(long, default_value_t = true)]
    enable_subleader: bool,

    #[arg(long, value_enum, default_value_t = Scenario::Basic)]
    scenario: Scenario,
}

struct LocalCluster {
    nodes: Vec<Arc<RaftNode<ChannelTransport>>>,
    transports: Vec<Arc<ChannelTransport>>,
    metrics: Arc<MetricsCollector>,
}

impl LocalCluster {
    fn start(num_nodes: usize, enable_subleader: bool) -> Self {
        log::info!("{}", "=".repeat(70));
        log::info!(
            "S-Raft local cluster starting ({num_nodes} nodes, sub-leader {})",
            if enable_subleader { "enabled" } else { "disabled" }
        );
        log::info!("{}", "=".repeat(70));

        let config = Config { enable_subleader, debug: true, ..Config::default() };
        let metrics = Arc::new(MetricsCollector::new());
        let transports = ChannelTransport::cluster(num_nodes);

        let nodes: Vec<Arc<RaftNode<ChannelTransport>>> = transports
            .iter()
            .enumerate()
            .map(|(id, transport)| {
                log::info!("[cluster] starting node {id}");
                let node = RaftNode::new(
                    id as NodeId,
                    num_nodes,
                    config.clone(),
                    Arc::clone(transport),
                    Arc::clone(&metrics),
                    Arc::new(Counter::new()) as Arc<dyn StateMachine>,
                );
                let spawned = Arc::clone(&node);
                std::thread::Builder::new()
                    .name(format!("raft-node-{id}"))
                    .spawn(move || spawned.run())
                    .expect("failed to spawn node thread");
                node
            })
            .collect();

        LocalCluster { nodes, transports, metrics }
    }

    fn leader(&self) -> Option<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).find(|s| s.role == "Leader")
    }

    fn print_status(&self) {
        log::info!("{}", "-".repeat(70));
        for node in &self.nodes {
            let s = node.snapshot();
            let rank = match (s.is_sub_leader, s.subleader_rank) {
                (true, Some(0)) => " [Primary]",
                (true, _) => " [Secondary]",
                _ => "",
            };
            log::info!(
                "node {}: {:10} | term {:3} | leader {:?}{rank}",
                s.id,
                s.role,
                s.term,
                s.leader_id
            );
        }
        log::info!("{}", "-".repeat(70));
    }

    fn stop(&self) {
        log::info!("[cluster] stopping all nodes");
        for node in &self.nodes {
            node.stop();
        }
        for transport in &self.transports {
            transport.stop();
        }
        self.metrics.log_summary();
    }

    fn simulate_leader_failure(&self) -> Option<NodeId> {
        let leader = self.leader()?;
        log::info!("{}", "=".repeat(70));
        log::info!("[test] simulating leader failure: node {}", leader.id);
        log::info!("{}", "=".repeat(70));
        self.metrics.record_leader_failure(leader.id, leader.term);
        self.nodes[leader.id as usize].stop();
        self.transports[leader.id as usize].stop();
        Some(leader.id)
    }
}

fn run_basic_test(cluster: &LocalCluster) {
    log::info!("TEST: basic leader election");
    log::info!("[test] waiting for leader election...");
    for i in 0..30 {
        std::thread::sleep(Duration::from_secs(1));
        if let Some(leader) = cluster.leader() {
            log::info!("[test] leader elected: node {} after {}s", leader.id, i + 1);
            break;
        }
    }
    cluster.print_status();

    log::info!("[test] waiting for sub-leader assignment...");
    std::thread::sleep(Duration::from_secs(5));
    cluster.print_status();
}

fn run_failover_test(cluster: &LocalCluster) {
    log::info!("TEST: leader failover");
    for _ in 0..30 {
        std::thread::sleep(Duration::from_secs(1));
        if cluster.leader().is_some() {
            break;
        }
    }
    std::thread::sleep(Duration::from_secs(8));
    cluster.print_status();

    let failed_id = match cluster.simulate_leader_failure() {
        Some(id) => id,
        None => {
            log::warn!("[test] no leader to fail");
            return;
        }
    };

    let start = Instant::now();
    for _ in 0..40 {
        std::thread::sleep(Duration::from_millis(500));
        if let Some(leader) = cluster.leader() {
            if leader.id != failed_id {
                log::info!(
                    "[test] new leader: node {} ({:.1}ms)",
                    leader.id,
                    start.elapsed().as_secs_f64() * 1000.0
                );
                break;
            }
        }
    }
    cluster.print_status();
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let cluster = LocalCluster::start(args.nodes, args.enable_subleader);

    match args.scenario {
        Scenario::Basic => run_basic_test(&cluster),
        Scenario::Failover => run_failover_test(&cluster),
    }

    cluster.stop();
    log::info!("[main] test completed");
}
