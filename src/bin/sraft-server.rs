//! CLI entry point: start a single S-Raft node bound to a real TCP socket
//! and join it to a cluster of peers, mirroring `ec2_server.py`'s `main()`.
//! EC2 metadata auto-discovery is the spec's named non-goal — `--host` must
//! be given explicitly (it defaults to the loopback address for local
//! testing, not an auto-detected cloud IP).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use sraft::{ClusterConfig, Config};

#[derive(Parser, Debug)]
#[command(name = "sraft-server", about = "Run a single S-Raft cluster node")]
struct Args {
    /// Bind host. The spec's EC2 metadata auto-detection is out of scope;
    /// pass the real address peers should dial.
    #[arg(long, env = "RAFT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listen port.
    #[arg(long, env = "RAFT_PORT")]
    port: u16,

    /// Comma-separated peer addresses (host:port), not including self.
    #[arg(long, env = "RAFT_PEERS")]
    peers: String,

    /// Advisory node id, logged only: the authoritative id is always the
    /// index of `host:port` in the sorted cluster address list (spec §3,
    /// §6 — "mismatch ... is resolved in favor of the sort").
    #[arg(long, env = "RAFT_NODE_ID")]
    node_id: Option<u64>,

    /// Path to a JSON cluster identity file ({id,host,port} array). When
    /// given, takes precedence over --peers.
    #[arg(long)]
    cluster_file: Option<PathBuf>,

    /// Path to a JSON config file overriding the tuned defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Disable the S-Raft sub-leader fast path (fall back to plain Raft).
    #[arg(long)]
    original_raft: bool,

    #[arg(long, env = "ENABLE_SUBLEADER", default_value_t = true)]
    enable_subleader: bool,

    #[arg(long)]
    debug: bool,

    /// Seconds between status-monitor log lines.
    #[arg(long, default_value_t = 5.0)]
    status_interval: f64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let self_addr = format!("{}:{}", args.host, args.port);

    let cluster = match &args.cluster_file {
        Some(path) => ClusterConfig::load(path).expect("failed to load cluster file"),
        None => {
            let peer_addrs: Vec<String> =
                args.peers.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
            let mut all_addrs = vec![self_addr.clone()];
            all_addrs.extend(peer_addrs);
            ClusterConfig::from_addresses(all_addrs).expect("invalid peer addresses")
        }
    };

    let mut config = match &args.config {
        Some(path) => Config::load(path).expect("failed to load config file"),
        None => Config::default(),
    };
    config.debug = args.debug;
    config.enable_subleader = args.enable_subleader && !args.original_raft;

    if let Some(requested) = args.node_id {
        // `cluster`'s ids are always sort-derived at this point — both
        // `ClusterConfig::load` and `from_addresses` re-derive them from
        // the sorted address order, discarding any stored id — so this
        // really is the sort-derived id, not the cluster file's own.
        let derived = cluster.nodes.iter().find(|n| n.address() == self_addr).map(|n| n.id);
        if derived != Some(requested) {
            log::warn!(
                "--node-id {requested} does not match the sort-derived id {derived:?} for {self_addr}; using the sort-derived id"
            );
        }
    }

    log::info!("{}", "=".repeat(60));
    log::info!("S-Raft server starting");
    log::info!("  self: {self_addr}");
    log::info!("  cluster size: {}", cluster.len());
    log::info!("  sub-leader fast path: {}", config.enable_subleader);
    log::info!("{}", "=".repeat(60));

    let server = Arc::new(
        sraft::server::RaftServer::bootstrap(&self_addr, cluster, config)
            .expect("failed to bootstrap server"),
    );
    server.start();

    server.run_status_monitor(Duration::from_secs_f64(args.status_interval));
}
