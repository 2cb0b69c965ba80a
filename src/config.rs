//! Tunables and cluster membership.
//!
//! `Config` carries every timing constant with the defaults tuned for a
//! same-region cloud network (sub-5ms RTT between peers); `ClusterConfig`
//! turns a list of `host:port` strings into a stable, sorted node-id
//! assignment that every peer derives independently and identically.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub heartbeat_interval: f64,
    pub election_timeout_base: f64,

    pub enable_subleader: bool,
    pub subleader_ratio: f64,

    pub primary_timeout_min: f64,
    pub primary_timeout_max: f64,

    pub secondary_timeout_min: f64,
    pub secondary_timeout_max: f64,

    pub follower_timeout_min: f64,
    pub follower_timeout_max: f64,

    pub promotion_timeout: f64,

    pub connection_timeout: f64,
    pub connection_retry_time: f64,
    pub recv_timeout: f64,

    pub rtt_alpha: f64,
    pub auto_tick_period: f64,

    pub startup_grace_duration: f64,

    pub debug: bool,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            heartbeat_interval: 0.05,
            election_timeout_base: 0.15,

            enable_subleader: true,
            subleader_ratio: 0.4,

            primary_timeout_min: 0.15,
            primary_timeout_max: 0.20,

            secondary_timeout_min: 0.25,
            secondary_timeout_max: 0.35,

            follower_timeout_min: 0.30,
            follower_timeout_max: 1.00,

            promotion_timeout: 0.3,

            connection_timeout: 5.0,
            connection_retry_time: 3.0,
            recv_timeout: 0.01,

            rtt_alpha: 0.3,
            auto_tick_period: 0.001,

            startup_grace_duration: 5.0,

            debug: true,
            verbose: false,
        }
    }
}

impl Config {
    /// Number of sub-leaders the cluster should designate, floor-rounded
    /// the same way the reference implementation does.
    pub fn subleader_count(&self, node_count: usize) -> usize {
        ((node_count as f64) * self.subleader_ratio) as usize
    }

    pub fn validate(&self, node_count: usize) -> Result<()> {
        if node_count < 3 {
            return Err(RaftError::InvalidClusterConfig(
                "a cluster needs at least 3 nodes".to_string(),
            ));
        }
        if self.enable_subleader && self.subleader_count(node_count) < 1 {
            return Err(RaftError::InvalidClusterConfig(
                "subleader_ratio yields zero sub-leaders for this node count".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
}

impl ClusterNode {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cluster membership list. Ids are assigned by sorting `host:port`
/// strings lexicographically — every node computes the same mapping from
/// the same peer list without an external coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<ClusterNode>,
}

impl ClusterConfig {
    pub fn from_addresses(addresses: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut nodes = Vec::new();
        for addr in addresses {
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| RaftError::InvalidClusterConfig(format!("bad address: {addr}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| RaftError::InvalidClusterConfig(format!("bad port in: {addr}")))?;
            nodes.push(ClusterNode { id: 0, host: host.to_string(), port });
        }
        Ok(Self::normalized(nodes))
    }

    /// Sorts `nodes` by their `host:port` address string, lexicographically,
    /// and overwrites each `id` with its index in that sorted order — the
    /// sort discipline is the sole source of agreement on ids (spec §3), so
    /// any stored `id` a caller supplied (e.g. from a cluster identity file)
    /// is discarded here rather than trusted.
    fn normalized(mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by(|a, b| a.address().cmp(&b.address()));
        for (i, node) in nodes.iter_mut().enumerate() {
            node.id = i as NodeId;
        }
        ClusterConfig { nodes }
    }

    pub fn node_address(&self, id: NodeId) -> Option<String> {
        self.nodes.iter().find(|n| n.id == id).map(ClusterNode::address)
    }

    pub fn all_addresses(&self) -> Vec<String> {
        self.nodes.iter().map(ClusterNode::address).collect()
    }

    pub fn peer_addresses(&self, my_id: NodeId) -> BTreeMap<NodeId, String> {
        self.nodes
            .iter()
            .filter(|n| n.id != my_id)
            .map(|n| (n.id, n.address()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Loads a cluster identity file and re-derives every `id` from the
    /// sorted address order, ignoring whatever `id` the file stored — a
    /// stale or out-of-order id on disk must never override the sort
    /// discipline every peer agrees on (spec §6 "mismatch between stored id
    /// and sort-derived id is resolved in favor of the sort").
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let raw: ClusterConfig = serde_json::from_str(&text)?;
        Ok(Self::normalized(raw.nodes))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_tuned_cloud_profile() {
        let cfg = Config::default();
        assert_eq!(cfg.heartbeat_interval, 0.05);
        assert_eq!(cfg.primary_timeout_min, 0.15);
        assert_eq!(cfg.primary_timeout_max, 0.20);
        assert_eq!(cfg.secondary_timeout_min, 0.25);
        assert_eq!(cfg.secondary_timeout_max, 0.35);
        assert_eq!(cfg.follower_timeout_min, 0.30);
        assert_eq!(cfg.follower_timeout_max, 1.00);
        assert_eq!(cfg.subleader_ratio, 0.4);
    }

    #[test]
    fn validate_rejects_clusters_smaller_than_three() {
        let cfg = Config::default();
        assert!(cfg.validate(2).is_err());
        assert!(cfg.validate(3).is_ok());
    }

    #[test]
    fn validate_rejects_ratios_that_round_down_to_zero_subleaders() {
        let mut cfg = Config::default();
        cfg.subleader_ratio = 0.1;
        // floor(3 * 0.1) == 0
        assert!(cfg.validate(3).is_err());
        assert!(cfg.validate(10).is_ok());
    }

    #[test]
    fn from_addresses_assigns_ids_by_sorted_order() {
        let cluster = ClusterConfig::from_addresses(vec![
            "10.0.0.3:5000".to_string(),
            "10.0.0.1:5000".to_string(),
            "10.0.0.2:5000".to_string(),
        ])
        .unwrap();
        assert_eq!(cluster.nodes[0].host, "10.0.0.1");
        assert_eq!(cluster.nodes[0].id, 0);
        assert_eq!(cluster.nodes[2].host, "10.0.0.3");
        assert_eq!(cluster.nodes[2].id, 2);
    }

    #[test]
    fn peer_addresses_excludes_self() {
        let cluster = ClusterConfig::from_addresses(vec![
            "10.0.0.1:5000".to_string(),
            "10.0.0.2:5000".to_string(),
            "10.0.0.3:5000".to_string(),
        ])
        .unwrap();
        let peers = cluster.peer_addresses(1);
        assert_eq!(peers.len(), 2);
        assert!(!peers.contains_key(&1));
    }

    #[test]
    fn load_ignores_stale_ids_stored_in_the_cluster_file_and_rederives_them() {
        let path = std::env::temp_dir()
            .join(format!("sraft-cluster-config-test-{:?}.json", std::thread::current().id()));
        // Out of address-sort order, and with ids that don't match that
        // order at all (node at .3 claims id 0, .1 claims id 9).
        let raw = serde_json::json!({
            "nodes": [
                {"id": 0, "host": "10.0.0.3", "port": 5000},
                {"id": 9, "host": "10.0.0.1", "port": 5000},
                {"id": 1, "host": "10.0.0.2", "port": 5000},
            ]
        });
        fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        let cluster = ClusterConfig::load(&path).unwrap();
        fs::remove_file(&path).ok();

        let by_host = |host: &str| cluster.nodes.iter().find(|n| n.host == host).unwrap().id;
        assert_eq!(by_host("10.0.0.1"), 0);
        assert_eq!(by_host("10.0.0.2"), 1);
        assert_eq!(by_host("10.0.0.3"), 2);
    }
}
