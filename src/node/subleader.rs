//! Sub-leader designation: the leader ranks peers by EMA round-trip time
//! and hands the lowest-latency ones the sub-leader role, lowest RTT first
//! (rank 0 = primary).

use std::collections::{BTreeMap, HashMap};

use crate::types::NodeId;

pub fn assign(response_times: &HashMap<NodeId, f64>, count: usize) -> BTreeMap<NodeId, u8> {
    let mut by_rtt: Vec<(NodeId, f64)> = response_times.iter().map(|(&id, &rtt)| (id, rtt)).collect();
    by_rtt.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    by_rtt
        .into_iter()
        .take(count)
        .enumerate()
        .map(|(rank, (id, _))| (id, rank as u8))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_rtt_peers_become_primary_then_secondary() {
        let mut rtts = HashMap::new();
        rtts.insert(1u64, 0.020);
        rtts.insert(2u64, 0.005);
        rtts.insert(3u64, 0.050);
        let ranks = assign(&rtts, 2);
        assert_eq!(ranks.get(&2), Some(&0));
        assert_eq!(ranks.get(&1), Some(&1));
        assert_eq!(ranks.get(&3), None);
    }

    #[test]
    fn count_larger_than_peer_set_assigns_everyone() {
        let mut rtts = HashMap::new();
        rtts.insert(1u64, 0.01);
        let ranks = assign(&rtts, 5);
        assert_eq!(ranks.len(), 1);
    }
}
