//! Election timeout stratification: bootstrap vs. sub-leader rank vs.
//! ordinary follower. The instant-promotion fast path only works because
//! primary sub-leaders time out before secondary sub-leaders, who time out
//! before ordinary followers — this is the bracket arithmetic that
//! guarantees that ordering.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;
use crate::types::NodeId;

pub fn election_timeout(
    cfg: &Config,
    id: NodeId,
    total_nodes: usize,
    had_leader_before: bool,
    subleader_rank: Option<u8>,
) -> Duration {
    let mut rng = rand::thread_rng();

    let secs = if !had_leader_before {
        let base_offset = id as f64 * 0.05;
        rng.gen_range(
            (cfg.election_timeout_base + base_offset)..=(cfg.election_timeout_base * 2.0 + base_offset),
        )
    } else if cfg.enable_subleader && subleader_rank == Some(0) {
        rng.gen_range(cfg.primary_timeout_min..=cfg.primary_timeout_max)
    } else if cfg.enable_subleader && subleader_rank.is_some() {
        rng.gen_range(cfg.secondary_timeout_min..=cfg.secondary_timeout_max)
    } else {
        let id_offset = (id as usize % total_nodes.max(1)) as f64 * 0.15;
        rng.gen_range((cfg.follower_timeout_min + id_offset)..=(cfg.follower_timeout_max + id_offset))
    };

    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_bracket_is_offset_by_node_id() {
        let cfg = Config::default();
        for _ in 0..50 {
            let t0 = election_timeout(&cfg, 0, 5, false, None);
            let t3 = election_timeout(&cfg, 3, 5, false, None);
            assert!(t0.as_secs_f64() >= cfg.election_timeout_base);
            assert!(t3.as_secs_f64() >= cfg.election_timeout_base + 3.0 * 0.05);
        }
    }

    #[test]
    fn primary_subleader_times_out_before_secondary_which_times_out_before_follower() {
        let cfg = Config::default();
        for _ in 0..200 {
            let primary = election_timeout(&cfg, 1, 5, true, Some(0)).as_secs_f64();
            let secondary = election_timeout(&cfg, 2, 5, true, Some(1)).as_secs_f64();
            let follower = election_timeout(&cfg, 4, 5, true, None).as_secs_f64();
            assert!(primary <= cfg.primary_timeout_max);
            assert!(secondary >= cfg.secondary_timeout_min);
            assert!(follower >= cfg.follower_timeout_min);
            // brackets don't overlap by construction
            assert!(cfg.primary_timeout_max <= cfg.secondary_timeout_min);
            assert!(cfg.secondary_timeout_max <= cfg.follower_timeout_min);
        }
    }
}
