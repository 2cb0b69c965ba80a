//! In-process performance counters: election/promotion timing, request
//! latency, leader churn. No export sink (JSON/CSV dumps are out of scope);
//! `summary()` is the only way the numbers leave this module.

use std::sync::Mutex;
use std::time::Instant;

use crate::types::{NodeId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMethod {
    InstantPromotion,
    Voting,
}

struct ElectionRecord {
    duration_secs: f64,
    method: ElectionMethod,
}

struct PromotionFailureRecord {
    #[allow(dead_code)]
    node_id: NodeId,
    #[allow(dead_code)]
    term: Term,
}

struct LatencyRecord {
    latency_secs: f64,
    success: bool,
}

#[derive(Debug, Default)]
struct Inner {
    election_times: Vec<ElectionRecord>,
    promotion_failures: Vec<PromotionFailureRecord>,
    leader_failures: usize,
    latencies: Vec<LatencyRecord>,
}

impl std::fmt::Debug for ElectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionRecord")
            .field("duration_secs", &self.duration_secs)
            .field("method", &self.method)
            .finish()
    }
}

impl std::fmt::Debug for PromotionFailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionFailureRecord").finish()
    }
}

impl std::fmt::Debug for LatencyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyRecord")
            .field("latency_secs", &self.latency_secs)
            .field("success", &self.success)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub total_elections: usize,
    pub instant_promotions: usize,
    pub voting_elections: usize,
    pub promotion_failures: usize,
    pub leader_failures: usize,
    pub total_requests: usize,
    pub successful_requests: usize,
    pub avg_election_time_ms: f64,
    pub avg_instant_promotion_ms: f64,
    pub avg_voting_election_ms: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Collects the counters a cluster operator cares about: how the leader
/// changed hands (fast path vs full vote) and how fast, and how client
/// requests fared. Guarded by one mutex since writes are rare relative to
/// the consensus hot path and never need to block it.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    start: Option<Instant>,
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector { start: Some(Instant::now()), inner: Mutex::new(Inner::default()) }
    }

    pub fn record_election(&self, duration_secs: f64, _winner_id: NodeId, method: ElectionMethod) {
        self.inner.lock().unwrap().election_times.push(ElectionRecord { duration_secs, method });
    }

    pub fn record_promotion_failure(&self, node_id: NodeId, term: Term, ack_count: usize, required: usize) {
        log::debug!(
            "sub-leader promotion failed: node={node_id} term={term} acks={ack_count}/{required}"
        );
        self.inner.lock().unwrap().promotion_failures.push(PromotionFailureRecord { node_id, term });
    }

    pub fn record_request_latency(&self, latency_secs: f64, success: bool) {
        self.inner.lock().unwrap().latencies.push(LatencyRecord { latency_secs, success });
    }

    pub fn record_leader_failure(&self, old_leader_id: NodeId, term: Term) {
        log::warn!("leader failure observed: old_leader={old_leader_id} term={term}");
        self.inner.lock().unwrap().leader_failures += 1;
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().unwrap();

        let instant: Vec<f64> = inner
            .election_times
            .iter()
            .filter(|e| e.method == ElectionMethod::InstantPromotion)
            .map(|e| e.duration_secs * 1000.0)
            .collect();
        let voting: Vec<f64> = inner
            .election_times
            .iter()
            .filter(|e| e.method == ElectionMethod::Voting)
            .map(|e| e.duration_secs * 1000.0)
            .collect();
        let all_elections: Vec<f64> =
            inner.election_times.iter().map(|e| e.duration_secs * 1000.0).collect();

        let mut latencies: Vec<f64> =
            inner.latencies.iter().map(|r| r.latency_secs * 1000.0).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p50 = if latencies.is_empty() {
            0.0
        } else {
            latencies[latencies.len() / 2]
        };
        let p99 = if latencies.len() >= 100 {
            latencies[(latencies.len() as f64 * 0.99) as usize]
        } else {
            latencies.last().copied().unwrap_or(0.0)
        };

        MetricsSummary {
            total_elections: inner.election_times.len(),
            instant_promotions: instant.len(),
            voting_elections: voting.len(),
            promotion_failures: inner.promotion_failures.len(),
            leader_failures: inner.leader_failures,
            total_requests: inner.latencies.len(),
            successful_requests: inner.latencies.iter().filter(|r| r.success).count(),
            avg_election_time_ms: mean(&all_elections),
            avg_instant_promotion_ms: mean(&instant),
            avg_voting_election_ms: mean(&voting),
            avg_latency_ms: mean(&latencies),
            p50_latency_ms: p50,
            p99_latency_ms: p99,
        }
    }

    pub fn log_summary(&self) {
        let s = self.summary();
        log::info!(
            "elections={} (instant={}, voting={}, promotion_failures={}) leader_failures={} \
             requests={}/{} ok avg_election={:.2}ms avg_latency={:.2}ms p50={:.2}ms p99={:.2}ms",
            s.total_elections,
            s.instant_promotions,
            s.voting_elections,
            s.promotion_failures,
            s.leader_failures,
            s.successful_requests,
            s.total_requests,
            s.avg_election_time_ms,
            s.avg_latency_ms,
            s.p50_latency_ms,
            s.p99_latency_ms,
        );
    }

    pub fn uptime_secs(&self) -> f64 {
        self.start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_empty_when_nothing_recorded() {
        let m = MetricsCollector::new();
        let s = m.summary();
        assert_eq!(s.total_elections, 0);
        assert_eq!(s.avg_latency_ms, 0.0);
        assert_eq!(s.p99_latency_ms, 0.0);
    }

    #[test]
    fn summary_splits_instant_promotions_from_voting_elections() {
        let m = MetricsCollector::new();
        m.record_election(0.01, 1, ElectionMethod::InstantPromotion);
        m.record_election(0.20, 2, ElectionMethod::Voting);
        let s = m.summary();
        assert_eq!(s.total_elections, 2);
        assert_eq!(s.instant_promotions, 1);
        assert_eq!(s.voting_elections, 1);
        assert!(s.avg_instant_promotion_ms < s.avg_voting_election_ms);
    }

    #[test]
    fn p99_falls_back_to_max_under_a_hundred_samples() {
        let m = MetricsCollector::new();
        for i in 1..=10 {
            m.record_request_latency(i as f64 / 1000.0, true);
        }
        let s = m.summary();
        assert_eq!(s.p99_latency_ms, 10.0);
    }

    #[test]
    fn failed_requests_are_counted_but_not_marked_successful() {
        let m = MetricsCollector::new();
        m.record_request_latency(0.001, true);
        m.record_request_latency(0.001, false);
        let s = m.summary();
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.successful_requests, 1);
    }
}
