//! The consensus node: Raft leader election and log replication plus the
//! S-Raft sub-leader instant-promotion fast path.
//!
//! One `RaftNode` runs on a single thread (`run`): it blocks on
//! `transport.receive(timeout)`, handles whatever arrived, checks its
//! timers, and sleeps one tick. All state lives behind one mutex so there
//! is never a question of which lock order to take.

pub mod role;
pub mod subleader;
pub mod timers;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::Config;
use crate::message::{Message, MessageData, MessageType};
use crate::metrics::{ElectionMethod, MetricsCollector};
use crate::transport::Transport;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

pub use role::{CandidateState, FollowerState, LeaderState, Role};

/// Application hooks the core calls on role transitions and commit.
/// Default bodies are no-ops so an application overrides only what it uses.
pub trait StateMachine: Send + Sync {
    fn on_become_leader(&self) {}
    fn on_become_follower(&self) {}
    fn on_log_committed(&self, _entry: &LogEntry) {}
}

pub struct NoopStateMachine;
impl StateMachine for NoopStateMachine {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeStats {
    pub elections_started: u64,
    pub votes_received_total: u64,
    pub became_leader_count: u64,
    pub became_subleader_count: u64,
    pub instant_promotions: u64,
    pub promotion_successes: u64,
    pub promotion_failures: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub role: String,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub is_sub_leader: bool,
    pub subleader_rank: Option<u8>,
    pub log_length: usize,
    pub commit_index: LogIndex,
}

struct NodeState {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_id: Option<NodeId>,
    had_leader_before: bool,

    response_times: HashMap<NodeId, f64>,
    message_sent_times: HashMap<NodeId, Instant>,

    last_heartbeat: Instant,
    election_timeout: Duration,
    consecutive_election_failures: u32,

    startup_time: Instant,
    startup_grace_period: bool,

    stats: NodeStats,
}

impl NodeState {
    fn new(cfg: &Config, id: NodeId, total_nodes: usize) -> Self {
        let now = Instant::now();
        let election_timeout = timers::election_timeout(cfg, id, total_nodes, false, None);
        NodeState {
            role: Role::Follower(FollowerState::default()),
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            had_leader_before: false,
            response_times: HashMap::new(),
            message_sent_times: HashMap::new(),
            last_heartbeat: now,
            election_timeout,
            consecutive_election_failures: 0,
            startup_time: now,
            startup_grace_period: true,
            stats: NodeStats::default(),
        }
    }
}

pub struct RaftNode<T: Transport> {
    id: NodeId,
    total_nodes: usize,
    config: Config,
    transport: Arc<T>,
    metrics: Arc<MetricsCollector>,
    sink: Arc<dyn StateMachine>,
    state: Mutex<NodeState>,
    running: AtomicBool,
}

impl<T: Transport> RaftNode<T> {
    pub fn new(
        id: NodeId,
        total_nodes: usize,
        config: Config,
        transport: Arc<T>,
        metrics: Arc<MetricsCollector>,
        sink: Arc<dyn StateMachine>,
    ) -> Arc<Self> {
        let state = NodeState::new(&config, id, total_nodes);
        log::info!(
            "node {id} initialized, election timeout {:.0}ms",
            state.election_timeout.as_secs_f64() * 1000.0
        );
        Arc::new(RaftNode {
            id,
            total_nodes,
            config,
            transport,
            metrics,
            sink,
            state: Mutex::new(state),
            running: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Blocking main loop: one receive, one timer check, one tick sleep.
    pub fn run(self: &Arc<Self>) {
        log::info!("node {} started running", self.id);
        {
            let mut state = self.state.lock().unwrap();
            state.last_heartbeat = Instant::now();
        }
        let recv_timeout = Duration::from_secs_f64(self.config.recv_timeout);
        let tick_sleep = Duration::from_secs_f64(self.config.auto_tick_period);
        while self.running.load(Ordering::Relaxed) {
            if let Some(msg) = self.transport.receive(recv_timeout) {
                self.handle_message(msg);
            }
            self.tick();
            std::thread::sleep(tick_sleep);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.role = Role::Stopped;
        log::info!("node {} stopped", self.id);
    }

    pub fn submit_command(&self, command: serde_json::Value) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(state.role, Role::Leader(_)) {
            return false;
        }
        let index = state.log.len() as LogIndex + 1;
        let term = state.current_term;
        state.log.push(LogEntry::new(term, command, index));
        true
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state.lock().unwrap().role, Role::Leader(_))
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().unwrap().leader_id
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock().unwrap();
        let (is_sub_leader, subleader_rank) = match state.role.as_follower() {
            Some(f) => (f.is_sub_leader, f.subleader_rank),
            None => (false, None),
        };
        NodeSnapshot {
            id: self.id,
            role: state.role.name().to_string(),
            term: state.current_term,
            leader_id: state.leader_id,
            is_sub_leader,
            subleader_rank,
            log_length: state.log.len(),
            commit_index: state.commit_index,
        }
    }

    pub fn stats(&self) -> NodeStats {
        self.state.lock().unwrap().stats
    }

    /// The term recorded at a 1-based log index, if that slot is occupied.
    /// Lets a caller confirm a committed entry's `(index, term)` never
    /// changes underneath it across a leadership change.
    pub fn log_term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return None;
        }
        let state = self.state.lock().unwrap();
        state.log.get(index as usize - 1).map(|e| e.term)
    }

    // ===== timer-driven transitions =====

    fn tick(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        enum Kind {
            Leader,
            PromotionCandidate,
            ElectionCandidate,
            Follower,
            Stopped,
        }
        let kind = match &state.role {
            Role::Leader(_) => Kind::Leader,
            Role::Candidate(c) if c.is_promotion() => Kind::PromotionCandidate,
            Role::Candidate(_) => Kind::ElectionCandidate,
            Role::Follower(_) => Kind::Follower,
            Role::Stopped => Kind::Stopped,
        };

        match kind {
            Kind::Leader => {
                let lease_timeout =
                    Duration::from_secs_f64((self.config.heartbeat_interval * 30.0).max(3.0));
                let last_majority_ack = state.role.as_leader().unwrap().last_majority_ack;
                if now.saturating_duration_since(last_majority_ack) > lease_timeout {
                    self.step_down_to_follower(&mut state, "leader lease expired");
                    return;
                }
                let heartbeat_interval = Duration::from_secs_f64(self.config.heartbeat_interval);
                if now.saturating_duration_since(state.last_heartbeat) >= heartbeat_interval {
                    self.send_append_entries(&mut state);
                }
            }
            Kind::PromotionCandidate => {
                self.check_promotion_success(&mut state);
            }
            Kind::ElectionCandidate => {}
            Kind::Follower => {
                if state.startup_grace_period {
                    let grace = Duration::from_secs_f64(self.config.startup_grace_duration);
                    if now.saturating_duration_since(state.startup_time) < grace {
                        state.last_heartbeat = now;
                        return;
                    }
                    state.startup_grace_period = false;
                    log::debug!("node {} startup grace period ended", self.id);
                }
                if now.saturating_duration_since(state.last_heartbeat) >= state.election_timeout {
                    let is_sub_leader =
                        state.role.as_follower().map(|f| f.is_sub_leader).unwrap_or(false);
                    if self.config.enable_subleader && is_sub_leader {
                        self.instant_promotion(&mut state);
                    } else {
                        self.start_election(&mut state);
                    }
                }
            }
            Kind::Stopped => {}
        }
    }

    fn instant_promotion(&self, state: &mut NodeState) {
        let connected = self.transport.connected_count();
        if connected < 2 {
            log::debug!("node {} instant promotion skipped: {connected} connections", self.id);
            state.last_heartbeat = Instant::now();
            state.election_timeout = self.next_timeout(state) + jittered(0.5, 1.0);
            return;
        }

        let old_rank = state.role.as_follower().and_then(|f| f.subleader_rank);
        state.role = Role::Candidate(CandidateState::Promotion {
            ack_nodes: HashSet::from([self.id]),
            start: Instant::now(),
        });
        state.current_term += 1;
        state.voted_for = Some(self.id);
        state.leader_id = None;
        state.had_leader_before = true;
        state.stats.instant_promotions += 1;

        log::info!(
            "node {} instant promotion: {} sub-leader -> candidate, term {}, connected {}/{}",
            self.id,
            if old_rank == Some(0) { "primary" } else { "secondary" },
            state.current_term,
            connected,
            self.total_nodes,
        );

        self.send_append_entries(state);
        state.last_heartbeat = Instant::now();
    }

    fn start_election(&self, state: &mut NodeState) {
        if state.consecutive_election_failures >= 3 {
            let backoff =
                (2f64.powi(state.consecutive_election_failures as i32 - 2) * 0.1).min(3.0);
            state.last_heartbeat = Instant::now();
            state.election_timeout = self.next_timeout(state) + Duration::from_secs_f64(backoff);
            state.consecutive_election_failures += 1;
            if state.consecutive_election_failures > 8 {
                state.consecutive_election_failures = 0;
            }
            log::debug!("node {} election backoff {:.0}ms", self.id, backoff * 1000.0);
            return;
        }

        let connected = self.transport.connected_count();
        if connected < 2 {
            state.consecutive_election_failures += 1;
            state.last_heartbeat = Instant::now();
            state.election_timeout = self.next_timeout(state) + jittered(0.5, 1.0);
            log::debug!("node {} pre-vote failed: {connected} connections", self.id);
            return;
        }

        state.role = Role::Candidate(CandidateState::Election {
            voted_nodes: HashSet::from([self.id]),
            start: Instant::now(),
        });
        state.current_term += 1;
        state.voted_for = Some(self.id);
        state.stats.elections_started += 1;

        let kind = if !state.had_leader_before { "initial" } else { "fallback" };
        log::info!(
            "node {} starting {kind} election, term {}, connected {}/{}",
            self.id,
            state.current_term,
            connected,
            self.total_nodes
        );

        let last_log_index = state.log.len() as LogIndex;
        let last_log_term = state.log.last().map(|e| e.term).unwrap_or(0);
        for peer in 0..self.total_nodes as NodeId {
            if peer != self.id {
                let msg =
                    Message::request_vote(self.id, state.current_term, last_log_index, last_log_term);
                self.transport.send(peer, msg);
            }
        }

        state.last_heartbeat = Instant::now();
        state.election_timeout = self.next_timeout(state) + jittered(0.0, 0.1);
        state.consecutive_election_failures += 1;
    }

    fn check_promotion_success(&self, state: &mut NodeState) {
        let majority = self.total_nodes / 2 + 1;
        let (ack_count, elapsed) = match &state.role {
            Role::Candidate(CandidateState::Promotion { ack_nodes, start }) => {
                (ack_nodes.len(), start.elapsed().as_secs_f64())
            }
            _ => return,
        };
        if ack_count >= majority {
            self.become_leader_from_promotion(state);
        } else if elapsed > self.config.promotion_timeout {
            state.stats.promotion_failures += 1;
            log::warn!(
                "node {} instant promotion failed: {ack_count}/{} acks (need {majority})",
                self.id,
                self.total_nodes
            );
            self.metrics.record_promotion_failure(self.id, state.current_term, ack_count, majority);
            self.step_down_to_follower(state, "promotion timeout");
        }
    }

    /// Election timeout recomputed for the node's current standing
    /// (sub-leader rank if it still holds one, bracket otherwise).
    fn next_timeout(&self, state: &NodeState) -> Duration {
        let rank = state.role.as_follower().and_then(|f| f.subleader_rank);
        timers::election_timeout(&self.config, self.id, self.total_nodes, state.had_leader_before, rank)
    }

    fn step_down_to_follower(&self, state: &mut NodeState, reason: &str) {
        if !matches!(state.role, Role::Follower(_)) {
            log::info!("node {} stepping down to follower: {reason}", self.id);
        }
        state.role = Role::Follower(FollowerState::default());
        state.voted_for = None;
        state.leader_id = None;
        state.last_heartbeat = Instant::now();
        state.election_timeout = self.next_timeout(state);
        self.sink.on_become_follower();
    }

    fn become_leader_from_promotion(&self, state: &mut NodeState) {
        let elapsed = match &state.role {
            Role::Candidate(CandidateState::Promotion { start, .. }) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        };

        state.stats.promotion_successes += 1;
        state.stats.became_leader_count += 1;
        state.consecutive_election_failures = 0;
        state.leader_id = Some(self.id);

        let now = Instant::now();
        state.role = Role::Leader(LeaderState::new(self.id, self.total_nodes, state.log.len() as LogIndex, now));

        log::info!(
            "node {} instant promotion succeeded in {:.1}ms (term {})",
            self.id,
            elapsed * 1000.0,
            state.current_term
        );

        self.metrics.record_election(elapsed, self.id, ElectionMethod::InstantPromotion);
        self.sink.on_become_leader();
        self.send_append_entries(state);
    }

    fn become_leader_from_election(&self, state: &mut NodeState) {
        let elapsed = match &state.role {
            Role::Candidate(CandidateState::Election { start, .. }) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        };

        state.stats.became_leader_count += 1;
        state.had_leader_before = true;
        state.consecutive_election_failures = 0;
        state.leader_id = Some(self.id);

        let now = Instant::now();
        state.role = Role::Leader(LeaderState::new(self.id, self.total_nodes, state.log.len() as LogIndex, now));

        log::info!(
            "node {} won election in {:.1}ms (term {})",
            self.id,
            elapsed * 1000.0,
            state.current_term
        );

        self.metrics.record_election(elapsed, self.id, ElectionMethod::Voting);
        self.sink.on_become_leader();
        self.send_append_entries(state);
    }

    // ===== message handling =====

    fn handle_message(&self, msg: Message) {
        let mut state = self.state.lock().unwrap();
        if msg.term > state.current_term {
            state.current_term = msg.term;
            self.step_down_to_follower(&mut state, "higher term discovered");
        }
        match msg.message_type {
            MessageType::AppendEntries => self.handle_append_entries(&mut state, msg),
            MessageType::AppendAck => self.handle_append_ack(&mut state, msg),
            MessageType::RequestVote => self.handle_request_vote(&mut state, msg),
            MessageType::VoteResponse => self.handle_vote_response(&mut state, msg),
            MessageType::ClientRequest | MessageType::ClientResponse => {}
        }
    }

    fn handle_append_entries(&self, state: &mut NodeState, msg: Message) {
        let data = match msg.data {
            MessageData::AppendEntries(d) => d,
            _ => return,
        };

        if msg.term < state.current_term {
            let ack = Message::append_ack(self.id, state.current_term, false, 0);
            self.transport.send(msg.sender_id, ack);
            return;
        }

        state.last_heartbeat = Instant::now();
        state.consecutive_election_failures = 0;
        state.startup_grace_period = false;

        let was_sub_leader = state.role.as_follower().map(|f| f.is_sub_leader).unwrap_or(false);
        state.role = Role::Follower(FollowerState::default());
        state.current_term = msg.term;
        state.leader_id = Some(msg.sender_id);

        if !state.had_leader_before {
            state.had_leader_before = true;
            state.election_timeout =
                timers::election_timeout(&self.config, self.id, self.total_nodes, true, None);
        }

        if self.config.enable_subleader {
            let is_sub_leader = data.sub_leaders.contains_key(&self.id);
            let subleader_rank = data.sub_leaders.get(&self.id).copied();
            if let Role::Follower(f) = &mut state.role {
                f.is_sub_leader = is_sub_leader;
                f.subleader_rank = subleader_rank;
            }
            if is_sub_leader && !was_sub_leader {
                state.stats.became_subleader_count += 1;
                log::info!("node {} designated sub-leader rank {:?}", self.id, subleader_rank);
            }
            state.election_timeout =
                timers::election_timeout(&self.config, self.id, self.total_nodes, true, subleader_rank);
        }

        let prev_log_index = data.prev_log_index;
        let prev_log_term = data.prev_log_term;

        let mut log_ok = true;
        if prev_log_index > 0 {
            if prev_log_index as usize > state.log.len() {
                log_ok = false;
            } else if state.log[prev_log_index as usize - 1].term != prev_log_term {
                log_ok = false;
                state.log.truncate(prev_log_index as usize - 1);
            }
        }

        if !log_ok {
            let ack = Message::append_ack(self.id, state.current_term, false, state.log.len() as LogIndex);
            self.transport.send(msg.sender_id, ack);
            return;
        }

        if !data.entries.is_empty() {
            state.log.truncate(prev_log_index as usize);
            state.log.extend(data.entries);
        }

        if data.leader_commit > state.commit_index {
            state.commit_index = data.leader_commit.min(state.log.len() as LogIndex);
            self.apply_committed_entries(state);
        }

        let ack = Message::append_ack(self.id, state.current_term, true, state.log.len() as LogIndex);
        self.transport.send(msg.sender_id, ack);
    }

    fn handle_append_ack(&self, state: &mut NodeState, msg: Message) {
        if !matches!(state.role, Role::Leader(_) | Role::Candidate(_)) {
            return;
        }
        if msg.term > state.current_term {
            self.step_down_to_follower(state, "higher term in ack");
            return;
        }
        if msg.term < state.current_term {
            return;
        }

        let data = match msg.data {
            MessageData::AppendAck(d) => d,
            _ => return,
        };
        let sender_id = msg.sender_id;
        let success = data.success;

        let is_promotion_pending = matches!(&state.role, Role::Candidate(c) if c.is_promotion());

        if !success {
            if let Role::Leader(l) = &mut state.role {
                if let Some(idx) = l.next_index.get_mut(&sender_id) {
                    *idx = (*idx).saturating_sub(1).max(1);
                }
            }
            return;
        }

        let mut became_leader = false;
        if is_promotion_pending {
            if let Role::Candidate(CandidateState::Promotion { ack_nodes, .. }) = &mut state.role {
                if ack_nodes.insert(sender_id) {
                    let majority = self.total_nodes / 2 + 1;
                    log::debug!(
                        "node {} promotion ack from {sender_id}: {}/{} (need {majority})",
                        self.id,
                        ack_nodes.len(),
                        self.total_nodes
                    );
                    if ack_nodes.len() >= majority {
                        became_leader = true;
                    }
                }
            }
        }
        if became_leader {
            self.become_leader_from_promotion(state);
        }

        if let Role::Leader(l) = &mut state.role {
            l.recent_ack_nodes.insert(sender_id);
            if let Some(mi) = l.match_index.get_mut(&sender_id) {
                *mi = (*mi).max(data.match_index);
                l.next_index.insert(sender_id, *mi + 1);
            }
            let majority = self.total_nodes / 2 + 1;
            if l.recent_ack_nodes.len() >= majority {
                l.last_majority_ack = Instant::now();
            }
            self.advance_leader_commit_index(state);
        }

        if let Some(sent_at) = state.message_sent_times.get(&sender_id).copied() {
            let rtt = sent_at.elapsed().as_secs_f64();
            let alpha = self.config.rtt_alpha;
            let updated = match state.response_times.get(&sender_id) {
                Some(&prev) => alpha * rtt + (1.0 - alpha) * prev,
                None => rtt,
            };
            state.response_times.insert(sender_id, updated);
        }
    }

    fn handle_request_vote(&self, state: &mut NodeState, msg: Message) {
        let data = match msg.data {
            MessageData::RequestVote(d) => d,
            _ => return,
        };
        let mut grant = false;

        if msg.term > state.current_term {
            state.current_term = msg.term;
            state.voted_for = None;
            state.role = Role::Follower(FollowerState::default());
        }

        if msg.term >= state.current_term {
            let leader_same_term = matches!(state.role, Role::Leader(_)) && msg.term == state.current_term;
            if leader_same_term {
                grant = false;
            } else if state.voted_for.is_none() || state.voted_for == Some(msg.sender_id) {
                let last_log_index = state.log.len() as LogIndex;
                let last_log_term = state.log.last().map(|e| e.term).unwrap_or(0);
                let up_to_date = data.last_log_term > last_log_term
                    || (data.last_log_term == last_log_term && data.last_log_index >= last_log_index);
                if up_to_date {
                    state.voted_for = Some(msg.sender_id);
                    grant = true;
                    state.last_heartbeat = Instant::now();
                }
            }
        }

        let response = Message::vote_response(self.id, state.current_term, grant);
        self.transport.send(msg.sender_id, response);
    }

    fn handle_vote_response(&self, state: &mut NodeState, msg: Message) {
        if !matches!(&state.role, Role::Candidate(CandidateState::Election { .. })) {
            return;
        }
        if msg.term > state.current_term {
            self.step_down_to_follower(state, "higher term in vote response");
            return;
        }
        if msg.term < state.current_term {
            return;
        }

        let data = match msg.data {
            MessageData::VoteResponse(d) => d,
            _ => return,
        };
        if !data.vote_granted {
            return;
        }

        let mut became_leader = false;
        if let Role::Candidate(CandidateState::Election { voted_nodes, .. }) = &mut state.role {
            if voted_nodes.insert(msg.sender_id) {
                state.stats.votes_received_total += 1;
                let count = voted_nodes.len();
                log::debug!("node {} vote from {}: {count}/{}", self.id, msg.sender_id, self.total_nodes);
                if count * 2 > self.total_nodes {
                    became_leader = true;
                }
            }
        }
        if became_leader {
            self.become_leader_from_election(state);
        }
    }

    fn apply_committed_entries(&self, state: &mut NodeState) {
        while state.last_applied < state.commit_index {
            state.last_applied += 1;
            if let Some(entry) = state.log.get(state.last_applied as usize - 1) {
                self.sink.on_log_committed(entry);
            }
        }
    }

    /// Advances the leader's own `commit_index` once a majority of peers'
    /// `match_index` (plus the leader's own fully-replicated log) has
    /// reached it, then applies newly committed entries. The original this
    /// was ported from only ever advanced `commit_index` on followers via
    /// `leader_commit` in AppendEntries — the leader itself never applied
    /// its own committed entries. Fixed here via the standard Raft rule:
    /// only commit an index whose entry was written in the current term.
    fn advance_leader_commit_index(&self, state: &mut NodeState) {
        let current_term = state.current_term;
        let log_len = state.log.len() as LogIndex;
        let majority = self.total_nodes / 2 + 1;

        let candidate = match &state.role {
            Role::Leader(l) => {
                let mut match_indices: Vec<LogIndex> = l.match_index.values().copied().collect();
                match_indices.push(log_len);
                match_indices.sort_unstable_by(|a, b| b.cmp(a));
                match_indices.get(majority - 1).copied()
            }
            _ => None,
        };

        if let Some(candidate) = candidate {
            if candidate > state.commit_index
                && candidate > 0
                && (candidate as usize) <= state.log.len()
                && state.log[candidate as usize - 1].term == current_term
            {
                state.commit_index = candidate;
                self.apply_committed_entries(state);
            }
        }
    }

    fn compute_subleader_map(&self, state: &mut NodeState) -> BTreeMap<NodeId, u8> {
        if !self.config.enable_subleader {
            return BTreeMap::new();
        }
        let count = self.config.subleader_count(self.total_nodes);
        let response_times = state.response_times.clone();
        match &mut state.role {
            Role::Leader(l) => {
                if l.subleaders_assigned {
                    l.sub_leaders.clone()
                } else if count > 0 && response_times.len() >= count {
                    let assigned = subleader::assign(&response_times, count);
                    l.sub_leaders = assigned.clone();
                    l.subleaders_assigned = true;
                    log::info!("node {} assigned sub-leaders: {assigned:?}", self.id);
                    assigned
                } else {
                    BTreeMap::new()
                }
            }
            _ => BTreeMap::new(),
        }
    }

    fn send_append_entries(&self, state: &mut NodeState) {
        let subleader_map = self.compute_subleader_map(state);
        let is_promotion_pending = matches!(&state.role, Role::Candidate(c) if c.is_promotion());
        let now = Instant::now();

        if let Role::Leader(l) = &mut state.role {
            l.recent_ack_nodes = HashSet::from([self.id]);
        }

        if is_promotion_pending {
            let leader_commit = state.log.len() as LogIndex;
            for peer in 0..self.total_nodes as NodeId {
                if peer == self.id {
                    continue;
                }
                let msg = Message::append_entries(
                    self.id,
                    state.current_term,
                    0,
                    0,
                    Vec::new(),
                    leader_commit,
                    subleader_map.clone(),
                );
                state.message_sent_times.insert(peer, now);
                self.transport.send(peer, msg);
            }
        } else {
            let current_term = state.current_term;
            let commit_index = state.commit_index;
            let log = state.log.clone();
            let next_indices: Vec<(NodeId, LogIndex)> = match &state.role {
                Role::Leader(l) => (0..self.total_nodes as NodeId)
                    .filter(|i| *i != self.id)
                    .map(|i| (i, *l.next_index.get(&i).unwrap_or(&(log.len() as LogIndex + 1))))
                    .collect(),
                _ => Vec::new(),
            };

            for (peer, next_idx) in next_indices {
                let prev_log_index = next_idx.saturating_sub(1);
                let prev_log_term = if prev_log_index > 0 && (prev_log_index as usize) <= log.len() {
                    log[prev_log_index as usize - 1].term
                } else {
                    0
                };

                let entries: Vec<LogEntry> = if (next_idx as usize) <= log.len() {
                    let start = next_idx as usize - 1;
                    let end = (next_idx as usize + 99).min(log.len());
                    log[start..end].to_vec()
                } else {
                    Vec::new()
                };

                let msg = Message::append_entries(
                    self.id,
                    current_term,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    commit_index,
                    subleader_map.clone(),
                );
                state.message_sent_times.insert(peer, now);
                self.transport.send(peer, msg);
            }
        }

        state.last_heartbeat = now;
    }
}

fn jittered(min: f64, max: f64) -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use std::sync::Arc as StdArc;

    fn fast_config() -> Config {
        Config {
            heartbeat_interval: 0.01,
            election_timeout_base: 0.03,
            primary_timeout_min: 0.03,
            primary_timeout_max: 0.04,
            secondary_timeout_min: 0.05,
            secondary_timeout_max: 0.06,
            follower_timeout_min: 0.07,
            follower_timeout_max: 0.09,
            promotion_timeout: 0.05,
            recv_timeout: 0.005,
            auto_tick_period: 0.001,
            startup_grace_duration: 0.0,
            ..Config::default()
        }
    }

    fn spawn_cluster(n: usize) -> Vec<StdArc<RaftNode<ChannelTransport>>> {
        let transports = ChannelTransport::cluster(n);
        let metrics = StdArc::new(MetricsCollector::new());
        transports
            .into_iter()
            .enumerate()
            .map(|(id, t)| {
                RaftNode::new(
                    id as NodeId,
                    n,
                    fast_config(),
                    t,
                    StdArc::clone(&metrics),
                    StdArc::new(NoopStateMachine),
                )
            })
            .collect()
    }

    #[test]
    fn a_lone_candidate_becomes_leader_with_a_three_node_majority() {
        let nodes = spawn_cluster(3);
        let leader = &nodes[0];
        {
            let mut state = leader.state.lock().unwrap();
            state.startup_grace_period = false;
        }
        leader.start_election(&mut leader.state.lock().unwrap());
        assert!(matches!(leader.state.lock().unwrap().role, Role::Candidate(_)));

        let vote = Message::vote_response(1, 1, true);
        leader.handle_message(vote);
        let vote2 = Message::vote_response(2, 1, true);
        leader.handle_message(vote2);

        assert!(leader.is_leader());
        assert_eq!(leader.stats().became_leader_count, 1);
    }

    #[test]
    fn submit_command_fails_on_a_follower() {
        let nodes = spawn_cluster(3);
        assert!(!nodes[0].submit_command(serde_json::json!({"op": "x"})));
    }

    #[test]
    fn leader_commits_once_a_majority_of_peers_ack_the_entry() {
        let nodes = spawn_cluster(3);
        let leader = &nodes[0];
        {
            let mut state = leader.state.lock().unwrap();
            state.role = Role::Leader(LeaderState::new(0, 3, 0, Instant::now()));
            state.current_term = 1;
        }
        assert!(leader.submit_command(serde_json::json!({"op": "set", "value": 1})));

        let ack1 = Message::append_ack(1, 1, true, 1);
        leader.handle_message(ack1);
        // one peer ack + leader's own fully-replicated log == majority of 3
        let snapshot = leader.snapshot();
        assert_eq!(snapshot.commit_index, 1);
    }

    #[test]
    fn a_higher_term_append_entries_steps_a_candidate_down_to_follower() {
        let nodes = spawn_cluster(3);
        let candidate = &nodes[0];
        {
            let mut state = candidate.state.lock().unwrap();
            state.role = Role::Candidate(CandidateState::Election {
                voted_nodes: HashSet::from([0]),
                start: Instant::now(),
            });
            state.current_term = 1;
        }
        let append = Message::append_entries(1, 5, 0, 0, Vec::new(), 0, BTreeMap::new());
        candidate.handle_message(append);
        assert!(matches!(candidate.state.lock().unwrap().role, Role::Follower(_)));
        assert_eq!(candidate.state.lock().unwrap().current_term, 5);
        assert_eq!(candidate.leader_id(), Some(1));
    }
}
