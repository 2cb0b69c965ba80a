//! The node's role, realized as a tagged enum so a field combination like
//! "promotion pending while Leader" is unrepresentable rather than merely
//! disallowed by convention.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use crate::types::{LogIndex, NodeId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowerState {
    pub is_sub_leader: bool,
    pub subleader_rank: Option<u8>,
}

#[derive(Debug, Clone)]
pub enum CandidateState {
    /// Standard Raft election: broadcast RequestVote, wait for a majority.
    Election { voted_nodes: HashSet<NodeId>, start: Instant },
    /// S-Raft fast path: a sub-leader claims leadership immediately and
    /// waits for a majority of AppendEntries acks to confirm it, instead
    /// of running a vote.
    Promotion { ack_nodes: HashSet<NodeId>, start: Instant },
}

impl CandidateState {
    pub fn vote_count(&self) -> usize {
        match self {
            CandidateState::Election { voted_nodes, .. } => voted_nodes.len(),
            CandidateState::Promotion { ack_nodes, .. } => ack_nodes.len(),
        }
    }

    pub fn start(&self) -> Instant {
        match self {
            CandidateState::Election { start, .. } => *start,
            CandidateState::Promotion { start, .. } => *start,
        }
    }

    pub fn is_promotion(&self) -> bool {
        matches!(self, CandidateState::Promotion { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LeaderState {
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    pub recent_ack_nodes: HashSet<NodeId>,
    pub last_majority_ack: Instant,
    /// Peers this leader has designated as sub-leaders, ranked by RTT.
    pub sub_leaders: BTreeMap<NodeId, u8>,
    pub subleaders_assigned: bool,
    pub leader_elected_time: Instant,
}

impl LeaderState {
    pub fn new(self_id: NodeId, total_nodes: usize, log_len: LogIndex, now: Instant) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for i in 0..total_nodes as NodeId {
            if i != self_id {
                next_index.insert(i, log_len + 1);
                match_index.insert(i, 0);
            }
        }
        LeaderState {
            next_index,
            match_index,
            recent_ack_nodes: HashSet::from([self_id]),
            last_majority_ack: now,
            sub_leaders: BTreeMap::new(),
            subleaders_assigned: false,
            leader_elected_time: now,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Stopped,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "Follower",
            Role::Candidate(_) => "Candidate",
            Role::Leader(_) => "Leader",
            Role::Stopped => "Stopped",
        }
    }

    pub fn as_follower(&self) -> Option<&FollowerState> {
        match self {
            Role::Follower(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_leader(&self) -> Option<&LeaderState> {
        match self {
            Role::Leader(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_leader_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            Role::Leader(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_candidate_mut(&mut self) -> Option<&mut CandidateState> {
        match self {
            Role::Candidate(c) => Some(c),
            _ => None,
        }
    }
}
