//! The three-way role state machine (spec.md §4.6): follower, candidate,
//! leader. Each role's handlers are written as near-pure functions over
//! explicit state (log, current term, membership) that return a batch of
//! side effects, mirroring the teacher's `Tick` accumulator
//! (`dennisss-repo/pkg/raft/src/consensus.rs`) so the coordinator's single
//! dispatcher thread (spec.md §5) can apply them without any role code
//! blocking or reaching past its own state.

pub mod candidate;
pub mod follower;
pub mod leader;

use crate::proto::{Message, ServerId};

pub use candidate::CandidateState;
pub use follower::FollowerState;
pub use leader::{LeaderState, PeerState};

pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
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

    pub fn as_follower_mut(&mut self) -> Option<&mut FollowerState> {
        match self {
            Role::Follower(f) => Some(f),
            _ => None,
        }
    }
}

/// Side effects accumulated by a single role handler call, drained by the
/// coordinator's dispatcher (spec.md §4.8, §5).
#[derive(Default)]
pub struct Effects {
    pub outgoing: Vec<(ServerId, Message)>,
    /// The persistent scalar metadata (term/votedFor/...) changed and must
    /// be durably written before any outgoing message tied to it is sent.
    pub persist_meta: bool,
    pub reset_election_timer: bool,
    /// Set when a log entry was appended locally; the coordinator uses this
    /// to trigger rebasing of rebasable transactions (spec.md §4.6.4).
    pub new_entry_appended: bool,
    /// Set when the current role must revert to follower (higher term
    /// seen, or leader removed itself via a committed config change).
    pub step_down: bool,
}

impl Effects {
    pub fn send(&mut self, to: ServerId, msg: Message) {
        self.outgoing.push((to, msg));
    }
}

/// `majority` of a cluster with `size` members.
pub fn quorum_size(size: usize) -> usize {
    size / 2 + 1
}
