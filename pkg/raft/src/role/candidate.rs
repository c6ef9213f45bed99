//! Candidate role (spec.md §4.6.3).

use std::collections::HashMap;

use crate::log::Log;
use crate::proto::{GrantVote, MessageHeader, RequestVote, ServerId, Term};

use super::{quorum_size, Effects};

pub struct CandidateState {
    pub votes_received: std::collections::HashSet<ServerId>,
}

impl CandidateState {
    /// Starts a new election: increments the term (owned by the
    /// coordinator's persistent metadata, passed in and bumped here),
    /// votes for self, and requests votes from every other member.
    pub fn start_election(
        current_term: &mut Term,
        own_id: &ServerId,
        cluster_id: crate::proto::ClusterId,
        log: &Log,
        members: &HashMap<ServerId, String>,
        effects: &mut Effects,
    ) -> Self {
        *current_term += 1;
        effects.persist_meta = true;
        effects.reset_election_timer = true;

        let last_log_index = log.last_index();
        let last_log_term = log.term_at_index(last_log_index).unwrap_or(0);

        for peer in members.keys() {
            if peer == own_id {
                continue;
            }
            effects.send(
                peer.clone(),
                crate::proto::Message::RequestVote(RequestVote {
                    header: MessageHeader {
                        cluster_id,
                        sender_id: own_id.clone(),
                        recipient_id: peer.clone(),
                        term: *current_term,
                    },
                    last_log_term,
                    last_log_index,
                }),
            );
        }

        let mut votes_received = std::collections::HashSet::new();
        votes_received.insert(own_id.clone());
        CandidateState { votes_received }
    }

    /// Records a granted vote and reports whether a quorum of `members` has
    /// now voted for this candidate.
    pub fn record_vote(&mut self, from: ServerId, grant: &GrantVote, member_count: usize) -> bool {
        if grant.granted {
            self.votes_received.insert(from);
        }
        self.votes_received.len() >= quorum_size(member_count)
    }
}
