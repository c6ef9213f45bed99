//! Follower role (spec.md §4.6.2).

use std::collections::HashSet;
use std::time::Duration;

use crate::log::{Log, LogEntry};
use crate::mutation::Mutation;
use crate::proto::{AppendRequest, AppendResponse, ClusterId, GrantVote, LogIndex, RequestVote, ServerId, Term};
use crate::timestamp::RelativeTimestamp;

use super::Effects;

#[derive(Debug, Clone)]
pub struct ProbingState {
    pub responses: HashSet<ServerId>,
    pub started_at: RelativeTimestamp,
}

#[derive(Default)]
pub struct FollowerState {
    pub leader: Option<ServerId>,
    pub voted_for: Option<ServerId>,
    pub leader_lease_timeout: Option<RelativeTimestamp>,
    pub last_leader_message_time: Option<RelativeTimestamp>,
    /// Present while a snapshot install from the current leader is underway
    /// (spec.md §4.7); any valid `AppendRequest` aborts it.
    pub snapshot_receive_in_progress: bool,
    pub probing: Option<ProbingState>,
}

impl FollowerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_probing(&mut self, now: RelativeTimestamp) {
        self.probing = Some(ProbingState { responses: HashSet::new(), started_at: now });
    }

    pub fn record_ping_response(&mut self, from: ServerId) {
        if let Some(p) = &mut self.probing {
            p.responses.insert(from);
        }
    }

    /// Whether a majority (counting self) of `members` has responded to
    /// probing, per spec.md §4.6.2 "follower probing".
    pub fn probing_quorum_met(&self, member_count: usize) -> bool {
        match &self.probing {
            Some(p) => p.responses.len() + 1 >= super::quorum_size(member_count),
            None => false,
        }
    }

    fn within_min_election_timeout(&self, now: RelativeTimestamp, min_election_timeout: Duration) -> bool {
        match self.last_leader_message_time {
            Some(last) => now.is_before(last.add_millis(min_election_timeout.as_millis() as u32)),
            None => false,
        }
    }

    /// Implements the 6-step `AppendRequest` handling in spec.md §4.6.2.
    /// `commit_index` is the follower's locally-known commit point, updated
    /// in place. Returns the response and, if a conflicting suffix was
    /// discarded, the index it was discarded from (so the coordinator can
    /// fail any open transaction whose base falls in that range, except
    /// UNCOMMITTED ones).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_append_request(
        &mut self,
        log: &mut Log,
        own_id: &ServerId,
        req: &AppendRequest,
        pending_follower_write: Option<&[Mutation]>,
        commit_index: &mut LogIndex,
        now: RelativeTimestamp,
        effects: &mut Effects,
    ) -> (AppendResponse, Option<LogIndex>) {
        self.leader = Some(req.header.sender_id.clone());
        self.last_leader_message_time = Some(now);
        if let Some(timeout) = req.leader_lease_timeout {
            self.leader_lease_timeout = Some(RelativeTimestamp(timeout));
        }
        self.probing = None;
        let aborted_snapshot = self.snapshot_receive_in_progress;
        self.snapshot_receive_in_progress = false;
        let _ = aborted_snapshot;
        effects.reset_election_timer = true;

        let respond = |log: &Log, success: bool, match_index: LogIndex| AppendResponse {
            header: reply_header(own_id, req),
            leader_timestamp: req.leader_timestamp,
            success,
            match_index,
            last_log_index: log.last_index(),
        };

        if req.prev_log_index >= log.last_applied_index()
            && (req.prev_log_index > log.last_index() || log.term_at_index(req.prev_log_index) != Some(req.prev_log_term))
        {
            return (respond(log, false, log.last_applied_index()), None);
        }

        if req.log_entry_term == 0 {
            // Probe: leaderCommit is capped at prevLogIndex on the sender
            // side, nothing further to apply here.
            return (respond(log, true, req.prev_log_index), None);
        }

        let new_index = req.prev_log_index + 1;
        let mut discarded_from = None;

        if let Some(existing) = log.entry_at_index(new_index) {
            if existing.term != req.log_entry_term {
                log.discard_log_entries_from(new_index).ok();
                discarded_from = Some(new_index);
            } else {
                *commit_index = (req.leader_commit.max(*commit_index)).min(log.last_index());
                return (respond(log, true, new_index), discarded_from);
            }
        }

        let mutations = req
            .mutations
            .clone()
            .or_else(|| pending_follower_write.map(|m| m.to_vec()))
            .unwrap_or_default();

        log.append(LogEntry {
            term: req.log_entry_term,
            index: new_index,
            mutations,
            config_change: req.config_change.clone(),
        })
        .ok();
        effects.new_entry_appended = true;

        *commit_index = (req.leader_commit.max(*commit_index)).min(log.last_index());

        (respond(log, true, new_index), discarded_from)
    }

    /// spec.md §4.6.2 `RequestVote` handling.
    pub fn handle_request_vote(
        &mut self,
        log: &Log,
        min_election_timeout: Duration,
        now: RelativeTimestamp,
        req: &RequestVote,
        own_id: &ServerId,
        effects: &mut Effects,
    ) -> GrantVote {
        let header = crate::proto::MessageHeader {
            cluster_id: req.header.cluster_id,
            sender_id: own_id.clone(),
            recipient_id: req.header.sender_id.clone(),
            term: req.header.term,
        };

        if self.within_min_election_timeout(now, min_election_timeout) {
            return GrantVote { header, granted: false };
        }

        let already_voted_other =
            matches!(&self.voted_for, Some(v) if *v != req.header.sender_id);
        if already_voted_other {
            return GrantVote { header, granted: false };
        }

        let our_last_term = log.term_at_index(log.last_index()).unwrap_or(0);
        let candidate_up_to_date = req.last_log_term > our_last_term
            || (req.last_log_term == our_last_term && req.last_log_index >= log.last_index());

        if !candidate_up_to_date {
            return GrantVote { header, granted: false };
        }

        self.voted_for = Some(req.header.sender_id.clone());
        effects.persist_meta = true;
        GrantVote { header, granted: true }
    }

    pub fn adopt_cluster_id(cluster_id: &mut ClusterId, incoming: ClusterId) {
        if *cluster_id == 0 {
            *cluster_id = incoming;
        }
    }
}

fn reply_header(own_id: &ServerId, req: &AppendRequest) -> crate::proto::MessageHeader {
    crate::proto::MessageHeader {
        cluster_id: req.header.cluster_id,
        sender_id: own_id.clone(),
        recipient_id: req.header.sender_id.clone(),
        term: req.header.term,
    }
}
