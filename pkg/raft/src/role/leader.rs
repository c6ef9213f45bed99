//! Leader role (spec.md §4.6.1).

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::log::{Log, LogEntry};
use crate::mutation::Mutation;
use crate::proto::{AppendRequest, AppendResponse, ClusterId, ConfigChange, LogIndex, MessageHeader, ServerId, Term};
use crate::timestamp::RelativeTimestamp;

use super::Effects;

pub struct PeerState {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub leader_commit_sent: LogIndex,
    pub leader_timestamp_sent: u32,
    pub synced: bool,
    /// Last time (by our relative clock) an `AppendResponse` was received
    /// from this peer; used for the read-lease calculation.
    pub last_response_time: Option<RelativeTimestamp>,
    /// Log indices whose mutation payload can be omitted when replicating
    /// to this peer because it originated the commit itself.
    pub skip_data_log_entries: std::collections::HashSet<LogIndex>,
    /// Set while a snapshot install is underway to this peer (spec.md
    /// §4.6.1's snapshot trigger; actual transfer lives in `crate::snapshot`).
    pub snapshot_transmit: bool,
    pub commit_lease_timeouts: BTreeSet<RelativeTimestamp>,
}

impl PeerState {
    fn new(next_index: LogIndex) -> Self {
        PeerState {
            next_index,
            match_index: 0,
            leader_commit_sent: 0,
            leader_timestamp_sent: 0,
            synced: false,
            last_response_time: None,
            skip_data_log_entries: std::collections::HashSet::new(),
            snapshot_transmit: false,
            commit_lease_timeouts: BTreeSet::new(),
        }
    }
}

pub struct LeaderState {
    pub current_term_start_time: RelativeTimestamp,
    pub peers: HashMap<ServerId, PeerState>,
    /// Highest index replicated to a quorum (including self) at the
    /// current term; a leader may only ever advance this through an entry
    /// from its own term (spec.md §4.6.1).
    pub commit_index: LogIndex,
    /// Whether at least one entry from this term has committed yet; config
    /// changes are refused before this (spec.md §4.6.1).
    pub committed_in_term: bool,
    /// Whether the log currently holds an uncommitted config change.
    pub config_change_pending: bool,
}

impl LeaderState {
    pub fn on_entry(log: &Log, members: &HashMap<ServerId, String>, own_id: &ServerId, now: RelativeTimestamp) -> Self {
        let mut peers = HashMap::new();
        for peer in members.keys() {
            if peer != own_id {
                peers.insert(peer.clone(), PeerState::new(log.last_index() + 1));
            }
        }
        LeaderState {
            current_term_start_time: now,
            peers,
            commit_index: log.last_applied_index(),
            committed_in_term: false,
            config_change_pending: false,
        }
    }

    /// Builds the periodic (or immediate-probe) `AppendRequest` for every
    /// peer, per spec.md §4.6.1: a probe if not yet `synced`, otherwise the
    /// entry at `nextIndex` (if any) with its predecessor's term.
    pub fn heartbeat(
        &mut self,
        log: &Log,
        own_id: &ServerId,
        cluster_id: ClusterId,
        current_term: Term,
        now: RelativeTimestamp,
        lease_duration: Option<Duration>,
        effects: &mut Effects,
    ) {
        for (peer_id, peer) in self.peers.iter_mut() {
            if peer.snapshot_transmit {
                continue;
            }
            let header = MessageHeader {
                cluster_id,
                sender_id: own_id.clone(),
                recipient_id: peer_id.clone(),
                term: current_term,
            };

            let prev_log_index = peer.next_index - 1;
            let prev_log_term = log.term_at_index(prev_log_index).unwrap_or(0);

            let (log_entry_term, mutations, config_change) = if peer.synced {
                match log.entry_at_index(peer.next_index) {
                    Some(entry) => {
                        let mutations = if peer.skip_data_log_entries.contains(&entry.index) {
                            None
                        } else {
                            Some(entry.mutations.clone())
                        };
                        (entry.term, mutations, entry.config_change.clone())
                    }
                    None => (0, None, None),
                }
            } else {
                (0, None, None)
            };

            let leader_commit = if log_entry_term == 0 { self.commit_index.min(prev_log_index) } else { self.commit_index };

            let leader_lease_timeout = lease_duration.map(|d| now.add_millis(d.as_millis() as u32).0);

            peer.leader_timestamp_sent = now.0;
            peer.leader_commit_sent = leader_commit;

            effects.send(
                peer_id.clone(),
                crate::proto::Message::AppendRequest(AppendRequest {
                    header,
                    leader_timestamp: now.0,
                    leader_lease_timeout,
                    leader_commit,
                    prev_log_term,
                    prev_log_index,
                    log_entry_term,
                    mutations,
                    config_change,
                }),
            );
        }
    }

    /// Peers whose `nextIndex` has fallen below the leader's earliest
    /// retained log index can't be caught up by normal replication — that
    /// history is gone (spec.md §4.6.1's snapshot trigger, §4.7). Marks
    /// them so `heartbeat` skips them and returns their ids so the
    /// coordinator (the only place with access to the state-machine store)
    /// can actually stream a snapshot.
    pub fn peers_needing_snapshot(&mut self, log: &Log) -> Vec<ServerId> {
        let first_index = log.first_index();
        let mut needing = Vec::new();
        for (peer_id, peer) in self.peers.iter_mut() {
            if !peer.snapshot_transmit && peer.next_index < first_index {
                peer.snapshot_transmit = true;
            }
            if peer.snapshot_transmit {
                needing.push(peer_id.clone());
            }
        }
        needing
    }

    /// Called once a snapshot transfer to `peer_id` has been sent in full:
    /// resumes normal replication from just past the installed snapshot.
    pub fn mark_snapshot_installed(&mut self, peer_id: &ServerId, snapshot_index: LogIndex) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.snapshot_transmit = false;
            peer.next_index = snapshot_index + 1;
            peer.match_index = snapshot_index;
            peer.synced = true;
        }
    }

    /// Updates peer state from an `AppendResponse`, then recomputes
    /// `commit_index` as the highest index replicated on a quorum
    /// (including self) whose term equals `current_term`.
    pub fn handle_append_response(
        &mut self,
        from: &ServerId,
        resp: &AppendResponse,
        log: &Log,
        current_term: Term,
        now: RelativeTimestamp,
    ) {
        let Some(peer) = self.peers.get_mut(from) else { return };
        // Stale response to a heartbeat we already superseded.
        if resp.leader_timestamp != peer.leader_timestamp_sent {
            return;
        }
        peer.last_response_time = Some(now);

        if resp.success {
            peer.synced = true;
            peer.match_index = resp.match_index;
            peer.next_index = resp.match_index + 1;
        } else {
            peer.synced = false;
            peer.next_index = resp.match_index + 1;
        }

        self.recompute_commit_index(log, current_term);
    }

    /// Exposed `pub(crate)` so the coordinator can re-run this right after
    /// appending its own proposed entry, which matters for a single-node
    /// cluster: there are no peer `AppendResponse`s to trigger it otherwise.
    pub(crate) fn recompute_commit_index(&mut self, log: &Log, current_term: Term) {
        let mut match_indices: Vec<LogIndex> = self.peers.values().map(|p| p.match_index).collect();
        match_indices.push(log.last_index()); // self always matches its own log

        match_indices.sort_unstable();
        let quorum = super::quorum_size(self.peers.len() + 1);
        let candidate = match_indices[match_indices.len() - quorum];

        if candidate > self.commit_index && log.term_at_index(candidate) == Some(current_term) {
            self.commit_index = candidate;
            self.committed_in_term = true;
        }
    }

    /// Appends a new entry carrying `mutations`/`config_change` at the
    /// current term (spec.md §4.6.1 "Read-write transactions"). Caller is
    /// responsible for the conflict check against entries above `base_index`
    /// before calling this.
    pub fn propose_entry(
        &mut self,
        log: &mut Log,
        current_term: Term,
        mutations: Vec<Mutation>,
        config_change: Option<ConfigChange>,
    ) -> crate::error::Result<LogIndex> {
        if config_change.is_some() && self.config_change_pending {
            return Err(crate::error::RaftError::Codec("a config change is already pending".into()));
        }
        let index = log.last_index() + 1;
        log.append(LogEntry { term: current_term, index, mutations, config_change: config_change.clone() })?;
        if config_change.is_some() {
            self.config_change_pending = true;
        }
        Ok(index)
    }

    /// The earliest time at which a heartbeat-majority quorum could have
    /// deposed this leader, per spec.md §4.6.1: the minimum, over some
    /// quorum of peers, of the last time each responded, plus
    /// `minElectionTimeout`, minus a clock-drift adjustment.
    pub fn compute_lease_timeout(
        &self,
        own_id: &ServerId,
        now: RelativeTimestamp,
        min_election_timeout: Duration,
        max_clock_drift: Duration,
    ) -> RelativeTimestamp {
        let mut times: Vec<RelativeTimestamp> = self.peers.values().filter_map(|p| p.last_response_time).collect();
        times.push(now); // self counts as responding to itself right now
        let _ = own_id;
        times.sort();
        let quorum = super::quorum_size(self.peers.len() + 1);
        // The `quorum`-th most recent response time across all peers
        // (including self) is the pivot: until it plus minElectionTimeout,
        // no quorum could have elected a new leader.
        let pivot = times[times.len() - quorum];
        pivot.add_millis(min_election_timeout.as_millis() as u32).sub_millis(max_clock_drift.as_millis() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_log() -> Log {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("ldr-{}-{}", std::process::id(), n));
        Log::load_from_directory(dir, 0, 0, HashMap::new(), true).unwrap()
    }

    fn members() -> HashMap<ServerId, String> {
        let mut m = HashMap::new();
        m.insert(ServerId::from("me"), "a:1".into());
        m.insert(ServerId::from("p1"), "a:2".into());
        m.insert(ServerId::from("p2"), "a:3".into());
        m
    }

    #[test]
    fn on_entry_creates_peer_for_every_other_member() {
        let log = empty_log();
        let leader = LeaderState::on_entry(&log, &members(), &ServerId::from("me"), RelativeTimestamp(0));
        assert_eq!(leader.peers.len(), 2);
        assert!(leader.peers.values().all(|p| !p.synced));
    }

    #[test]
    fn heartbeat_sends_probe_when_not_synced() {
        let log = empty_log();
        let mut leader = LeaderState::on_entry(&log, &members(), &ServerId::from("me"), RelativeTimestamp(0));
        let mut effects = Effects::default();
        leader.heartbeat(&log, &ServerId::from("me"), 1, 1, RelativeTimestamp(100), None, &mut effects);
        assert_eq!(effects.outgoing.len(), 2);
        for (_, msg) in &effects.outgoing {
            if let crate::proto::Message::AppendRequest(req) = msg {
                assert_eq!(req.log_entry_term, 0);
            } else {
                panic!("expected AppendRequest");
            }
        }
    }

    #[test]
    fn commit_index_advances_only_for_current_term_entries() {
        let mut log = empty_log();
        log.append(LogEntry { term: 1, index: 1, mutations: vec![], config_change: None }).unwrap();
        let mut leader = LeaderState::on_entry(&log, &members(), &ServerId::from("me"), RelativeTimestamp(0));

        let resp = AppendResponse {
            header: MessageHeader { cluster_id: 1, sender_id: ServerId::from("p1"), recipient_id: ServerId::from("me"), term: 1 },
            leader_timestamp: leader.peers[&ServerId::from("p1")].leader_timestamp_sent,
            success: true,
            match_index: 1,
            last_log_index: 1,
        };
        leader.handle_append_response(&ServerId::from("p1"), &resp, &log, 1, RelativeTimestamp(10));
        // Only 1 of 2 peers plus self = 2/3, which is quorum for 3 members.
        assert_eq!(leader.commit_index, 1);
        assert!(leader.committed_in_term);
    }

    #[test]
    fn propose_entry_rejects_second_pending_config_change() {
        let mut log = empty_log();
        let mut leader = LeaderState::on_entry(&log, &members(), &ServerId::from("me"), RelativeTimestamp(0));
        let cc = ConfigChange { identity: ServerId::from("new"), address: Some("a:4".into()) };
        leader.propose_entry(&mut log, 1, vec![], Some(cc.clone())).unwrap();
        assert!(leader.propose_entry(&mut log, 1, vec![], Some(cc)).is_err());
    }

    #[test]
    fn peer_below_first_index_is_marked_for_snapshot_and_skipped_by_heartbeat() {
        let mut log = empty_log();
        log.append(LogEntry { term: 1, index: 1, mutations: vec![], config_change: None }).unwrap();
        log.append(LogEntry { term: 1, index: 2, mutations: vec![], config_change: None }).unwrap();
        log.apply_next_log_entry();
        log.apply_next_log_entry();
        log.discard_applied_log_entries(2); // first_index() now 2

        let mut leader = LeaderState::on_entry(&log, &members(), &ServerId::from("me"), RelativeTimestamp(0));
        leader.peers.get_mut(&ServerId::from("p1")).unwrap().next_index = 1;

        let needing = leader.peers_needing_snapshot(&log);
        assert_eq!(needing, vec![ServerId::from("p1")]);
        assert!(leader.peers[&ServerId::from("p1")].snapshot_transmit);

        let mut effects = Effects::default();
        leader.heartbeat(&log, &ServerId::from("me"), 1, 1, RelativeTimestamp(100), None, &mut effects);
        let sent_to: Vec<_> = effects.outgoing.iter().map(|(id, _)| id.clone()).collect();
        assert!(!sent_to.contains(&ServerId::from("p1")));

        leader.mark_snapshot_installed(&ServerId::from("p1"), 2);
        let peer = &leader.peers[&ServerId::from("p1")];
        assert!(!peer.snapshot_transmit);
        assert_eq!(peer.next_index, 3);
        assert_eq!(peer.match_index, 2);
        assert!(peer.synced);
    }
}
