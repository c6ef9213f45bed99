//! Process-wide lifecycle: persistent metadata, transaction registry, role
//! transitions (spec.md §4.8 "Coordinator"). This is the single owner of
//! role/log/transactions/persistent metadata that spec.md §5 requires all
//! state transitions to serialize through; see `crate::dispatcher` for the
//! task that gives it exclusive, one-event-at-a-time access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::codec::{decode_signed_long, decode_unsigned_int, encode_signed_long, encode_unsigned_int};
use crate::config::{Config, Consistency};
use crate::error::{RaftError, Result, RetryReason};
use crate::log::Log;
use crate::mutation::Mutation;
use crate::network::Transport;
use crate::proto::{
    ClusterId, CommitRequest, CommitResponse, ConfigChange, InstallSnapshot, LogIndex, Message, MessageHeader,
    PingRequest, PingResponse, RequestVote, ServerId, Term,
};
use crate::role::{CandidateState, Effects, FollowerState, LeaderState, Role};
use crate::store::KvStore;
use crate::timestamp::RelativeTimestamp;
use crate::transaction::{CommitOutcome, CommitWaiter, Transaction, TxId};
use crate::watch::WatchTracker;

pub struct Coordinator {
    pub own_id: ServerId,
    pub own_address: String,
    pub cluster_id: ClusterId,
    pub current_term: Term,
    pub role: Role,
    pub log: Arc<StdMutex<Log>>,
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub transport: Arc<dyn Transport>,
    pub transactions: HashMap<TxId, Arc<AsyncMutex<Transaction>>>,
    pub next_tx_id: TxId,
    pub watch: WatchTracker,
    /// Observed commit point while in the follower/candidate role (a
    /// leader tracks its own in `LeaderState::commit_index`).
    pub follower_commit_index: u64,
    /// Forwarded or leader-local writes awaiting their proposed index to
    /// reach the commit index, keyed by that index (spec.md §4.6.1: a write
    /// only resolves once a quorum has it, never on local append alone).
    pub pending_remote_commits: HashMap<u64, Vec<PendingRemoteCommit>>,
}

/// A follower's in-flight forwarded commit, recorded so the leader can
/// reply once (and only once) its proposed entry is actually applied.
pub struct PendingRemoteCommit {
    pub follower: ServerId,
    pub tx_id: TxId,
}

/// Result of `Coordinator::commit`: either the transaction's fate is already
/// known (read-only paths, and any failure that short-circuits before a
/// write is even proposed), or it now depends on the write reaching quorum,
/// in which case the caller must await the `CommitWaiter` it got from
/// `create_transaction` instead.
pub enum CommitProgress {
    Done(Result<CommitOutcome>),
    Pending,
}

impl Coordinator {
    pub fn new(
        own_id: ServerId,
        own_address: String,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Result<Self> {
        config.validate().map_err(|e| RaftError::Codec(e.to_string()))?;
        let meta = PersistentMeta::load(&*store);
        let log = Log::load_from_directory(
            &config.log_dir,
            meta.last_applied_term,
            meta.last_applied_index,
            meta.last_applied_config,
            config.disable_sync,
        )?;
        Ok(Coordinator {
            own_id,
            own_address,
            cluster_id: meta.cluster_id,
            current_term: meta.current_term,
            role: Role::Follower(FollowerState { voted_for: meta.voted_for, ..FollowerState::new() }),
            log: Arc::new(StdMutex::new(log)),
            config,
            store,
            transport,
            transactions: HashMap::new(),
            next_tx_id: 0,
            watch: WatchTracker::new(),
            follower_commit_index: 0,
            pending_remote_commits: HashMap::new(),
        })
    }

    pub fn members(&self) -> HashMap<ServerId, String> {
        self.log.lock().unwrap().build_current_config()
    }

    pub fn configured(&self) -> bool {
        self.log.lock().unwrap().last_index() >= 1
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    fn persist_meta(&self, voted_for: &Option<ServerId>) {
        let log = self.log.lock().unwrap();
        let meta = PersistentMeta {
            cluster_id: self.cluster_id,
            current_term: self.current_term,
            voted_for: voted_for.clone(),
            last_applied_term: log.last_applied_term(),
            last_applied_index: log.last_applied_index(),
            last_applied_config: log.last_applied_config().clone(),
        };
        drop(log);
        let _ = meta.save(&*self.store);
    }

    /// A single-node cluster bootstraps itself by directly committing a
    /// config change that adds itself, then becoming leader. This is the
    /// one local, out-of-band log append the dispatcher performs outside
    /// normal replication (there is no other peer to replicate through
    /// yet).
    pub fn bootstrap_single_node(&mut self) -> Result<()> {
        if self.configured() {
            return Ok(());
        }
        self.current_term = 1;
        {
            let mut log = self.log.lock().unwrap();
            log.append(crate::log::LogEntry {
                term: 1,
                index: 1,
                mutations: vec![],
                config_change: Some(ConfigChange { identity: self.own_id.clone(), address: Some(self.own_address.clone()) }),
            })?;
            log.apply_next_log_entry();
        }
        self.cluster_id = self.cluster_id.max(1);
        self.persist_meta(&None);
        self.become_leader();
        Ok(())
    }

    fn become_leader(&mut self) {
        let now = RelativeTimestamp::now();
        let members = self.members();
        let log = self.log.lock().unwrap();
        self.role = Role::Leader(LeaderState::on_entry(&log, &members, &self.own_id, now));
    }

    fn become_follower(&mut self) {
        self.role = Role::Follower(FollowerState::new());
    }

    fn become_candidate(&mut self) -> Effects {
        let members = self.members();
        let mut effects = Effects::default();
        let log = self.log.lock().unwrap();
        let state = CandidateState::start_election(&mut self.current_term, &self.own_id, self.cluster_id, &log, &members, &mut effects);
        drop(log);
        self.role = Role::Candidate(state);
        effects
    }

    // -- message handling --

    /// Decodes and dispatches one wire message, returning whether the
    /// election timer should be reset (spec.md §4.6.2: any message from a
    /// leader we still recognize pushes the next possible election out).
    pub async fn handle_message(&mut self, data: Bytes) -> bool {
        let msg = match Message::decode(&data) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable message");
                return false;
            }
        };
        let header = msg.header().clone();
        if !crate::proto::cluster_id_is_acceptable(self.cluster_id, self.configured(), header.cluster_id) {
            tracing::debug!(sender = %header.sender_id, "dropping message with unacceptable clusterId");
            return false;
        }

        let skip_step_down = request_vote_within_min_election(&self.role, &msg, self.config.min_election_timeout);
        if header.term > self.current_term && !skip_step_down {
            self.current_term = header.term;
            self.persist_meta(&None);
            self.become_follower();
        }

        let mut effects = Effects::default();
        match msg {
            Message::AppendRequest(req) => {
                if !matches!(self.role, Role::Follower(_)) {
                    self.become_follower();
                }
                self.handle_append_request(&req, &mut effects).await;
            }
            Message::AppendResponse(resp) => {
                if matches!(self.role, Role::Leader(_)) {
                    self.handle_append_response(&resp);
                }
            }
            Message::RequestVote(req) => {
                if matches!(self.role, Role::Follower(_)) {
                    self.handle_request_vote(&req, &mut effects);
                }
            }
            Message::GrantVote(gv) => {
                if matches!(self.role, Role::Candidate(_)) {
                    self.handle_grant_vote(&gv);
                }
            }
            Message::CommitRequest(req) => {
                if matches!(self.role, Role::Leader(_)) {
                    self.handle_commit_request(&req).await;
                }
            }
            Message::CommitResponse(resp) => self.handle_commit_response(&resp).await,
            Message::InstallSnapshot(snap) => {
                if matches!(self.role, Role::Follower(_)) {
                    self.handle_install_snapshot(&snap);
                }
            }
            Message::PingRequest(ping) => self.handle_ping_request(&ping, &mut effects),
            Message::PingResponse(pong) => {
                if let Role::Follower(f) = &mut self.role {
                    f.record_ping_response(pong.header.sender_id.clone());
                }
            }
        }

        let reset_election_timer = effects.reset_election_timer;
        self.send_effects(effects).await;
        self.advance_commit_and_apply().await;
        reset_election_timer
    }

    async fn handle_append_request(&mut self, req: &crate::proto::AppendRequest, effects: &mut Effects) {
        let sender = req.header.sender_id.clone();
        let pending = self.pending_follower_write(&sender, req.prev_log_index + 1);
        let (resp, discarded_from) = {
            let mut log = self.log.lock().unwrap();
            let Role::Follower(state) = &mut self.role else { return };
            state.handle_append_request(
                &mut log,
                &self.own_id,
                req,
                pending.as_deref(),
                &mut self.follower_commit_index,
                RelativeTimestamp::now(),
                effects,
            )
        };
        if let Some(from_index) = discarded_from {
            self.fail_transactions_from(from_index, RetryReason::LogOverwritten { index: from_index }).await;
        }
        effects.send(sender, Message::AppendResponse(resp));
    }

    fn pending_follower_write(&self, _leader: &ServerId, _index: u64) -> Option<Vec<Mutation>> {
        // Transactions this follower itself originated and forwarded to the
        // leader (skipDataLogEntries on the leader side) would be looked up
        // here by matching base/commit index; no local forwarding path is
        // wired in this build (see DESIGN.md), so the leader always sends
        // the full payload and this is always `None`.
        None
    }

    fn handle_append_response(&mut self, resp: &crate::proto::AppendResponse) {
        let log = self.log.lock().unwrap();
        if let Role::Leader(leader) = &mut self.role {
            leader.handle_append_response(&resp.header.sender_id, resp, &log, self.current_term, RelativeTimestamp::now());
        }
    }

    fn handle_request_vote(&mut self, req: &RequestVote, effects: &mut Effects) {
        let log = self.log.lock().unwrap();
        let voted_for = if let Role::Follower(state) = &mut self.role {
            let grant = state.handle_request_vote(&log, self.config.min_election_timeout, RelativeTimestamp::now(), req, &self.own_id, effects);
            effects.send(req.header.sender_id.clone(), Message::GrantVote(grant));
            if effects.persist_meta { Some(state.voted_for.clone()) } else { None }
        } else {
            None
        };
        drop(log);
        if let Some(voted_for) = voted_for {
            self.persist_meta(&voted_for);
        }
    }

    fn handle_grant_vote(&mut self, gv: &crate::proto::GrantVote) {
        let member_count = self.members().len().max(1);
        let became_leader = if let Role::Candidate(state) = &mut self.role {
            state.record_vote(gv.header.sender_id.clone(), gv, member_count)
        } else {
            false
        };
        if became_leader {
            self.become_leader();
        }
    }

    fn handle_ping_request(&mut self, ping: &PingRequest, effects: &mut Effects) {
        effects.send(
            ping.header.sender_id.clone(),
            Message::PingResponse(PingResponse {
                header: MessageHeader {
                    cluster_id: self.cluster_id,
                    sender_id: self.own_id.clone(),
                    recipient_id: ping.header.sender_id.clone(),
                    term: self.current_term,
                },
                timestamp: ping.timestamp,
            }),
        );
    }

    fn handle_install_snapshot(&mut self, msg: &InstallSnapshot) {
        match crate::snapshot::apply_chunk(&*self.store, msg) {
            Ok(Some(config)) => {
                let mut log = self.log.lock().unwrap();
                log.reset_applied_point(msg.snapshot_term, msg.snapshot_index, config);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "snapshot chunk application failed"),
        }
    }

    /// A follower's forwarded write lands here. The reply isn't sent until
    /// the proposed entry actually reaches this leader's commit index (see
    /// `advance_commit_and_apply`) — replying on local append alone would
    /// let a follower observe a write that a leader change could still
    /// roll back (spec.md §4.6.1 "Read-write transactions").
    async fn handle_commit_request(&mut self, req: &CommitRequest) {
        match self
            .leader_propose_entry_checked(
                req.base_term,
                req.base_index,
                req.mutations.clone().unwrap_or_default(),
                req.config_change.clone(),
                req.high_priority,
            )
            .await
        {
            Ok(index) => {
                self.pending_remote_commits
                    .entry(index)
                    .or_default()
                    .push(PendingRemoteCommit { follower: req.header.sender_id.clone(), tx_id: req.tx_id });
            }
            Err(e) => {
                self.send_commit_response(&req.header.sender_id, req.tx_id, false, 0, 0, Some(e.to_string())).await;
            }
        }
    }

    /// Resolves this node's own pending transaction the same way regardless
    /// of whether it originated a `CommitRequest` forwarded here, or is
    /// about to ask a leader to forward on its behalf and later receives
    /// this as the leader's answer.
    async fn handle_commit_response(&mut self, resp: &CommitResponse) {
        let Some(handle) = self.transactions.get(&resp.tx_id).cloned() else { return };
        let mut tx = handle.lock().await;
        if resp.success {
            tx.mark_committed(resp.commit_term, resp.commit_index, resp.leader_lease_timeout.map(|t| RelativeTimestamp(t)));
            tx.complete();
        } else {
            tx.fail(RaftError::Retry(RetryReason::LeaderDeposed));
        }
        drop(tx);
        self.transactions.remove(&resp.tx_id);
    }

    async fn send_commit_response(
        &self,
        to: &ServerId,
        tx_id: TxId,
        success: bool,
        commit_term: Term,
        commit_index: u64,
        error: Option<String>,
    ) {
        let resp = CommitResponse {
            header: MessageHeader { cluster_id: self.cluster_id, sender_id: self.own_id.clone(), recipient_id: to.clone(), term: self.current_term },
            tx_id,
            success,
            commit_term,
            commit_index,
            leader_lease_timeout: None,
            error,
        };
        if let Ok(bytes) = Message::CommitResponse(resp).encode() {
            if let Some(addr) = self.members().get(to) {
                self.transport.send(&addr, bytes).await;
            }
        }
    }

    async fn send_effects(&mut self, effects: Effects) {
        let addresses = self.members();
        for (to, msg) in effects.outgoing {
            if let Some(addr) = addresses.get(&to) {
                if let Ok(bytes) = msg.encode() {
                    self.transport.send(addr, bytes).await;
                }
            }
        }
    }

    // -- timers --

    pub async fn on_election_timeout(&mut self) {
        enum Action {
            None,
            StartProbing,
            BecomeCandidate,
        }

        let action = match &self.role {
            Role::Leader(_) => Action::None,
            Role::Follower(f) => {
                if self.config.follower_probing_enabled && f.probing.is_none() {
                    Action::StartProbing
                } else if !self.config.follower_probing_enabled || f.probing_quorum_met(self.members().len().max(1)) {
                    Action::BecomeCandidate
                } else {
                    Action::None
                }
            }
            Role::Candidate(_) => Action::BecomeCandidate,
        };

        let effects = match action {
            Action::None => return,
            Action::BecomeCandidate => self.become_candidate(),
            Action::StartProbing => {
                let mut effects = Effects::default();
                let members = self.members();
                if let Role::Follower(state) = &mut self.role {
                    state.start_probing(RelativeTimestamp::now());
                }
                for peer in members.keys() {
                    if *peer != self.own_id {
                        effects.send(
                            peer.clone(),
                            Message::PingRequest(PingRequest {
                                header: MessageHeader {
                                    cluster_id: self.cluster_id,
                                    sender_id: self.own_id.clone(),
                                    recipient_id: peer.clone(),
                                    term: self.current_term,
                                },
                                timestamp: RelativeTimestamp::now().0,
                            }),
                        );
                    }
                }
                effects
            }
        };
        self.send_effects(effects).await;
    }

    pub async fn on_heartbeat_timeout(&mut self) {
        let mut effects = Effects::default();
        let now = RelativeTimestamp::now();
        let snapshot_targets = {
            let log = self.log.lock().unwrap();
            let targets = match &mut self.role {
                Role::Leader(leader) => leader.peers_needing_snapshot(&log),
                _ => Vec::new(),
            };
            if let Role::Leader(leader) = &mut self.role {
                leader.heartbeat(&log, &self.own_id, self.cluster_id, self.current_term, now, Some(self.config.min_election_timeout), &mut effects);
            }
            targets
        };
        self.send_effects(effects).await;
        for peer_id in snapshot_targets {
            self.transfer_snapshot(&peer_id).await;
        }
    }

    /// Streams the full state machine to `peer_id` as a sequence of
    /// `InstallSnapshot` chunks (spec.md §4.7). There is no ack message for
    /// this transfer; the leader optimistically advances the peer's
    /// `nextIndex`/`matchIndex` past the snapshot and lets the next
    /// `AppendResponse` correct it if the follower didn't actually catch up.
    async fn transfer_snapshot(&mut self, peer_id: &ServerId) {
        let Some(addr) = self.members().get(peer_id).cloned() else { return };
        let (snapshot_term, snapshot_index, config) = {
            let log = self.log.lock().unwrap();
            (log.last_applied_term(), log.last_applied_index(), log.last_applied_config().clone())
        };
        let chunks = crate::snapshot::chunk_snapshot(&*self.store.snapshot(), 256);
        let messages = crate::snapshot::build_install_messages(
            &chunks,
            self.cluster_id,
            &self.own_id,
            peer_id,
            self.current_term,
            snapshot_term,
            snapshot_index,
            &config,
        );
        for msg in messages {
            if let Ok(bytes) = Message::InstallSnapshot(msg).encode() {
                self.transport.send(&addr, bytes).await;
            }
        }
        if let Role::Leader(leader) = &mut self.role {
            leader.mark_snapshot_installed(peer_id, snapshot_index);
        }
    }

    /// The point past which no quorum could have deposed this leader, used
    /// to answer a Linearizable read-only commit without a log round trip
    /// once a transaction's base index is already behind it. Returns `None`
    /// off the leader role or before any peer has responded this term.
    fn leader_read_lease(&self) -> Option<RelativeTimestamp> {
        let Role::Leader(leader) = &self.role else { return None };
        Some(leader.compute_lease_timeout(&self.own_id, RelativeTimestamp::now(), self.config.min_election_timeout, self.config.max_clock_drift))
    }

    // -- transactions --

    pub fn create_transaction(&mut self, consistency: Consistency, timeout_ms: u64) -> (TxId, Arc<AsyncMutex<Transaction>>, CommitWaiter) {
        let tx_id = self.next_tx_id;
        self.next_tx_id += 1;

        let log = self.log.lock().unwrap();
        let (base_term, base_index) = match consistency {
            Consistency::Eventual => (log.term_at_index(log.last_index()).unwrap_or(0), log.last_index()),
            Consistency::EventualCommitted | Consistency::Uncommitted => {
                (log.last_applied_term(), log.last_applied_index())
            }
            Consistency::Linearizable => (log.term_at_index(log.last_index()).unwrap_or(0), log.last_index()),
        };
        drop(log);

        let (mut tx, waiter) = Transaction::new(tx_id, consistency, base_term, base_index, self.store.snapshot(), timeout_ms);
        tx.rebasable = matches!(consistency, Consistency::Linearizable);
        let handle = Arc::new(AsyncMutex::new(tx));
        self.transactions.insert(tx_id, handle.clone());
        (tx_id, handle, waiter)
    }

    pub async fn rollback(&mut self, tx_id: TxId) {
        if let Some(tx) = self.transactions.remove(&tx_id) {
            tx.lock().await.rollback();
        }
    }

    /// Attempts to commit a transaction this coordinator already has
    /// registered. Read-only paths (and anything that fails before a write
    /// is even proposed) resolve immediately as `Done`; a write that's been
    /// proposed or forwarded returns `Pending` — the caller must await the
    /// `CommitWaiter` obtained from `create_transaction` to learn the
    /// eventual outcome, since the write only resolves once it reaches
    /// quorum (see `advance_commit_and_apply`), which may happen inside a
    /// later, unrelated call into this coordinator.
    pub async fn commit(&mut self, tx_id: TxId) -> CommitProgress {
        let Some(handle) = self.transactions.get(&tx_id).cloned() else { return CommitProgress::Done(Err(RaftError::Stale)) };
        let (consistency, has_writes, base_term, base_index) = {
            let tx = handle.lock().await;
            (tx.consistency, tx.has_writes(), tx.base_term, tx.base_index)
        };

        if matches!(consistency, Consistency::Uncommitted) {
            let mut tx = handle.lock().await;
            tx.complete();
            drop(tx);
            self.transactions.remove(&tx_id);
            return CommitProgress::Done(Ok(CommitOutcome { commit_term: 0, commit_index: 0 }));
        }

        if !has_writes {
            let (commit_term, commit_index) = match consistency {
                Consistency::EventualCommitted => {
                    let log = self.log.lock().unwrap();
                    (log.last_applied_term(), log.last_applied_index())
                }
                _ => {
                    let log = self.log.lock().unwrap();
                    (log.term_at_index(log.last_index()).unwrap_or(0), log.last_index())
                }
            };
            let lease = self.leader_read_lease();
            let mut tx = handle.lock().await;
            tx.mark_committed(commit_term, commit_index, lease);
            tx.complete();
            drop(tx);
            self.transactions.remove(&tx_id);
            return CommitProgress::Done(Ok(CommitOutcome { commit_term, commit_index }));
        }

        if !matches!(self.role, Role::Leader(_)) {
            if let Err(e) = self.forward_commit(tx_id, base_term, base_index, &handle).await {
                handle.lock().await.fail(e.clone());
                self.transactions.remove(&tx_id);
                return CommitProgress::Done(Err(e));
            }
            return CommitProgress::Pending;
        }

        let (mutations, config_change, high_priority) = {
            let tx = handle.lock().await;
            (tx.view.writes.mutations().to_vec(), tx.config_change.clone(), tx.high_priority)
        };
        match self.leader_propose_entry_checked(base_term, base_index, mutations, config_change, high_priority).await {
            Ok(index) => {
                let lease = self.leader_read_lease();
                handle.lock().await.mark_committed(self.current_term, index, lease);
                self.advance_commit_and_apply().await;
                CommitProgress::Pending
            }
            Err(e) => {
                handle.lock().await.fail(e.clone());
                self.transactions.remove(&tx_id);
                CommitProgress::Done(Err(e))
            }
        }
    }

    /// Sends a forwarded-write request to the current leader and returns
    /// once it's on the wire; resolution happens later, asynchronously,
    /// via `handle_commit_response`.
    async fn forward_commit(&mut self, tx_id: TxId, base_term: Term, base_index: u64, handle: &Arc<AsyncMutex<Transaction>>) -> Result<()> {
        let Role::Follower(state) = &self.role else { return Err(RaftError::NotLeader { leader_hint: None }) };
        let Some(leader_id) = state.leader.clone() else { return Err(RaftError::NotLeader { leader_hint: None }) };
        let Some(addr) = self.members().get(&leader_id).cloned() else { return Err(RaftError::NotLeader { leader_hint: Some(leader_id) }) };

        let (mutations, config_change, high_priority) = {
            let tx = handle.lock().await;
            (tx.view.writes.mutations().to_vec(), tx.config_change.clone(), tx.high_priority)
        };
        let req = CommitRequest {
            header: MessageHeader { cluster_id: self.cluster_id, sender_id: self.own_id.clone(), recipient_id: leader_id.clone(), term: self.current_term },
            tx_id,
            base_term,
            base_index,
            reads: None,
            mutations: Some(mutations),
            config_change,
            high_priority,
        };
        if let Ok(bytes) = Message::CommitRequest(req).encode() {
            self.transport.send(&addr, bytes).await;
        }
        Ok(())
    }

    /// The leader-side conflict-check-then-append path shared by locally
    /// originated commits and ones forwarded from a follower (spec.md
    /// §4.6.1 "Read-write transactions"). Only appends the entry; does not
    /// wait for or assume it has committed.
    ///
    /// A `high_priority` caller that conflicts with an entry the leader has
    /// appended but not yet committed to a quorum preempts it instead of
    /// losing (spec.md §4.6.1 "high priority transaction"): that entry is
    /// still safe to discard (invariant 3 only protects committed indices),
    /// so it's truncated and the transaction that proposed it is retried.
    /// A conflict against an already-committed index always loses, since
    /// invariant 3 makes that entry permanent regardless of priority.
    async fn leader_propose_entry_checked(
        &mut self,
        base_term: Term,
        base_index: u64,
        mutations: Vec<Mutation>,
        config_change: Option<ConfigChange>,
        high_priority: bool,
    ) -> Result<u64> {
        let _ = base_term;
        let Role::Leader(_) = &self.role else { return Err(RaftError::NotLeader { leader_hint: None }) };

        if let Some(cc) = &config_change {
            if cc.address.is_none() {
                let log = self.log.lock().unwrap();
                let config = log.build_current_config();
                if config.len() <= 1 && config.contains_key(&cc.identity) {
                    return Err(RaftError::LastMemberRemoval);
                }
            }
        }

        loop {
            let Role::Leader(_) = &self.role else { return Err(RaftError::NotLeader { leader_hint: None }) };

            let (committed_through, conflict) = {
                let Role::Leader(leader) = &self.role else { return Err(RaftError::NotLeader { leader_hint: None }) };
                let log = self.log.lock().unwrap();
                let mut reads = crate::view::ReadSet::new();
                // Conservative: conflict-check using only the write keys
                // themselves (the full read set lives with the client's
                // Transaction and is already checked during rebasing on the
                // follower/candidate path before a commit is ever attempted).
                for m in &mutations {
                    if let Some(k) = m.key() {
                        reads.record_point(k);
                    }
                }
                let mut found = None;
                for index in (base_index + 1)..=log.last_index() {
                    if let Some(entry) = log.entry_at_index(index) {
                        if reads.find_conflict(&entry.mutations).is_some() {
                            found = Some(index);
                            break;
                        }
                    }
                }
                (leader.commit_index, found)
            };

            let Some(conflict_index) = conflict else { break };

            if !high_priority || conflict_index <= committed_through {
                return Err(RaftError::Retry(RetryReason::Conflict { ranges: vec![] }));
            }
            self.preempt_uncommitted_from(conflict_index).await;
        }

        let mut log = self.log.lock().unwrap();
        let Role::Leader(leader) = &mut self.role else { return Err(RaftError::NotLeader { leader_hint: None }) };
        let index = leader.propose_entry(&mut log, self.current_term, mutations, config_change)?;
        leader.recompute_commit_index(&log, self.current_term);
        Ok(index)
    }

    /// Fails every open transaction and pending remote commit whose entry
    /// is in `[from_index, lastIndex]` and discards those entries. Only
    /// ever called against the leader's own not-yet-committed tail, so
    /// discarding is safe (nothing here has reached a quorum yet).
    async fn preempt_uncommitted_from(&mut self, from_index: LogIndex) {
        let had_config_change = {
            let log = self.log.lock().unwrap();
            (from_index..=log.last_index()).any(|i| log.entry_at_index(i).map(|e| e.config_change.is_some()).unwrap_or(false))
        };

        for handle in self.transactions.values() {
            let mut tx = handle.lock().await;
            if tx.commit_index >= from_index {
                tx.fail(RaftError::Retry(RetryReason::Conflict { ranges: vec![] }));
            }
        }

        let stale: Vec<LogIndex> = self.pending_remote_commits.keys().filter(|i| **i >= from_index).copied().collect();
        for index in stale {
            if let Some(pending) = self.pending_remote_commits.remove(&index) {
                for p in pending {
                    self.send_commit_response(&p.follower, p.tx_id, false, 0, 0, Some("preempted by a higher-priority transaction".into())).await;
                }
            }
        }

        {
            let mut log = self.log.lock().unwrap();
            let _ = log.discard_log_entries_from(from_index);
        }

        if had_config_change {
            if let Role::Leader(leader) = &mut self.role {
                leader.config_change_pending = false;
            }
        }
    }

    pub fn watch_key(&mut self, key: Vec<u8>) -> oneshot::Receiver<()> {
        self.watch.watch(key)
    }

    // -- applying committed entries --

    async fn fail_transactions_from(&mut self, from_index: u64, reason: RetryReason) {
        for (_, handle) in self.transactions.iter() {
            let mut tx = handle.lock().await;
            if tx.base_index >= from_index && !matches!(tx.consistency, Consistency::Uncommitted) {
                tx.fail(RaftError::Retry(reason.clone()));
            }
        }
    }

    /// Advances the applied point toward the role-level commit index,
    /// applying each newly-applied entry's mutations to the store, firing
    /// watches, and rebasing open transactions (spec.md §4.6.4, §4.6.5).
    async fn advance_commit_and_apply(&mut self) {
        let target = match &self.role {
            Role::Leader(l) => l.commit_index,
            _ => self.follower_commit_index,
        };

        loop {
            let next = {
                let log = self.log.lock().unwrap();
                if log.last_applied_index() >= target {
                    break;
                }
                log.last_applied_index() + 1
            };
            let entry = {
                let mut log = self.log.lock().unwrap();
                if log.entry_at_index(next).is_none() {
                    break;
                }
                log.apply_next_log_entry()
            };
            let Some(entry) = entry else { break };

            if !entry.mutations.is_empty() {
                if let Err(e) = self.store.apply(&entry.mutations, !self.config.disable_sync) {
                    tracing::error!(error = %e, index = entry.index, "failed to apply committed entry to the store");
                }
                self.watch.notify_committed(&entry.mutations);
            }

            for handle in self.transactions.values() {
                handle.lock().await.rebase_past(entry.term, entry.index, &entry.mutations);
            }

            if let Some(pending) = self.pending_remote_commits.remove(&entry.index) {
                for p in pending {
                    self.send_commit_response(&p.follower, p.tx_id, true, entry.term, entry.index, None).await;
                }
            }
        }

        let (commit_index, term_at_commit) = {
            let log = self.log.lock().unwrap();
            (log.last_applied_index(), log.term_at_index(log.last_applied_index()))
        };
        let mut to_complete = Vec::new();
        for (tx_id, handle) in self.transactions.iter() {
            let tx = handle.lock().await;
            if tx.is_committable(commit_index, term_at_commit) {
                to_complete.push(*tx_id);
            }
        }
        for tx_id in to_complete {
            if let Some(handle) = self.transactions.remove(&tx_id) {
                handle.lock().await.complete();
            }
        }
    }
}

/// The `RequestVote` term-bump exception in spec.md §4.4: a follower that
/// has heard from a leader within the last `minElectionTimeout` does not
/// step down just because a stale candidate's term looks higher.
fn request_vote_within_min_election(role: &Role, msg: &Message, min_election_timeout: std::time::Duration) -> bool {
    if !matches!(msg, Message::RequestVote(_)) {
        return false;
    }
    let Role::Follower(f) = role else { return false };
    match f.last_leader_message_time {
        Some(last) => RelativeTimestamp::now().is_before(last.add_millis(min_election_timeout.as_millis() as u32)),
        None => false,
    }
}

struct PersistentMeta {
    cluster_id: ClusterId,
    current_term: Term,
    voted_for: Option<ServerId>,
    last_applied_term: Term,
    last_applied_index: u64,
    last_applied_config: HashMap<ServerId, String>,
}

const KEY_CLUSTER_ID: &[u8] = b"\x00raftkv/cluster_id";
const KEY_CURRENT_TERM: &[u8] = b"\x00raftkv/current_term";
const KEY_VOTED_FOR: &[u8] = b"\x00raftkv/voted_for";
const KEY_LAST_APPLIED_TERM: &[u8] = b"\x00raftkv/last_applied_term";
const KEY_LAST_APPLIED_INDEX: &[u8] = b"\x00raftkv/last_applied_index";
const KEY_LAST_APPLIED_CONFIG: &[u8] = b"\x00raftkv/last_applied_config";

impl PersistentMeta {
    /// Reads the reserved scalar-metadata keys (spec.md §3 "Persistent
    /// scalar state"); absent keys default to the unconfigured/zero state.
    fn load(store: &dyn KvStore) -> Self {
        let cluster_id = store.get(KEY_CLUSTER_ID).and_then(|b| decode_unsigned_int(&b).ok()).map(|(v, _)| v).unwrap_or(0);
        let current_term = store.get(KEY_CURRENT_TERM).and_then(|b| decode_signed_long(&b).ok()).map(|(v, _)| v as Term).unwrap_or(0);
        let voted_for = store.get(KEY_VOTED_FOR).map(|b| ServerId(String::from_utf8_lossy(&b).to_string()));
        let last_applied_term =
            store.get(KEY_LAST_APPLIED_TERM).and_then(|b| decode_signed_long(&b).ok()).map(|(v, _)| v as Term).unwrap_or(0);
        let last_applied_index =
            store.get(KEY_LAST_APPLIED_INDEX).and_then(|b| decode_signed_long(&b).ok()).map(|(v, _)| v as u64).unwrap_or(0);
        let last_applied_config = store
            .get(KEY_LAST_APPLIED_CONFIG)
            .map(|b| {
                let mut r = crate::wire::WireReader::new(&b);
                let mut map = HashMap::new();
                while !r.is_empty() {
                    if let (Ok(id), Ok(addr)) = (r.read_str(), r.read_str()) {
                        map.insert(ServerId(id), addr);
                    } else {
                        break;
                    }
                }
                map
            })
            .unwrap_or_default();
        PersistentMeta { cluster_id, current_term, voted_for, last_applied_term, last_applied_index, last_applied_config }
    }

    fn save(&self, store: &dyn KvStore) -> Result<()> {
        let mut muts = vec![
            Mutation::Put { key: KEY_CLUSTER_ID.to_vec(), value: encode_unsigned_int(self.cluster_id) },
            Mutation::Put { key: KEY_CURRENT_TERM.to_vec(), value: encode_signed_long(self.current_term as i64) },
            Mutation::Put { key: KEY_LAST_APPLIED_TERM.to_vec(), value: encode_signed_long(self.last_applied_term as i64) },
            Mutation::Put { key: KEY_LAST_APPLIED_INDEX.to_vec(), value: encode_signed_long(self.last_applied_index as i64) },
        ];
        match &self.voted_for {
            Some(id) => muts.push(Mutation::Put { key: KEY_VOTED_FOR.to_vec(), value: id.0.clone().into_bytes() }),
            None => muts.push(Mutation::Remove { key: KEY_VOTED_FOR.to_vec() }),
        }
        let mut w = crate::wire::WireWriter::new();
        for (id, addr) in &self.last_applied_config {
            let _ = w.write_str(&id.0);
            let _ = w.write_str(addr);
        }
        muts.push(Mutation::Put { key: KEY_LAST_APPLIED_CONFIG.to_vec(), value: w.finish().to_vec() });
        store.apply(&muts, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryTransport;
    use crate::store::MemoryStore;

    fn make_coordinator(id: &str) -> Coordinator {
        let dir = std::env::temp_dir().join(format!("coord-test-{}-{}", id, std::process::id()));
        let mut config = Config::default();
        config.log_dir = dir;
        config.disable_sync = true;
        Coordinator::new(ServerId::from(id), format!("{id}:9660"), MemoryStore::new(), MemoryTransport::new(format!("{id}:9660")), config)
            .unwrap()
    }

    #[tokio::test]
    async fn bootstrap_single_node_becomes_leader() {
        let mut c = make_coordinator("solo");
        c.bootstrap_single_node().unwrap();
        assert!(matches!(c.role, Role::Leader(_)));
        assert!(c.configured());
        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }

    #[tokio::test]
    async fn uncommitted_transaction_commits_immediately() {
        let mut c = make_coordinator("solo2");
        c.bootstrap_single_node().unwrap();
        let (tx_id, _handle, _waiter) = c.create_transaction(Consistency::Uncommitted, 1000);
        let outcome = match c.commit(tx_id).await {
            CommitProgress::Done(r) => r.unwrap(),
            CommitProgress::Pending => panic!("uncommitted reads should resolve immediately"),
        };
        assert_eq!(outcome, CommitOutcome { commit_term: 0, commit_index: 0 });
        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }

    /// A single-node cluster has no peer `AppendResponse`s to drive commit
    /// advancement, so `commit` must itself push the applied point forward
    /// (via `leader_propose_entry_checked`'s `recompute_commit_index` call)
    /// before the `CommitWaiter` it implies can ever resolve.
    #[tokio::test]
    async fn leader_write_commits_and_applies_to_store() {
        let mut c = make_coordinator("solo3");
        c.bootstrap_single_node().unwrap();
        let (tx_id, handle, waiter) = c.create_transaction(Consistency::Linearizable, 1000);
        handle.lock().await.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert!(matches!(c.commit(tx_id).await, CommitProgress::Pending));
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.commit_index, 2);
        assert_eq!(c.store.get(b"k"), Some(b"v".to_vec()));
        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }

    #[tokio::test]
    async fn non_leader_write_commit_without_known_leader_fails() {
        let mut c = make_coordinator("solo4");
        // Not bootstrapped: remains an unconfigured follower.
        let (tx_id, handle, _waiter) = c.create_transaction(Consistency::Linearizable, 1000);
        handle.lock().await.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        let result = c.commit(tx_id).await;
        assert!(matches!(result, CommitProgress::Done(Err(RaftError::NotLeader { .. }))));
        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }

    #[tokio::test]
    async fn config_change_removing_last_member_is_rejected() {
        let mut c = make_coordinator("solo5");
        c.bootstrap_single_node().unwrap();
        let (tx_id, handle, _waiter) = c.create_transaction(Consistency::Linearizable, 1000);
        handle.lock().await.config_change(ConfigChange { identity: ServerId::from("solo5"), address: None }).unwrap();
        let result = c.commit(tx_id).await;
        assert!(matches!(result, CommitProgress::Done(Err(RaftError::LastMemberRemoval))));
        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }

    /// A high-priority commit that conflicts with another transaction's
    /// not-yet-committed entry preempts it instead of retrying itself
    /// (spec.md §4.6.1 "high priority transaction").
    #[tokio::test]
    async fn high_priority_commit_preempts_conflicting_uncommitted_entry() {
        let mut c = make_coordinator("solo6");
        c.bootstrap_single_node().unwrap();

        let (high_tx, high_handle, high_waiter) = c.create_transaction(Consistency::Linearizable, 1000);
        high_handle.lock().await.set_high_priority(true);
        high_handle.lock().await.put(b"k".to_vec(), b"high".to_vec()).unwrap();

        // Simulate another transaction's write already appended to the log
        // (e.g. forwarded from a follower) but not yet committed: appended
        // directly, bypassing `LeaderState::propose_entry`, so the leader's
        // `commit_index` doesn't advance past it on its own.
        {
            let mut log = c.log.lock().unwrap();
            log.append(crate::log::LogEntry {
                term: c.current_term,
                index: 2,
                mutations: vec![Mutation::Put { key: b"k".to_vec(), value: b"low".to_vec() }],
                config_change: None,
            })
            .unwrap();
        }
        c.pending_remote_commits.insert(2, vec![PendingRemoteCommit { follower: ServerId::from("ghost"), tx_id: 77 }]);

        assert!(matches!(c.commit(high_tx).await, CommitProgress::Pending));

        // The conflicting uncommitted entry was preempted: its pending
        // forwarded-commit registration is gone and the high-priority write
        // landed in its place.
        assert!(!c.pending_remote_commits.contains_key(&2));
        let outcome = high_waiter.await.unwrap().unwrap();
        assert_eq!(c.store.get(b"k"), Some(b"high".to_vec()));
        assert_eq!(outcome.commit_index, 2);

        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }

    /// A peer whose `nextIndex` has fallen below the leader's earliest
    /// retained log index gets a full snapshot instead of a normal
    /// `AppendRequest` (spec.md §4.6.1, §4.7).
    #[tokio::test]
    async fn heartbeat_streams_snapshot_to_peer_below_retained_log() {
        let mut c = make_coordinator("solo7");
        c.bootstrap_single_node().unwrap();
        c.store.apply(&[Mutation::Put { key: b"k".to_vec(), value: b"v".to_vec() }], true).unwrap();

        let other = ServerId::from("other");
        {
            let mut log = c.log.lock().unwrap();
            let mut config = log.build_current_config();
            config.insert(other.clone(), "other:9660".into());
            log.set_last_applied_config(config);
            // Nothing retained past `lastAppliedIndex` any more, so
            // `first_index()` moves past index 1.
            let cutoff = log.last_applied_index() + 1;
            log.discard_applied_log_entries(cutoff);
        }
        let members = c.members();
        c.role = Role::Leader(LeaderState::on_entry(&c.log.lock().unwrap(), &members, &c.own_id, RelativeTimestamp::now()));
        if let Role::Leader(leader) = &mut c.role {
            leader.peers.get_mut(&other).unwrap().next_index = 1;
        }

        c.on_heartbeat_timeout().await;

        let Role::Leader(leader) = &c.role else { panic!("still leader") };
        let peer = &leader.peers[&other];
        assert!(!peer.snapshot_transmit);
        assert_eq!(peer.match_index, c.log.lock().unwrap().last_applied_index());

        let _ = std::fs::remove_dir_all(&c.config.log_dir);
    }
}
