//! Per-client transaction state and lifecycle (spec.md §3 "Transaction",
//! §4.6.4 "Rebasing", §4.6.5 "Commit and failure semantics").

use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::config::Consistency;
use crate::error::{RaftError, Result, RetryReason};
use crate::proto::{ConfigChange, LogIndex, Term};
use crate::store::Snapshot;
use crate::timestamp::RelativeTimestamp;
use crate::view::View;

pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Executing,
    CommitReady,
    CommitWaiting,
    Completed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub commit_term: Term,
    pub commit_index: LogIndex,
}

/// What the client-facing `commit()` call awaits.
pub type CommitWaiter = oneshot::Receiver<Result<CommitOutcome>>;

pub struct Transaction {
    pub tx_id: TxId,
    pub consistency: Consistency,
    pub base_term: Term,
    pub base_index: LogIndex,
    pub commit_term: Term,
    pub commit_index: LogIndex,
    pub commit_leader_lease_timeout: Option<RelativeTimestamp>,
    /// Cleared once `base_index` has caught up to a known `commit_index`
    /// (spec.md §4.6.4).
    pub rebasable: bool,
    pub read_only: bool,
    pub high_priority: bool,
    pub config_change: Option<ConfigChange>,
    pub state: TxState,
    pub view: View,
    pub timeout_ms: u64,
    pub failure: Option<RaftError>,

    commit_sender: Option<oneshot::Sender<Result<CommitOutcome>>>,
}

impl Transaction {
    pub fn new(
        tx_id: TxId,
        consistency: Consistency,
        base_term: Term,
        base_index: LogIndex,
        snapshot: Arc<dyn Snapshot>,
        timeout_ms: u64,
    ) -> (Self, CommitWaiter) {
        let (tx, rx) = oneshot::channel();
        let read_only = matches!(
            consistency,
            Consistency::Eventual | Consistency::EventualCommitted | Consistency::Uncommitted
        );
        let tx = Transaction {
            tx_id,
            consistency,
            base_term,
            base_index,
            commit_term: 0,
            commit_index: 0,
            commit_leader_lease_timeout: None,
            rebasable: false,
            read_only,
            high_priority: false,
            config_change: None,
            state: TxState::Executing,
            view: View::new(snapshot),
            timeout_ms,
            failure: None,
            commit_sender: Some(tx),
        };
        (tx, rx)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TxState::Executing | TxState::CommitReady | TxState::CommitWaiting)
    }

    // -- client-visible data operations (spec.md §6) --

    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.view.get(key)
    }

    pub fn get_at_least(&mut self, key: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.view.get_range(Bound::Included(key.to_vec()), Bound::Unbounded)
    }

    pub fn get_at_most(&mut self, key: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.view.get_range(Bound::Unbounded, Bound::Included(key.to_vec()))
    }

    pub fn get_range(&mut self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.view.get_range(start, end)
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.require_writable()?;
        self.view.put(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: Vec<u8>) -> Result<()> {
        self.require_writable()?;
        self.view.remove(key);
        Ok(())
    }

    pub fn remove_range(&mut self, start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Result<()> {
        self.require_writable()?;
        self.view.remove_range(start, end);
        Ok(())
    }

    pub fn adjust_counter(&mut self, key: Vec<u8>, delta: i64) -> Result<()> {
        self.require_writable()?;
        self.view.adjust_counter(key, delta);
        Ok(())
    }

    pub fn config_change(&mut self, change: ConfigChange) -> Result<()> {
        self.require_writable()?;
        self.config_change = Some(change);
        Ok(())
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(RaftError::Codec("transaction is read-only".into()));
        }
        if !self.is_open() {
            return Err(RaftError::Stale);
        }
        Ok(())
    }

    // -- options (spec.md §6) --

    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn set_high_priority(&mut self, high_priority: bool) {
        self.high_priority = high_priority;
    }

    pub fn has_writes(&self) -> bool {
        !self.view.writes.is_empty() || self.config_change.is_some()
    }

    // -- lifecycle --

    /// Whether this transaction is ready to report a result, per spec.md
    /// §4.6.5: `commitTerm > 0`, the entry at `commitIndex` is still at
    /// `commitTerm` (else it was overwritten by a later leader), the
    /// leader's committed point has caught up, and (if still rebasable)
    /// `baseIndex >= commitIndex`.
    pub fn is_committable(&self, leader_commit_index: LogIndex, term_at_commit_index: Option<Term>) -> bool {
        if self.commit_term == 0 {
            return false;
        }
        if term_at_commit_index != Some(self.commit_term) {
            return false;
        }
        if self.commit_index > leader_commit_index {
            return false;
        }
        if self.rebasable && self.base_index < self.commit_index {
            return false;
        }
        true
    }

    /// Advances `base_index`/`base_term` past one intervening log entry,
    /// per spec.md §4.6.4. Returns `true` if this rebase step failed the
    /// transaction due to a conflict.
    pub fn rebase_past(&mut self, entry_term: Term, entry_index: LogIndex, entry_mutations: &[crate::mutation::Mutation]) -> bool {
        if !self.rebasable {
            return false;
        }
        if let Some(conflict) = self.view.reads.find_conflict(entry_mutations) {
            // A high-priority transaction wins conflicts instead of losing
            // to them (spec.md §4.6.1 "high priority transaction"): it
            // advances past the conflicting entry rather than retrying.
            if !self.high_priority {
                self.fail(RaftError::Retry(RetryReason::Conflict { ranges: conflict }));
                return true;
            }
        }
        self.base_term = entry_term;
        self.base_index = entry_index;
        if self.commit_term != 0 && self.base_index >= self.commit_index {
            self.rebasable = false;
        }
        false
    }

    pub fn mark_committed(&mut self, term: Term, index: LogIndex, leader_lease_timeout: Option<RelativeTimestamp>) {
        self.commit_term = term;
        self.commit_index = index;
        self.commit_leader_lease_timeout = leader_lease_timeout;
        self.state = TxState::CommitWaiting;
    }

    pub fn complete(&mut self) {
        if self.state == TxState::Closed {
            return;
        }
        self.state = TxState::Completed;
        if let Some(sender) = self.commit_sender.take() {
            let _ = sender.send(Ok(CommitOutcome { commit_term: self.commit_term, commit_index: self.commit_index }));
        }
        self.state = TxState::Closed;
    }

    pub fn fail(&mut self, err: RaftError) {
        if self.state == TxState::Closed {
            return;
        }
        self.failure = Some(err.clone());
        self.state = TxState::Closed;
        if let Some(sender) = self.commit_sender.take() {
            let _ = sender.send(Err(err));
        }
    }

    pub fn rollback(&mut self) {
        if self.state == TxState::Closed {
            return;
        }
        self.state = TxState::Closed;
        self.commit_sender = None;
    }
}
