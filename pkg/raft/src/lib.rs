//! Raft replication and transaction engine for a linearizable key/value
//! store (spec.md OVERVIEW): role state machine, log management, RPC
//! protocol, MVCC transaction lifecycle, snapshot install, cluster
//! reconfiguration, and the single-threaded scheduler that drives all of
//! it. The local atomic key/value store and the network transport are
//! consumed through the [`store::KvStore`] and [`network::Transport`]
//! trait boundaries; production implementations of both are out of scope
//! here (see `config.rs`'s doc comment and `store.rs`/`network.rs`).

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod io_worker;
pub mod log;
pub mod mutation;
pub mod network;
pub mod proto;
pub mod role;
pub mod snapshot;
pub mod store;
pub mod timer;
pub mod timestamp;
pub mod transaction;
pub mod view;
pub mod watch;
pub mod wire;

use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use config::{Config, TransactionOptions};
use coordinator::{CommitProgress, Coordinator};
use error::{RaftError, Result};
use mutation::Key;
use network::Transport;
use proto::{ConfigChange, ServerId};
use store::{KvStore, Snapshot};
use transaction::{CommitOutcome, CommitWaiter, Transaction, TxId};

/// The top-level handle a client program holds: one coordinator behind one
/// mutex (spec.md §5's "coarse" lock), plus whatever task is currently
/// draining its dispatcher loop.
pub struct Database {
    coordinator: Arc<AsyncMutex<Coordinator>>,
}

impl Database {
    pub fn new(
        own_id: ServerId,
        own_address: String,
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Result<Self> {
        let coordinator = Coordinator::new(own_id, own_address, store, transport, config)?;
        Ok(Database { coordinator: Arc::new(AsyncMutex::new(coordinator)) })
    }

    /// Bootstraps an unconfigured node into a one-node cluster; a no-op if
    /// already configured (spec.md §4.1).
    pub async fn bootstrap_single_node(&self) -> Result<()> {
        dispatcher::bootstrap_single_node_if_unconfigured(&self.coordinator).await
    }

    /// Spawns the dispatcher loop driving this database's timers and
    /// `transport`'s inbound messages. The returned handle outlives this
    /// call; drop or abort it to shut the loop down.
    pub fn run(&self, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        tokio::spawn(dispatcher::run(self.coordinator.clone(), transport))
    }

    pub async fn is_leader(&self) -> bool {
        self.coordinator.lock().await.is_leader()
    }

    pub async fn members(&self) -> std::collections::HashMap<ServerId, String> {
        self.coordinator.lock().await.members()
    }

    /// Opens a new transaction against this database (spec.md §6
    /// "Consistency options", `createTransaction`).
    pub async fn begin_transaction(&self, options: TransactionOptions) -> TransactionHandle {
        let mut coordinator = self.coordinator.lock().await;
        let (tx_id, tx, waiter) = coordinator.create_transaction(options.consistency, options.timeout_ms);
        drop(coordinator);
        tx.lock().await.set_high_priority(options.high_priority);
        TransactionHandle { coordinator: self.coordinator.clone(), tx_id, tx, waiter: Some(waiter) }
    }

    /// Convenience for a single linearizable read/write with default
    /// options (spec.md §6).
    pub async fn transaction(&self) -> TransactionHandle {
        self.begin_transaction(TransactionOptions::default()).await
    }
}

/// A single open transaction's client-visible surface (spec.md §6
/// "Client-visible transaction API"). Every data operation locks this
/// transaction's own ("fine") mutex; `commit`/`rollback` additionally lock
/// the coordinator's ("coarse") mutex — always in that order, never
/// reversed, so a concurrent dispatcher event can never deadlock against a
/// client holding a transaction handle (spec.md §5 "Locking order").
pub struct TransactionHandle {
    coordinator: Arc<AsyncMutex<Coordinator>>,
    tx_id: TxId,
    tx: Arc<AsyncMutex<Transaction>>,
    waiter: Option<CommitWaiter>,
}

impl TransactionHandle {
    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tx.lock().await.get(key)
    }

    pub async fn get_at_least(&self, key: &[u8]) -> Vec<(Key, Vec<u8>)> {
        self.tx.lock().await.get_at_least(key)
    }

    pub async fn get_at_most(&self, key: &[u8]) -> Vec<(Key, Vec<u8>)> {
        self.tx.lock().await.get_at_most(key)
    }

    pub async fn get_range(&self, start: Bound<Key>, end: Bound<Key>) -> Vec<(Key, Vec<u8>)> {
        self.tx.lock().await.get_range(start, end)
    }

    pub async fn put(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.tx.lock().await.put(key, value)
    }

    pub async fn remove(&self, key: Key) -> Result<()> {
        self.tx.lock().await.remove(key)
    }

    pub async fn remove_range(&self, start: Bound<Key>, end: Bound<Key>) -> Result<()> {
        self.tx.lock().await.remove_range(start, end)
    }

    pub async fn adjust_counter(&self, key: Key, delta: i64) -> Result<()> {
        self.tx.lock().await.adjust_counter(key, delta)
    }

    /// Proposes a cluster membership change to take effect alongside this
    /// transaction's writes (spec.md §6 `configChange(identity, address|∅)`).
    /// `address = None` removes `identity`; `Some(addr)` adds or re-addresses it.
    pub async fn config_change(&self, identity: ServerId, address: Option<String>) -> Result<()> {
        self.tx.lock().await.config_change(ConfigChange { identity, address })
    }

    pub async fn set_read_only(&self) {
        self.tx.lock().await.set_read_only();
    }

    pub async fn set_timeout(&self, timeout_ms: u64) {
        self.tx.lock().await.set_timeout(timeout_ms);
    }

    pub async fn set_high_priority(&self, high_priority: bool) {
        self.tx.lock().await.set_high_priority(high_priority);
    }

    /// The point-in-time view this transaction reads through, independent
    /// of its own buffered writes (spec.md §6 `readOnlySnapshot`) — useful
    /// for handing a consistent read surface to code that outlives this
    /// transaction's own commit/rollback.
    pub async fn read_only_snapshot(&self) -> Arc<dyn Snapshot> {
        self.tx.lock().await.view.snapshot()
    }

    /// Commits this transaction, consuming the handle. Resolves once the
    /// write (if any) has actually reached quorum, not merely been
    /// proposed locally (spec.md §4.6.1).
    pub async fn commit(mut self) -> Result<CommitOutcome> {
        let progress = self.coordinator.lock().await.commit(self.tx_id).await;
        match progress {
            CommitProgress::Done(result) => result,
            CommitProgress::Pending => self
                .waiter
                .take()
                .expect("commit returned Pending without leaving a waiter")
                .await
                .unwrap_or(Err(RaftError::Retry(error::RetryReason::LeaderDeposed))),
        }
    }

    pub async fn rollback(self) {
        self.coordinator.lock().await.rollback(self.tx_id).await;
    }

    /// A future that resolves once a committed write touches `key`
    /// (spec.md §2.11 "Key watch"). Independent of this transaction's own
    /// commit/rollback.
    pub async fn watch_key(&self, key: Key) -> tokio::sync::oneshot::Receiver<()> {
        self.coordinator.lock().await.watch_key(key)
    }
}

pub use store::{decode_counter, encode_counter};
