//! End-to-end scenarios driving real `Coordinator`s over `MemoryTransport`
//! (spec.md §8): bootstrap, replication, leader partition, conflict
//! detection, snapshot install, and key watch.
//!
//! `dispatcher::run` can't be reused directly: `MemoryTransport::start`
//! discards the handler it's given (inbound delivery only happens through
//! `link`), so nothing ever feeds its `ServiceEvent` channel. This harness
//! keeps `dispatcher::run`'s actual event-loop shape — one channel carrying
//! `Message`/`ElectionTimeout`/`HeartbeatTimeout`, real `Timer`s rescheduled
//! the same way — and only swaps in a pump task that forwards the linked
//! channel's inbound bytes onto it instead of relying on `transport.start`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use raftkv::config::{Config, Consistency};
use raftkv::coordinator::{CommitProgress, Coordinator};
use raftkv::error::RaftError;
use raftkv::network::{MemoryTransport, Transport, TransportHandler};
use raftkv::proto::ServerId;
use raftkv::store::{KvStore, MemoryStore};
use raftkv::timer::Timer;

#[derive(Clone)]
enum Event {
    Message(Bytes),
    ElectionTimeout,
    HeartbeatTimeout,
}

fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=(max - min).as_millis() as u64);
    min + Duration::from_millis(jitter_ms)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("raftkv=debug").with_test_writer().try_init();
}

/// Wraps a `MemoryTransport`, letting a test sever an address from the rest
/// of the cluster in both directions (spec.md §8 "Leader partition") without
/// touching the transport used in production.
struct PartitionableTransport {
    inner: Arc<MemoryTransport>,
    own_address: String,
    partitioned: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Transport for PartitionableTransport {
    async fn start(&self, handler: Arc<dyn TransportHandler>) {
        self.inner.start(handler).await
    }

    async fn send(&self, address: &str, data: Bytes) -> bool {
        let blocked = {
            let p = self.partitioned.lock().unwrap();
            p.contains(&self.own_address) || p.contains(address)
        };
        if blocked {
            return false;
        }
        self.inner.send(address, data).await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }
}

struct Node {
    id: ServerId,
    address: String,
    coordinator: Arc<AsyncMutex<Coordinator>>,
    partitioned: Arc<Mutex<HashSet<String>>>,
    _dir: TempDir,
}

impl Node {
    async fn partition(&self) {
        self.partitioned.lock().unwrap().insert(self.address.clone());
    }

    async fn heal(&self) {
        self.partitioned.lock().unwrap().remove(&self.address);
    }

    async fn is_leader(&self) -> bool {
        self.coordinator.lock().await.is_leader()
    }
}

/// Brings up `ids.len()` nodes, links every pair's transport, and spawns a
/// message pump plus manual election/heartbeat drivers for each — a
/// stand-in for `dispatcher::run`'s timers and transport wiring, tuned to
/// the same short timeouts `dispatcher.rs`'s own tests use.
fn spawn_cluster(ids: &[&str]) -> Vec<Node> {
    let partitioned = Arc::new(Mutex::new(HashSet::new()));
    let addresses: Vec<String> = ids.iter().map(|id| format!("{id}:9660")).collect();
    let mem_transports: Vec<Arc<MemoryTransport>> = addresses.iter().map(|a| MemoryTransport::new(a.clone())).collect();

    let mut receivers = Vec::new();
    for (i, addr) in addresses.iter().enumerate() {
        let (tx, rx) = mpsc::unbounded_channel();
        for (j, mem) in mem_transports.iter().enumerate() {
            if i != j {
                mem.link(addr.clone(), tx.clone());
            }
        }
        receivers.push(rx);
    }

    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.log_dir = dir.path().to_path_buf();
        config.disable_sync = true;
        config.heartbeat_timeout = Duration::from_millis(10);
        config.min_election_timeout = Duration::from_millis(60);
        config.max_election_timeout = Duration::from_millis(90);

        let transport = Arc::new(PartitionableTransport {
            inner: mem_transports[i].clone(),
            own_address: addresses[i].clone(),
            partitioned: partitioned.clone(),
        });
        let coordinator = Arc::new(AsyncMutex::new(
            Coordinator::new(ServerId::from(*id), addresses[i].clone(), MemoryStore::new(), transport, config).unwrap(),
        ));
        nodes.push(Node { id: ServerId::from(*id), address: addresses[i].clone(), coordinator, partitioned: partitioned.clone(), _dir: dir });
    }

    for (i, mut inbound) in receivers.into_iter().enumerate() {
        let coordinator = nodes[i].coordinator.clone();
        tokio::spawn(async move {
            let (min_election, max_election, heartbeat_timeout) = {
                let c = coordinator.lock().await;
                (c.config.min_election_timeout, c.config.max_election_timeout, c.config.heartbeat_timeout)
            };
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

            let forward = tx.clone();
            tokio::spawn(async move {
                while let Some((_from, data)) = inbound.recv().await {
                    if forward.send(Event::Message(data)).is_err() {
                        break;
                    }
                }
            });

            let mut election_timer = Timer::new("election", tx.clone(), Event::ElectionTimeout);
            let mut heartbeat_timer = Timer::new("heartbeat", tx.clone(), Event::HeartbeatTimeout);
            election_timer.schedule(random_election_timeout(min_election, max_election));
            heartbeat_timer.schedule(heartbeat_timeout);

            while let Some(event) = rx.recv().await {
                let mut c = coordinator.lock().await;
                match event {
                    Event::Message(data) => {
                        if c.handle_message(data).await {
                            election_timer.schedule(random_election_timeout(min_election, max_election));
                        }
                    }
                    Event::ElectionTimeout => {
                        c.on_election_timeout().await;
                        election_timer.schedule(random_election_timeout(min_election, max_election));
                    }
                    Event::HeartbeatTimeout => {
                        c.on_heartbeat_timeout().await;
                        heartbeat_timer.schedule(heartbeat_timeout);
                    }
                }
            }
        });
    }

    nodes
}

/// Seeds every node's log with the same already-applied three-member
/// config and puts `leader_id` in the leader role, bypassing a real
/// election — config changes don't add a running leader's new peer to its
/// `LeaderState::peers` map (that only gets rebuilt on the next election),
/// so a fixed membership seeded at genesis is how this harness stands up a
/// multi-node cluster whose leader is known up front.
async fn seed_fixed_cluster(nodes: &[Node], leader_id: &str) {
    let mut full_config = HashMap::new();
    for node in nodes {
        full_config.insert(node.id.clone(), node.address.clone());
    }
    for node in nodes {
        let mut c = node.coordinator.lock().await;
        c.current_term = 1;
        {
            let mut log = c.log.lock().unwrap();
            log.reset_applied_point(1, 1, full_config.clone());
        }
        if node.id == ServerId::from(leader_id) {
            let members = c.members();
            let new_role = {
                let log = c.log.lock().unwrap();
                raftkv::role::Role::Leader(raftkv::role::LeaderState::on_entry(
                    &log,
                    &members,
                    &c.own_id,
                    raftkv::timestamp::RelativeTimestamp::now(),
                ))
            };
            c.role = new_role;
        }
    }
}

async fn commit_put(coordinator: &Arc<AsyncMutex<Coordinator>>, key: &[u8], value: &[u8]) -> Result<(), RaftError> {
    let (tx_id, handle, waiter) = coordinator.lock().await.create_transaction(Consistency::Linearizable, 5_000);
    handle.lock().await.put(key.to_vec(), value.to_vec()).unwrap();
    let progress = coordinator.lock().await.commit(tx_id).await;
    match progress {
        CommitProgress::Done(result) => result.map(|_| ()),
        CommitProgress::Pending => waiter.await.unwrap().map(|_| ()),
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn single_node_bootstrap_commits_a_write() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.log_dir = dir.path().to_path_buf();
    config.disable_sync = true;
    let coordinator = Arc::new(AsyncMutex::new(
        Coordinator::new(ServerId::from("solo"), "solo:9660".into(), MemoryStore::new(), MemoryTransport::new("solo:9660"), config).unwrap(),
    ));
    coordinator.lock().await.bootstrap_single_node().unwrap();
    assert!(coordinator.lock().await.is_leader());

    commit_put(&coordinator, b"hello", b"world").await.unwrap();

    let c = coordinator.lock().await;
    assert_eq!(c.store.get(b"hello"), Some(b"world".to_vec()));
}

#[tokio::test]
async fn three_node_cluster_elects_a_leader_and_replicates() {
    init_tracing();
    let nodes = spawn_cluster(&["a", "b", "c"]);
    seed_fixed_cluster(&nodes, "__none__").await; // seed config only; let the cluster elect its own leader

    let leader_index = wait_until_leader(&nodes, Duration::from_secs(2)).await.expect("a leader should be elected");
    commit_put(&nodes[leader_index].coordinator, b"k1", b"v1").await.unwrap();

    for node in &nodes {
        let ok = wait_until(
            || {
                let c = node.coordinator.try_lock();
                matches!(c, Ok(c) if c.store.get(b"k1") == Some(b"v1".to_vec()))
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(ok, "node {} never applied the replicated write", node.id);
    }
}

async fn wait_until_leader(nodes: &[Node], timeout: Duration) -> Option<usize> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (i, node) in nodes.iter().enumerate() {
            if node.is_leader().await {
                return Some(i);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn leader_partition_yields_to_a_new_leader() {
    init_tracing();
    let nodes = spawn_cluster(&["a", "b", "c"]);
    seed_fixed_cluster(&nodes, "a").await;

    commit_put(&nodes[0].coordinator, b"before", b"partition").await.unwrap();
    for node in &nodes[1..] {
        wait_until(
            || matches!(node.coordinator.try_lock(), Ok(c) if c.store.get(b"before") == Some(b"partition".to_vec())),
            Duration::from_secs(1),
        )
        .await;
    }

    nodes[0].partition().await;

    let new_leader = wait_until_leader(&nodes[1..], Duration::from_secs(2)).await.expect("b or c should take over");
    commit_put(&nodes[1 + new_leader].coordinator, b"after", b"partition").await.unwrap();

    nodes[0].heal().await;

    assert!(
        wait_until(|| !matches!(nodes[0].coordinator.try_lock(), Ok(c) if c.is_leader()), Duration::from_secs(2)).await,
        "the partitioned leader should step down once it hears from the new term"
    );
    assert!(
        wait_until(
            || matches!(nodes[0].coordinator.try_lock(), Ok(c) if c.store.get(b"after") == Some(b"partition".to_vec())),
            Duration::from_secs(2)
        )
        .await,
        "the healed node should catch up on what it missed"
    );
}

#[tokio::test]
async fn conflicting_transactions_detect_the_conflict() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.log_dir = dir.path().to_path_buf();
    config.disable_sync = true;
    let coordinator = Arc::new(AsyncMutex::new(
        Coordinator::new(ServerId::from("solo"), "solo:9660".into(), MemoryStore::new(), MemoryTransport::new("solo:9660"), config).unwrap(),
    ));
    coordinator.lock().await.bootstrap_single_node().unwrap();

    let (tx1, handle1, waiter1) = coordinator.lock().await.create_transaction(Consistency::Linearizable, 5_000);
    let (_tx2, handle2, waiter2) = coordinator.lock().await.create_transaction(Consistency::Linearizable, 5_000);

    // tx2 reads the key before tx1's conflicting write commits, so once
    // tx1 lands, rebasing tx2 past it finds the two touched the same key
    // and fails tx2 instead of silently letting it miss the write
    // (spec.md §4.6.4 "Rebasing").
    handle2.lock().await.get(b"shared");
    handle1.lock().await.put(b"shared".to_vec(), b"from-tx1".to_vec()).unwrap();

    assert!(matches!(coordinator.lock().await.commit(tx1).await, CommitProgress::Pending));
    waiter1.await.unwrap().unwrap();

    let result = waiter2.await.unwrap();
    assert!(matches!(result, Err(RaftError::Retry(_))), "tx2 should fail once tx1's conflicting write commits");
}

#[tokio::test]
async fn lagging_follower_catches_up_via_snapshot_install() {
    init_tracing();
    let nodes = spawn_cluster(&["a", "b", "c"]);
    seed_fixed_cluster(&nodes, "a").await;

    // "c" is unreachable for the whole time the leader is producing and
    // then discarding log history underneath it.
    nodes[2].partition().await;

    for i in 0..5 {
        commit_put(&nodes[0].coordinator, format!("k{i}").as_bytes(), format!("v{i}").as_bytes()).await.unwrap();
    }
    wait_until(
        || matches!(nodes[1].coordinator.try_lock(), Ok(c) if c.store.get(b"k4") == Some(b"v4".to_vec())),
        Duration::from_secs(1),
    )
    .await;

    {
        let c = nodes[0].coordinator.lock().await;
        let mut log = c.log.lock().unwrap();
        let up_to = log.last_applied_index();
        log.discard_applied_log_entries(up_to);
    }

    nodes[2].heal().await;

    let caught_up = wait_until(
        || matches!(nodes[2].coordinator.try_lock(), Ok(c) if c.store.get(b"k4") == Some(b"v4".to_vec())),
        Duration::from_secs(3),
    )
    .await;
    assert!(caught_up, "node c should have received a snapshot covering the discarded log prefix");
    for i in 0..5 {
        let c = nodes[2].coordinator.lock().await;
        assert_eq!(c.store.get(format!("k{i}").as_bytes()), Some(format!("v{i}").as_bytes().to_vec()));
    }
}

#[tokio::test]
async fn watch_fires_exactly_once_on_matching_committed_write() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.log_dir = dir.path().to_path_buf();
    config.disable_sync = true;
    let coordinator = Arc::new(AsyncMutex::new(
        Coordinator::new(ServerId::from("solo"), "solo:9660".into(), MemoryStore::new(), MemoryTransport::new("solo:9660"), config).unwrap(),
    ));
    coordinator.lock().await.bootstrap_single_node().unwrap();

    let watch = coordinator.lock().await.watch_key(b"watched".to_vec());
    let mut other_watch = coordinator.lock().await.watch_key(b"untouched".to_vec());

    commit_put(&coordinator, b"watched", b"fired").await.unwrap();

    watch.await.expect("watch should fire once the matching key commits");
    assert!(other_watch.try_recv().is_err(), "a watch on an untouched key must not fire");
}
