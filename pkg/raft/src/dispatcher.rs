//! Single-threaded event loop that serializes every Raft state transition
//! through one `Coordinator` (spec.md §5 "Suspension points", "Locking
//! order"): the transport's inbound messages and the election/heartbeat
//! timers all funnel into one `ServiceEvent` channel, drained here one
//! event at a time.
//!
//! The coordinator mutex this loop locks for each event is the "coarse"
//! lock in spec.md's ordering; a client holding a transaction handle locks
//! the same mutex before ever touching that transaction's own ("fine")
//! mutex, never the reverse — so this loop is free to lock a transaction
//! from inside a coordinator call without risking deadlock against a
//! concurrent client call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::coordinator::Coordinator;
use crate::network::{Transport, TransportHandler};
use crate::timer::Timer;

#[derive(Clone)]
pub enum ServiceEvent {
    Message(Bytes),
    ElectionTimeout,
    HeartbeatTimeout,
}

/// Forwards the transport's callbacks onto the dispatcher's event channel;
/// this is the only thing the transport ever touches on this side of the
/// boundary (spec.md §6 "Network (consumed)").
struct ChannelHandler {
    tx: mpsc::UnboundedSender<ServiceEvent>,
}

impl TransportHandler for ChannelHandler {
    fn on_message(&self, _sender_address: String, data: Bytes) {
        let _ = self.tx.send(ServiceEvent::Message(data));
    }

    fn on_output_queue_empty(&self, _address: String) {
        // Nothing queued on this side to reconsider: sends are fire-and-forget.
    }
}

fn random_election_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=(max - min).as_millis() as u64);
    min + Duration::from_millis(jitter_ms)
}

/// Drives `coordinator` forever off both its timers and `transport`'s
/// inbound messages. Returns once the event channel closes, which happens
/// when every sender (the transport handler and the two timers) has been
/// dropped — i.e. never, during normal operation; callers run this inside
/// its own task and simply drop it to shut a server down.
pub async fn run(coordinator: Arc<AsyncMutex<Coordinator>>, transport: Arc<dyn Transport>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServiceEvent>();
    transport.start(Arc::new(ChannelHandler { tx: tx.clone() })).await;

    let (min_election, max_election, heartbeat_timeout) = {
        let c = coordinator.lock().await;
        (c.config.min_election_timeout, c.config.max_election_timeout, c.config.heartbeat_timeout)
    };

    let mut election_timer = Timer::new("election", tx.clone(), ServiceEvent::ElectionTimeout);
    let mut heartbeat_timer = Timer::new("heartbeat", tx.clone(), ServiceEvent::HeartbeatTimeout);
    election_timer.schedule(random_election_timeout(min_election, max_election));
    heartbeat_timer.schedule(heartbeat_timeout);

    while let Some(event) = rx.recv().await {
        let mut c = coordinator.lock().await;
        match event {
            ServiceEvent::Message(data) => {
                if c.handle_message(data).await {
                    election_timer.schedule(random_election_timeout(min_election, max_election));
                }
            }
            ServiceEvent::ElectionTimeout => {
                c.on_election_timeout().await;
                election_timer.schedule(random_election_timeout(min_election, max_election));
            }
            ServiceEvent::HeartbeatTimeout => {
                c.on_heartbeat_timeout().await;
                heartbeat_timer.schedule(heartbeat_timeout);
            }
        }
    }
}

/// Bootstraps a brand-new, still-unconfigured coordinator into a one-node
/// cluster (spec.md §4.1 "Bootstrap"). Separate from `run` so a caller
/// joining an existing cluster instead can skip it.
pub async fn bootstrap_single_node_if_unconfigured(coordinator: &Arc<AsyncMutex<Coordinator>>) -> crate::error::Result<()> {
    let mut c = coordinator.lock().await;
    if c.configured() {
        return Ok(());
    }
    c.bootstrap_single_node()
}
