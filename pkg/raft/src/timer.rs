//! One-shot scheduled callback that enqueues a "service request" onto the
//! dispatcher when it expires (spec.md §4.2).
//!
//! Cancellation is race-free: every scheduled sleep is tagged with a
//! generation number taken from a shared counter. `cancel()` (and every
//! fresh `schedule()`) bumps the counter, so a sleep that was already
//! in-flight when cancelled finds a mismatched generation when it wakes up
//! and drops itself instead of firing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// A timer parameterized over the event type it posts to the dispatcher on
/// expiry.
pub struct Timer<T> {
    generation: Arc<AtomicU64>,
    deadline: Option<Instant>,
    sender: UnboundedSender<T>,
    event: T,
    label: &'static str,
}

impl<T: Clone + Send + 'static> Timer<T> {
    pub fn new(label: &'static str, sender: UnboundedSender<T>, event: T) -> Self {
        Timer {
            generation: Arc::new(AtomicU64::new(0)),
            deadline: None,
            sender,
            event,
            label,
        }
    }

    /// Schedules (or reschedules) this timer to fire after `delay`.
    /// Implicitly cancels any previously scheduled firing.
    pub fn schedule(&mut self, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let deadline = Instant::now() + delay;
        self.deadline = Some(deadline);

        let gen_counter = self.generation.clone();
        let sender = self.sender.clone();
        let event = self.event.clone();
        let label = self.label;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if gen_counter.load(Ordering::SeqCst) != generation {
                tracing::trace!(timer = label, "stale timer fire suppressed");
                return;
            }
            tracing::trace!(timer = label, "timer fired");
            let _ = sender.send(event);
        });
    }

    /// Cancels any pending firing. Idempotent: calling this with nothing
    /// scheduled is a no-op other than bumping the generation (harmless).
    pub fn cancel(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consumes the "has this timer expired" state by checking the deadline
    /// against the current time. Does not itself fire the event channel;
    /// this is for dispatcher code that wants to poll without waiting on
    /// the channel.
    pub fn poll_for_timeout(&mut self) -> bool {
        match self.deadline {
            Some(d) if Instant::now() >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
