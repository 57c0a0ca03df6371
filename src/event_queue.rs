//! Buffer of telemetry events awaiting delivery.
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use crate::event::Event;

/// Maximum number of events sent in one batch. Reaching it triggers an immediate flush.
pub(crate) const MAX_BATCH_SIZE: usize = 50;
/// Maximum number of events held in memory. The oldest events are dropped beyond that.
pub(crate) const MAX_QUEUED_EVENTS: usize = 10_000;

pub(crate) const MIN_FLUSH_PERIOD: Duration = Duration::from_secs(5);
pub(crate) const MAX_FLUSH_PERIOD: Duration = Duration::from_secs(30);
const FLUSH_BACKOFF_STEP: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct QueueState {
    events: VecDeque<Event>,
    paused: bool,
    flush_period: Duration,
}

/// FIFO queue of events. Recording always works; handing out batches stops while paused.
///
/// The flush period grows while deliveries fail (connectivity trouble) and shrinks back once they
/// succeed again.
#[derive(Debug)]
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                paused: false,
                flush_period: MIN_FLUSH_PERIOD,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an event. Returns `true` if a full batch is ready for delivery.
    pub fn push(&self, event: Event) -> bool {
        let mut state = self.state();
        state.events.push_back(event);
        if state.events.len() > MAX_QUEUED_EVENTS {
            let overflow = state.events.len() - MAX_QUEUED_EVENTS;
            state.events.drain(..overflow);
            log::warn!(target: "splyt", dropped = overflow; "event queue is full, dropping oldest events");
        }
        !state.paused && state.events.len() >= MAX_BATCH_SIZE
    }

    /// Take the next batch in FIFO order. Empty while paused.
    pub fn next_batch(&self) -> Vec<Event> {
        let mut state = self.state();
        if state.paused {
            return Vec::new();
        }
        let size = state.events.len().min(MAX_BATCH_SIZE);
        state.events.drain(..size).collect()
    }

    /// Put back a batch that failed to send, ahead of everything recorded since.
    ///
    /// If the queue overflows, the oldest events recorded after the batch are dropped. The batch
    /// itself is kept whole.
    pub fn requeue_front(&self, batch: Vec<Event>) {
        let mut state = self.state();
        let batch_len = batch.len();
        for event in batch.into_iter().rev() {
            state.events.push_front(event);
        }
        if state.events.len() > MAX_QUEUED_EVENTS {
            let overflow = (state.events.len() - MAX_QUEUED_EVENTS).min(state.events.len() - batch_len);
            state.events.drain(batch_len..batch_len + overflow);
            log::warn!(target: "splyt", dropped = overflow; "event queue is full, dropping oldest events");
        }
    }

    /// Put events saved by an earlier session ahead of everything in the queue.
    pub fn restore(&self, saved: Vec<Event>) {
        let mut state = self.state();
        for event in saved.into_iter().rev() {
            state.events.push_front(event);
        }
        if state.events.len() > MAX_QUEUED_EVENTS {
            let overflow = state.events.len() - MAX_QUEUED_EVENTS;
            state.events.drain(..overflow);
            log::warn!(target: "splyt", dropped = overflow; "too many saved events, dropping oldest");
        }
    }

    /// Copy of every queued event, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.state().events.iter().cloned().collect()
    }

    /// Adjust the flush period after a delivery attempt.
    pub fn record_delivery(&self, delivered: bool) {
        let mut state = self.state();
        state.flush_period = if delivered {
            let excess = state.flush_period.saturating_sub(MIN_FLUSH_PERIOD);
            let step = (excess / 5).max(FLUSH_BACKOFF_STEP);
            state.flush_period.saturating_sub(step).max(MIN_FLUSH_PERIOD)
        } else {
            (state.flush_period + FLUSH_BACKOFF_STEP).min(MAX_FLUSH_PERIOD)
        };
    }

    pub fn flush_period(&self) -> Duration {
        self.state().flush_period
    }

    pub fn pause(&self) {
        self.state().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.state();
        state.paused = false;
        state.flush_period = MIN_FLUSH_PERIOD;
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
