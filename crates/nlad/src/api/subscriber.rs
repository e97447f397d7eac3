//! Subscriber management for the cluster API
//!
//! Each connected subscriber owns a bounded queue. `broadcast` snapshots the
//! subscriber list under the lock and sends outside it with `try_send`, so a
//! slow subscriber never blocks the caller or its siblings. A subscriber that
//! stays full for more than `max_overflows` consecutive envelopes is removed;
//! dropping its sender ends the receiving connection task.
//!
//! The set also keeps the merged [`StateTable`]. Applying an envelope and
//! registering a subscriber happen under the same lock, so every envelope is
//! either in a new subscriber's initial snapshot or in its queue, never both.

use crate::api::protocol::SubscribeFilter;
use crate::error::{NladError, Result};
use crate::metrics::NladMetrics;
use nla_msg::{Envelope, StateTable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Limits applied to every subscriber.
#[derive(Debug, Clone, Copy)]
pub struct SubscriberLimits {
    pub buffer: usize,
    pub max_overflows: u32,
    pub max_subscribers: usize,
}

impl Default for SubscriberLimits {
    fn default() -> Self {
        Self {
            buffer: 1024,
            max_overflows: 64,
            max_subscribers: 100,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    filter: SubscribeFilter,
    sender: mpsc::Sender<Arc<Envelope>>,
    overflows: AtomicU32,
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    pub sent: usize,
    pub overflowed: usize,
    pub dropped: usize,
}

/// A registered subscriber: its id, its queue and the state it starts from.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::Receiver<Arc<Envelope>>,
    /// Stored entities matching the filter at registration time
    pub snapshot: Vec<Envelope>,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<u64, Arc<Subscriber>>,
    table: StateTable,
}

/// All subscribers of the merged stream and the state they share, behind one mutex.
pub struct SubscriberSet {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    limits: SubscriberLimits,
    metrics: Option<NladMetrics>,
}

impl SubscriberSet {
    pub fn new(limits: SubscriberLimits) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            limits,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: NladMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registers a subscriber and hands back the stored state matching its filter.
    pub fn subscribe(&self, filter: SubscribeFilter) -> Result<Subscription> {
        let mut inner = self.inner.lock();

        if inner.subscribers.len() >= self.limits.max_subscribers {
            return Err(NladError::TooManySubscribers(self.limits.max_subscribers));
        }

        let snapshot: Vec<Envelope> = inner
            .table
            .snapshot()
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();

        let (sender, events) = mpsc::channel(self.limits.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscribers = &mut inner.subscribers;
        subscribers.insert(
            id,
            Arc::new(Subscriber {
                id,
                filter,
                sender,
                overflows: AtomicU32::new(0),
            }),
        );

        if let Some(metrics) = &self.metrics {
            metrics.api_subscribers.set(subscribers.len() as i64);
        }
        debug!(id, total = subscribers.len(), snapshot = snapshot.len(), "Subscriber added");
        Ok(Subscription { id, events, snapshot })
    }

    /// Removes a subscriber; returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let subscribers = &mut inner.subscribers;
        let removed = subscribers.remove(&id).is_some();
        if let Some(metrics) = &self.metrics {
            metrics.api_subscribers.set(subscribers.len() as i64);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().subscribers.contains_key(&id)
    }

    /// Number of entities in the stored state.
    pub fn stored(&self) -> usize {
        self.inner.lock().table.len()
    }

    /// Records an envelope in the stored state and offers it to every
    /// matching subscriber without blocking.
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastStats {
        let snapshot: Vec<Arc<Subscriber>> = {
            let mut inner = self.inner.lock();
            inner.table.apply(envelope);
            inner.subscribers.values().cloned().collect()
        };
        if snapshot.is_empty() {
            return BroadcastStats::default();
        }

        let envelope = Arc::new(envelope.clone());
        let mut stats = BroadcastStats::default();
        let mut dead = Vec::new();

        for subscriber in snapshot.iter() {
            if !subscriber.filter.matches(&envelope) {
                continue;
            }

            match subscriber.sender.try_send(Arc::clone(&envelope)) {
                Ok(()) => {
                    subscriber.overflows.store(0, Ordering::Relaxed);
                    stats.sent += 1;
                }
                Err(TrySendError::Full(_)) => {
                    stats.overflowed += 1;
                    let overflows = subscriber.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                    if overflows > self.limits.max_overflows {
                        warn!(
                            id = subscriber.id,
                            overflows, "Subscriber overflowed, disconnecting"
                        );
                        dead.push(subscriber.id);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(id = subscriber.id, "Subscriber closed");
                    dead.push(subscriber.id);
                }
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            let subscribers = &mut inner.subscribers;
            for id in &dead {
                subscribers.remove(id);
            }
            stats.dropped = dead.len();
            if let Some(metrics) = &self.metrics {
                metrics.api_subscribers_dropped_total.inc_by(dead.len() as u64);
                metrics.api_subscribers.set(subscribers.len() as i64);
            }
        }

        stats
    }
}
