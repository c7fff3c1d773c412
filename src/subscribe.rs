//! Push delivery of snapshots through bounded per-subscriber queues.
//!
//! The poll thread never waits on a consumer: a full queue drops that
//! subscriber's copy of the snapshot and counts it.

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, warn};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::snapshot::Snapshot;

pub type SubscriberId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    /// Snapshots accepted into the queue
    pub delivered: u64,
    /// Snapshots dropped because the queue was full
    pub dropped: u64,
    /// Callback invocations that panicked
    pub panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    panics: AtomicU64,
}

impl Counters {
    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: Sender<Snapshot>,
    counters: Arc<Counters>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, sender: Sender<Snapshot>, counters: Arc<Counters>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber {
                id,
                sender,
                counters,
            });
        }
        id
    }

    /// Run `callback` for every published snapshot on a dedicated delivery
    /// thread. A panicking callback is logged and keeps its subscription.
    pub fn subscribe<F>(&self, capacity: usize, callback: F) -> SubscriberId
    where
        F: Fn(&Snapshot) + Send + 'static,
    {
        let (tx, rx) = bounded::<Snapshot>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let id = self.add(tx, Arc::clone(&counters));

        let spawned = thread::Builder::new()
            .name(format!("telemetry-sub-{}", id))
            .spawn(move || {
                for snapshot in rx.iter() {
                    if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                        counters.panics.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "[subscribe] subscriber {} panicked on snapshot {}",
                            id, snapshot.sequence
                        );
                    }
                }
                debug!("[subscribe] delivery thread for {} finished", id);
            });
        if let Err(e) = spawned {
            error!("[subscribe] failed to spawn delivery thread for {}: {}", id, e);
            self.unsubscribe(id);
        }
        id
    }

    /// Pull-style subscription: the caller owns the receiving end.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriberId, Receiver<Snapshot>) {
        let (tx, rx) = bounded::<Snapshot>(capacity.max(1));
        let id = self.add(tx, Arc::new(Counters::default()));
        (id, rx)
    }

    /// Returns false when `id` was not subscribed. The delivery thread drains
    /// what is already queued and exits.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers
            .lock()
            .ok()
            .map(|mut subs| {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            })
            .unwrap_or(false)
    }

    /// Non-blocking fan-out. Subscribers whose receiver is gone are removed.
    pub fn publish(&self, snapshot: &Snapshot) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|sub| match sub.sender.try_send(snapshot.clone()) {
            Ok(()) => {
                sub.counters.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = sub.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(
                        "[subscribe] subscriber {} queue full, {} snapshot(s) dropped",
                        sub.id, dropped
                    );
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("[subscribe] subscriber {} went away", sub.id);
                false
            }
        });
    }

    pub fn stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.subscribers.lock().ok().and_then(|subs| {
            subs.iter()
                .find(|s| s.id == id)
                .map(|s| s.counters.stats())
        })
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionStatus;
    use crate::normalizer::CanonicalSample;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn snapshot(sequence: u64) -> Snapshot {
        Snapshot {
            sequence,
            timestamp: sequence as f64,
            fusion_status: FusionStatus::Uninitialized,
            sample: CanonicalSample {
                timestamp: sequence as f64,
                channels: BTreeMap::new(),
                raw: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let registry = SubscriberRegistry::new();
        let (id, rx) = registry.subscribe_channel(2);
        for seq in 1..=5 {
            registry.publish(&snapshot(seq));
        }
        let stats = registry.stats(id).unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 3);
        // Oldest are kept, newer ones dropped
        assert_eq!(rx.try_recv().unwrap().sequence, 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
    }

    #[test]
    fn test_dropped_receiver_is_removed() {
        let registry = SubscriberRegistry::new();
        let (_, rx) = registry.subscribe_channel(4);
        drop(rx);
        registry.publish(&snapshot(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let registry = SubscriberRegistry::new();
        let (seen_tx, seen_rx) = bounded(16);
        let id = registry.subscribe(8, move |snap| {
            if snap.sequence == 1 {
                panic!("consumer bug");
            }
            let _ = seen_tx.send(snap.sequence);
        });
        registry.publish(&snapshot(1));
        registry.publish(&snapshot(2));

        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        assert_eq!(registry.stats(id).unwrap().panics, 1);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = SubscriberRegistry::new();
        let (id, rx) = registry.subscribe_channel(4);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.publish(&snapshot(1));
        assert!(rx.try_recv().is_err());
    }
}
