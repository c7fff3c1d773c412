//! Shared snapshot store: the only cross-thread telemetry state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::fusion::FusionStatus;
use crate::normalizer::CanonicalSample;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    /// Increments once per published tick; never reused, even across restarts
    pub sequence: u64,
    pub timestamp: f64,
    pub fusion_status: FusionStatus,
    pub sample: CanonicalSample,
}

/// Latest snapshot plus the epoch it belongs to. `clear()` starts a new
/// epoch, and writers from an older epoch can no longer publish.
#[derive(Debug)]
struct Latest {
    snapshot: Snapshot,
    epoch: u64,
}

/// Mutex-guarded latest snapshot. Writers build the next snapshot outside the
/// lock and only move it in; readers clone under the lock. The sequence is
/// assigned under the same lock, so stored sequences never go backwards.
#[derive(Debug)]
pub struct SnapshotStore {
    latest: Mutex<Latest>,
    empty: CanonicalSample,
    sequence: AtomicU64,
}

impl SnapshotStore {
    pub fn new(empty: CanonicalSample) -> Self {
        Self {
            latest: Mutex::new(Latest {
                snapshot: Snapshot {
                    sequence: 0,
                    timestamp: empty.timestamp,
                    fusion_status: FusionStatus::Uninitialized,
                    sample: empty.clone(),
                },
                epoch: 0,
            }),
            empty,
            sequence: AtomicU64::new(0),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Latest> {
        // Writes are a single move, so a poisoned lock still holds a whole snapshot
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current epoch; a writer captures it before its first `publish`.
    pub fn epoch(&self) -> u64 {
        self.guard().epoch
    }

    /// Publish a sample as the next sequence number and return a copy for
    /// fan-out. Returns `None`, storing nothing, when `epoch` is stale.
    pub fn publish(
        &self,
        epoch: u64,
        sample: CanonicalSample,
        fusion_status: FusionStatus,
    ) -> Option<Snapshot> {
        let mut snapshot = Snapshot {
            sequence: 0,
            timestamp: sample.timestamp,
            fusion_status,
            sample,
        };
        let mut copy = snapshot.clone();

        let mut latest = self.guard();
        if latest.epoch != epoch {
            return None;
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        snapshot.sequence = sequence;
        latest.snapshot = snapshot;
        drop(latest);

        copy.sequence = sequence;
        Some(copy)
    }

    pub fn latest(&self) -> Snapshot {
        self.guard().snapshot.clone()
    }

    pub fn latest_sample(&self) -> CanonicalSample {
        self.guard().snapshot.sample.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Reset the sample to defaults and start a new epoch. The sequence keeps
    /// counting.
    pub fn clear(&self, timestamp: f64) {
        let mut sample = self.empty.clone();
        sample.timestamp = timestamp;
        let mut cleared = Snapshot {
            sequence: 0,
            timestamp,
            fusion_status: FusionStatus::Uninitialized,
            sample,
        };

        let mut latest = self.guard();
        cleared.sequence = self.sequence();
        latest.snapshot = cleared;
        latest.epoch += 1;
    }
}
