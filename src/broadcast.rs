//! Versioned fan-out of engine state changes.
//!
//! Every successful mutation publishes a delta tagged with a monotonically
//! increasing version. Version assignment and the channel send happen under
//! one lock, so subscribers always observe versions in order. Sending is
//! fire-and-forget: a slow subscriber lags (and re-snapshots), a
//! disconnected one is dropped, and neither ever blocks or fails the
//! mutation that triggered the publish.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::models::{EngineUpdate, StreamMessage};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct RealtimeBroadcaster {
    tx: broadcast::Sender<StreamMessage>,
    // Guards version assignment so publish order equals version order.
    version: Mutex<u64>,
    clock: Arc<dyn Clock>,
}

impl RealtimeBroadcaster {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx, version: Mutex::new(0), clock }
    }

    /// Publish a delta to all subscribers. Returns the version assigned to
    /// this update. Never blocks; with no subscribers the delta is dropped.
    pub fn publish(&self, update: EngineUpdate) -> u64 {
        let mut version = self.version.lock().expect("broadcast version lock poisoned");
        *version += 1;
        let msg = StreamMessage {
            version: *version,
            ts_ms: self.clock.now().timestamp_millis(),
            update,
        };
        // send() fails only when no receiver exists; that is fine.
        let _ = self.tx.send(msg);
        *version
    }

    /// Version of the most recently published delta.
    pub fn version(&self) -> u64 {
        *self.version.lock().expect("broadcast version lock poisoned")
    }

    /// Register a delta stream. Call this BEFORE assembling the snapshot
    /// handed to the subscriber: anything committed after the snapshot then
    /// arrives on the stream, and deltas at or below the snapshot version
    /// are idempotent duplicates the subscriber drops.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
