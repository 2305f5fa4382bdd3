//! Expiry reconciliation: bids left unresolved after their slot's window
//! has passed are forced to rejected (and refunded) through the normal
//! BidLedger transition, then the slot is closed out.
//!
//! The sweep is idempotent. Resolved bids no longer match the
//! "unresolved + paid" predicate, so a second pass over the same slots
//! finds nothing to do.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;

use crate::bids::BidLedger;
use crate::clock::Clock;
use crate::errors::{EngineError, EngineResult};
use crate::models::{EventId, SlotStatus};
use crate::slots::SlotScheduler;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub slots_expired: usize,
    pub bids_refunded: usize,
}

pub struct ExpiryReconciler {
    scheduler: Arc<SlotScheduler>,
    bids: Arc<BidLedger>,
    clock: Arc<dyn Clock>,
}

impl ExpiryReconciler {
    pub fn new(scheduler: Arc<SlotScheduler>, bids: Arc<BidLedger>, clock: Arc<dyn Clock>) -> Self {
        Self { scheduler, bids, clock }
    }

    /// Resolve everything stranded in slots that ended before `now`.
    /// Current and future slots are never touched.
    pub fn sweep_at(&self, event_id: EventId, now: DateTime<Utc>) -> EngineResult<SweepStats> {
        let slots = self.scheduler.slots_for_event(event_id);
        if slots.is_empty() {
            return Err(EngineError::NotFound { kind: "event", id: event_id.to_string() });
        }

        let mut stats = SweepStats::default();
        for slot in slots.into_iter().filter(|s| s.has_ended(now)) {
            let stranded = self.bids.unresolved_paid_in_slot(slot.id);
            if !stranded.is_empty() {
                log::info!(
                    "Expiring slot #{}: {} unresolved bid(s) to refund",
                    slot.slot_number, stranded.len()
                );
            }
            for bid_id in stranded {
                match self.bids.expire(bid_id) {
                    Ok(_) => stats.bids_refunded += 1,
                    // Lost the race against an operator action; the bid is
                    // resolved either way.
                    Err(EngineError::Conflict(_)) => {}
                    Err(e) => {
                        log::error!("Failed to expire bid {}: {}", bid_id, e);
                        return Err(e);
                    }
                }
            }
            if slot.status != SlotStatus::Completed {
                self.scheduler.complete_slot(slot.id)?;
                stats.slots_expired += 1;
            }
        }
        Ok(stats)
    }

    pub fn sweep(&self, event_id: EventId) -> EngineResult<SweepStats> {
        self.sweep_at(event_id, self.clock.now())
    }

    /// Run the sweep on an interval in a background task.
    pub fn spawn_sweep_loop(
        self: Arc<Self>,
        event_id: EventId,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            log::info!(
                "Expiry reconciler started for event {} (interval {}s)",
                event_id,
                interval.as_secs()
            );
            loop {
                match self.sweep(event_id) {
                    Ok(stats) if stats.bids_refunded > 0 => {
                        log::info!(
                            "Expiry sweep: {} slot(s) closed, {} bid(s) refunded",
                            stats.slots_expired, stats.bids_refunded
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Expiry sweep failed: {}", e),
                }
                sleep(interval).await;
            }
        })
    }
}
