//! Bid ledger: bid records, the bid state machine, leaderboard derivation
//! and the event-wide current winner.
//!
//! Money only moves through the WalletLedger and slots are only read
//! through the SlotScheduler. Every compound financial step (debit + create,
//! refund + status flip) runs under the bid lock with the fallible part
//! first, so either the whole unit commits or nothing does. Lock order is
//! fixed: bids -> wallets and bids -> slots, never the other way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::broadcast::RealtimeBroadcaster;
use crate::clock::Clock;
use crate::configure::AppConfig;
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    Bid, BidId, BidStatus, CreateBidRequest, EngineUpdate, EventId, PaymentStatus, SlotId,
};
use crate::slots::SlotScheduler;
use crate::wallet_ledger::WalletLedger;

#[derive(Default)]
struct BidState {
    bids: HashMap<BidId, Bid>,
    /// Submission order per event; keeps leaderboard tie-breaks stable.
    by_event: HashMap<EventId, Vec<BidId>>,
    by_slot: HashMap<SlotId, Vec<BidId>>,
    current_winner: HashMap<EventId, BidId>,
}

impl BidState {
    fn unresolved_count(&self, slot_id: SlotId) -> usize {
        self.by_slot
            .get(&slot_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.bids.get(id))
                    .filter(|b| b.is_unresolved())
                    .count()
            })
            .unwrap_or(0)
    }
}

pub struct BidLedger {
    state: Mutex<BidState>,
    wallets: Arc<WalletLedger>,
    scheduler: Arc<SlotScheduler>,
    broadcaster: Arc<RealtimeBroadcaster>,
    config: Arc<AppConfig>,
    clock: Arc<dyn Clock>,
}

impl BidLedger {
    pub fn new(
        wallets: Arc<WalletLedger>,
        scheduler: Arc<SlotScheduler>,
        broadcaster: Arc<RealtimeBroadcaster>,
        config: Arc<AppConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(BidState::default()),
            wallets,
            scheduler,
            broadcaster,
            config,
            clock,
        }
    }

    /// Submit a bid: validate, pick a slot, debit, create. The debit is the
    /// only fallible step after the slot is chosen, so a failed submission
    /// leaves no bid and no money movement behind.
    pub fn submit(&self, req: &CreateBidRequest) -> EngineResult<Bid> {
        req.validate(self.config.min_bid_amount)?;

        // No implicit wallet creation from a bid
        if self.wallets.get(req.wallet_id).is_none() {
            return Err(EngineError::NotFound { kind: "wallet", id: req.wallet_id.to_string() });
        }

        let now = self.clock.now();
        let current = self
            .scheduler
            .current_slot(req.event_id, now)?
            .ok_or_else(|| EngineError::NotFound {
                kind: "active slot",
                id: req.event_id.to_string(),
            })?;

        let mut state = self.lock();

        // Counting and the insert below share this lock: two racing bids
        // cannot both squeeze into the last opening of a slot.
        let chosen = {
            let count = |slot_id: SlotId| state.unresolved_count(slot_id);
            self.scheduler.select_slot_for_bid(
                req.event_id,
                current.id,
                self.config.max_bids_per_slot,
                self.config.slot_lookahead,
                &count,
            )?
        };

        let bid_id = Uuid::new_v4();
        let song = req.song();
        self.wallets.debit(
            req.wallet_id,
            req.amount,
            &format!("Bid placed for \"{}\"", song.title),
            Some(bid_id),
        )?;

        let bid = Bid {
            id: bid_id,
            event_id: req.event_id,
            slot_id: chosen.id,
            wallet_id: req.wallet_id,
            song,
            amount: req.amount,
            bidder_name: req.bidder_name(),
            submitted_at: now,
            status: BidStatus::Pending,
            payment_status: PaymentStatus::Paid,
            approved_at: None,
            played_at: None,
        };
        state.bids.insert(bid_id, bid.clone());
        state.by_event.entry(req.event_id).or_default().push(bid_id);
        state.by_slot.entry(chosen.id).or_default().push(bid_id);

        log::info!(
            "Bid {} ({} by {}) -> slot #{}",
            bid_id, bid.amount, bid.bidder_name, chosen.slot_number
        );
        self.broadcaster.publish(EngineUpdate::BidCreated(bid.clone()));
        Ok(bid)
    }

    /// Operator transition: approve, reject or play a bid.
    pub fn set_status(&self, bid_id: BidId, target: BidStatus) -> EngineResult<Bid> {
        if !matches!(target, BidStatus::Approved | BidStatus::Rejected | BidStatus::Played) {
            return Err(EngineError::Validation(format!(
                "cannot set a bid back to {}",
                target
            )));
        }
        self.transition(bid_id, target, RefundReason::Rejected)
    }

    /// Forced rejection for a bid stranded in an elapsed slot. Same
    /// transition table as an operator reject, different refund narrative.
    pub fn expire(&self, bid_id: BidId) -> EngineResult<Bid> {
        self.transition(bid_id, BidStatus::Rejected, RefundReason::SlotExpired)
    }

    fn transition(
        &self,
        bid_id: BidId,
        target: BidStatus,
        reason: RefundReason,
    ) -> EngineResult<Bid> {
        let now = self.clock.now();
        let mut state = self.lock();

        let bid = state
            .bids
            .get(&bid_id)
            .ok_or_else(|| EngineError::NotFound { kind: "bid", id: bid_id.to_string() })?
            .clone();

        // Compare-and-set on the current status: a reject racing the expiry
        // sweep loses here instead of refunding twice.
        if !bid.status.can_transition_to(target) {
            if bid.status.is_terminal() {
                return Err(EngineError::Conflict(format!(
                    "bid {} already resolved as {}",
                    bid_id, bid.status
                )));
            }
            return Err(EngineError::InvalidTransition {
                from: bid.status.as_str().to_string(),
                to: target.as_str().to_string(),
            });
        }

        // Fallible side effects first; the bid record only mutates once
        // they have committed, keeping status + refund one atomic unit.
        match target {
            BidStatus::Rejected => {
                if bid.payment_status == PaymentStatus::Paid {
                    self.wallets.refund(
                        bid.wallet_id,
                        bid.amount,
                        &reason.description(&bid.song.title),
                        bid_id,
                    )?;
                }
            }
            BidStatus::Played => {
                self.scheduler.set_slot_winner(bid.slot_id, bid_id)?;
            }
            _ => {}
        }

        let event_id = bid.event_id;
        let stored = state.bids.get_mut(&bid_id).expect("bid vanished under lock");
        stored.status = target;
        match target {
            BidStatus::Approved => stored.approved_at = Some(now),
            BidStatus::Rejected => {
                if stored.payment_status == PaymentStatus::Paid {
                    stored.payment_status = PaymentStatus::Refunded;
                }
            }
            BidStatus::Played => stored.played_at = Some(now),
            BidStatus::Pending => unreachable!("pending is never a transition target"),
        }
        let updated = stored.clone();
        if target == BidStatus::Played {
            state.current_winner.insert(event_id, bid_id);
        }

        log::info!("Bid {} -> {}", bid_id, target);
        self.broadcaster.publish(EngineUpdate::BidUpdated(updated.clone()));
        Ok(updated)
    }

    /// Approved bids ranked by amount, earliest submission winning ties.
    pub fn leaderboard(&self, event_id: EventId, limit: usize) -> Vec<Bid> {
        let state = self.lock();
        let mut board: Vec<Bid> = state
            .by_event
            .get(&event_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.bids.get(id))
                    .filter(|b| b.status == BidStatus::Approved)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        board.sort_by(|a, b| {
            b.amount.cmp(&a.amount).then(a.submitted_at.cmp(&b.submitted_at))
        });
        board.truncate(limit);
        board
    }

    /// Operator listing: amount descending, newest submission first on ties.
    pub fn list_bids(
        &self,
        event_id: EventId,
        status: Option<BidStatus>,
        limit: usize,
    ) -> Vec<Bid> {
        let state = self.lock();
        let mut bids: Vec<Bid> = state
            .by_event
            .get(&event_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.bids.get(id))
                    .filter(|b| status.map_or(true, |s| b.status == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        bids.sort_by(|a, b| {
            b.amount.cmp(&a.amount).then(b.submitted_at.cmp(&a.submitted_at))
        });
        bids.truncate(limit);
        bids
    }

    /// Unresolved bids competing for one slot, in leaderboard order.
    pub fn top_bids_for_slot(&self, slot_id: SlotId, limit: usize) -> Vec<Bid> {
        let state = self.lock();
        let mut bids: Vec<Bid> = state
            .by_slot
            .get(&slot_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.bids.get(id))
                    .filter(|b| b.is_unresolved())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        bids.sort_by(|a, b| {
            b.amount.cmp(&a.amount).then(a.submitted_at.cmp(&b.submitted_at))
        });
        bids.truncate(limit);
        bids
    }

    /// The expiry sweep's predicate: still competing, money still held.
    pub fn unresolved_paid_in_slot(&self, slot_id: SlotId) -> Vec<BidId> {
        let state = self.lock();
        state
            .by_slot
            .get(&slot_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.bids.get(id))
                    .filter(|b| b.is_unresolved() && b.payment_status == PaymentStatus::Paid)
                    .map(|b| b.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unresolved_count(&self, slot_id: SlotId) -> usize {
        self.lock().unresolved_count(slot_id)
    }

    pub fn get(&self, bid_id: BidId) -> Option<Bid> {
        self.lock().bids.get(&bid_id).cloned()
    }

    pub fn bids_for_event(&self, event_id: EventId) -> Vec<Bid> {
        let state = self.lock();
        state
            .by_event
            .get(&event_id)
            .map(|ids| ids.iter().filter_map(|id| state.bids.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_winner(&self, event_id: EventId) -> Option<Bid> {
        let state = self.lock();
        state.current_winner.get(&event_id).and_then(|id| state.bids.get(id)).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BidState> {
        self.state.lock().expect("bid state lock poisoned")
    }
}

#[derive(Clone, Copy)]
enum RefundReason {
    Rejected,
    SlotExpired,
}

impl RefundReason {
    fn description(&self, song_title: &str) -> String {
        match self {
            Self::Rejected => format!("Refund: bid rejected for \"{}\"", song_title),
            Self::SlotExpired => {
                format!("Refund: slot ended without play for \"{}\"", song_title)
            }
        }
    }
}
