//! The facade the transport layer talks to. Wires the wallet ledger, slot
//! scheduler, bid ledger, expiry reconciler and broadcaster together and
//! owns the background tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::bids::BidLedger;
use crate::broadcast::RealtimeBroadcaster;
use crate::clock::{Clock, SystemClock};
use crate::configure::AppConfig;
use crate::errors::{EngineError, EngineResult};
use crate::expiry::{ExpiryReconciler, SweepStats};
use crate::models::{
    Bid, BidId, BidStatus, CreateBidRequest, EngineSnapshot, Event, EventId, Slot, SlotId,
    SlotStatus, StreamMessage, Wallet, WalletId, WalletTransaction,
};
use crate::music::{Track, TrackSearch};
use crate::slots::{RotationHandle, SlotScheduler};
use crate::wallet_ledger::WalletLedger;

/// Aggregate view for the operator dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatistics {
    pub total_slots: usize,
    pub completed_slots: usize,
    pub upcoming_slots: usize,
    pub active_slot: Option<Slot>,
    pub total_bids: usize,
    /// Sum of approved + played bid amounts.
    pub total_revenue: Decimal,
}

pub struct AuctionEngine {
    config: Arc<AppConfig>,
    clock: Arc<dyn Clock>,
    broadcaster: Arc<RealtimeBroadcaster>,
    wallets: Arc<WalletLedger>,
    scheduler: Arc<SlotScheduler>,
    bids: Arc<BidLedger>,
    reconciler: Arc<ExpiryReconciler>,
    catalog: Option<Arc<dyn TrackSearch>>,
    rotation: Mutex<Option<RotationHandle>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AuctionEngine {
    pub fn new(config: AppConfig, catalog: Option<Arc<dyn TrackSearch>>) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock), catalog)
    }

    pub fn with_clock(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        catalog: Option<Arc<dyn TrackSearch>>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let broadcaster = Arc::new(RealtimeBroadcaster::new(clock.clone()));
        let wallets = Arc::new(WalletLedger::new(broadcaster.clone(), clock.clone()));
        let scheduler = Arc::new(SlotScheduler::new(broadcaster.clone(), clock.clone()));
        let bids = Arc::new(BidLedger::new(
            wallets.clone(),
            scheduler.clone(),
            broadcaster.clone(),
            config.clone(),
            clock.clone(),
        ));
        let reconciler =
            Arc::new(ExpiryReconciler::new(scheduler.clone(), bids.clone(), clock.clone()));

        Arc::new(Self {
            config,
            clock,
            broadcaster,
            wallets,
            scheduler,
            bids,
            reconciler,
            catalog,
            rotation: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }

    // ---- Event & slot setup ----

    pub fn create_event(
        &self,
        name: &str,
        start_time: chrono::DateTime<chrono::Utc>,
        duration_hours: u32,
        slots_per_hour: u32,
    ) -> EngineResult<Event> {
        self.scheduler.create_event(name, start_time, duration_hours, slots_per_hour)
    }

    pub fn generate_slots(&self, event_id: EventId) -> EngineResult<Vec<Slot>> {
        self.scheduler.generate_slots(event_id)
    }

    // ---- Bidding ----

    pub fn create_bid(&self, req: &CreateBidRequest) -> EngineResult<Bid> {
        self.bids.submit(req)
    }

    pub fn set_bid_status(&self, bid_id: BidId, status: BidStatus) -> EngineResult<Bid> {
        self.bids.set_status(bid_id, status)
    }

    pub fn list_bids(
        &self,
        event_id: EventId,
        status: Option<BidStatus>,
        limit: usize,
    ) -> Vec<Bid> {
        self.bids.list_bids(event_id, status, limit)
    }

    pub fn get_top_bids(&self, slot_id: SlotId, limit: usize) -> Vec<Bid> {
        self.bids.top_bids_for_slot(slot_id, limit)
    }

    pub fn get_leaderboard(&self, event_id: EventId, limit: Option<usize>) -> Vec<Bid> {
        self.bids.leaderboard(event_id, limit.unwrap_or(self.config.leaderboard_size))
    }

    pub fn get_current_winner(&self, event_id: EventId) -> Option<Bid> {
        self.bids.current_winner(event_id)
    }

    // ---- Wallets ----

    pub fn add_funds(&self, user_id: &str, amount: Decimal) -> EngineResult<Wallet> {
        self.wallets.credit(user_id, amount, "Wallet top-up")
    }

    pub fn get_wallet_balance(&self, user_id: &str) -> Decimal {
        self.wallets.balance_of(user_id)
    }

    pub fn get_wallet(&self, user_id: &str) -> Option<Wallet> {
        self.wallets.wallet_for_user(user_id)
    }

    pub fn wallet_transactions(&self, wallet_id: WalletId) -> Vec<WalletTransaction> {
        self.wallets.transactions_for(wallet_id)
    }

    // ---- Slots ----

    pub fn get_current_slot(&self, event_id: EventId) -> EngineResult<Option<Slot>> {
        self.scheduler.current_slot(event_id, self.clock.now())
    }

    /// Operator-forced rotation: the current slot is treated as if its
    /// window had just elapsed (stranded bids refunded, slot completed),
    /// the next waiting slot opens for bidding, and the rotation timer is
    /// re-armed so it cannot also fire for the boundary it was sleeping
    /// towards.
    pub fn force_next_slot(&self, event_id: EventId) -> EngineResult<Option<Slot>> {
        let now = self.clock.now();
        let current = self.scheduler.current_slot(event_id, now)?;

        let after = match current {
            Some(slot) => {
                for bid_id in self.bids.unresolved_paid_in_slot(slot.id) {
                    match self.bids.expire(bid_id) {
                        Ok(_) => {}
                        Err(EngineError::Conflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.scheduler.complete_slot(slot.id)?;
                log::info!("Operator forced rotation past slot #{}", slot.slot_number);
                slot.slot_number
            }
            None => 0,
        };

        let opened = self.scheduler.open_next_slot(event_id, after)?;
        if let Some(handle) = self.rotation.lock().expect("rotation lock poisoned").as_ref() {
            handle.fire_now();
        }
        Ok(opened)
    }

    pub fn slot_statistics(&self, event_id: EventId) -> EngineResult<SlotStatistics> {
        let slots = self.scheduler.slots_for_event(event_id);
        if slots.is_empty() {
            return Err(EngineError::NotFound { kind: "event", id: event_id.to_string() });
        }
        let bids = self.bids.bids_for_event(event_id);

        let now = self.clock.now();
        Ok(SlotStatistics {
            total_slots: slots.len(),
            completed_slots: slots.iter().filter(|s| s.status == SlotStatus::Completed).count(),
            upcoming_slots: slots.iter().filter(|s| s.status == SlotStatus::Available).count(),
            active_slot: slots.iter().find(|s| s.contains(now)).cloned(),
            total_bids: bids.len(),
            total_revenue: bids
                .iter()
                .filter(|b| matches!(b.status, BidStatus::Approved | BidStatus::Played))
                .map(|b| b.amount)
                .sum(),
        })
    }

    // ---- Realtime ----

    /// Register an observer. The delta stream is registered before the
    /// snapshot is assembled, so every mutation committed after the
    /// snapshot arrives as a delta; deltas at or below the snapshot
    /// version are duplicates the subscriber drops (or re-applies, the
    /// payloads are full records).
    pub fn subscribe(
        &self,
        event_id: EventId,
    ) -> (EngineSnapshot, broadcast::Receiver<StreamMessage>) {
        let rx = self.broadcaster.subscribe();
        let snapshot = self.snapshot(event_id);
        (snapshot, rx)
    }

    pub fn snapshot(&self, event_id: EventId) -> EngineSnapshot {
        // Version first: state collected afterwards can only be newer, and
        // newer deltas re-apply cleanly.
        let version = self.broadcaster.version();
        EngineSnapshot {
            version,
            event: self.scheduler.event(event_id),
            slots: self.scheduler.slots_for_event(event_id),
            bids: self.bids.bids_for_event(event_id),
            leaderboard: self.bids.leaderboard(event_id, self.config.leaderboard_size),
            current_winner: self.bids.current_winner(event_id),
        }
    }

    // ---- Music search ----

    /// Search the external catalog. Provider trouble degrades to an empty
    /// result; it never surfaces as an error to a bidder mid-flow.
    pub async fn search_songs(&self, query: &str, limit: usize) -> Vec<Track> {
        let Some(catalog) = &self.catalog else {
            return Vec::new();
        };
        match catalog.search(query, limit).await {
            Ok(tracks) => tracks,
            Err(e) => {
                log::warn!("Track search degraded to empty result: {}", e);
                Vec::new()
            }
        }
    }

    // ---- Background tasks ----

    /// Start the expiry sweeper and the slot-rotation timer for an event.
    pub fn spawn_background(self: &Arc<Self>, event_id: EventId) {
        let sweeper = self
            .reconciler
            .clone()
            .spawn_sweep_loop(event_id, Duration::from_secs(self.config.sweep_interval_secs));
        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(sweeper);

        let engine = self.clone();
        let rotation = self.scheduler.clone().spawn_rotation_loop(event_id, move || {
            if let Err(e) = engine.reconciler.sweep(event_id) {
                log::error!("Boundary sweep failed: {}", e);
            }
            if let Err(e) = engine.scheduler.advance(event_id, engine.clock.now()) {
                log::error!("Slot advance failed: {}", e);
            }
        });
        *self.rotation.lock().expect("rotation lock poisoned") = Some(rotation);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.rotation.lock().expect("rotation lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
    }

    /// Run one expiry sweep immediately (also available to transports that
    /// prefer lazy reconciliation on read).
    pub fn sweep_now(&self, event_id: EventId) -> EngineResult<SweepStats> {
        self.reconciler.sweep(event_id)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::EngineUpdate;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use uuid::Uuid;

    fn test_config() -> AppConfig {
        AppConfig {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: String::new(),
            currency_symbol: "₹".to_string(),
            min_bid_amount: Decimal::from(50),
            max_bids_per_slot: 5,
            slot_lookahead: 5,
            leaderboard_size: 10,
            sweep_interval_secs: 15,
            music_api_base: String::new(),
            music_cache_ttl_secs: 300,
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 20, 0, 0).unwrap()
    }

    fn engine() -> (Arc<AuctionEngine>, Arc<ManualClock>, Event) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let engine = AuctionEngine::with_clock(test_config(), clock.clone(), None);
        let event = engine.create_event("Test Night", start_time(), 2, 12).unwrap();
        engine.generate_slots(event.id).unwrap();
        (engine, clock, event)
    }

    fn bid_request(event_id: EventId, wallet_id: Uuid, title: &str, amount: i64) -> CreateBidRequest {
        CreateBidRequest {
            event_id,
            wallet_id,
            song_title: title.to_string(),
            song_artist: None,
            song_album: None,
            external_track_id: None,
            message: None,
            amount: Decimal::from(amount),
            user_name: None,
        }
    }

    #[test]
    fn test_topup_bid_reject_scenario() {
        let (engine, _, event) = engine();

        assert_eq!(engine.get_wallet_balance("u1"), Decimal::ZERO);
        let wallet = engine.add_funds("u1", Decimal::from(100)).unwrap();
        assert_eq!(wallet.balance, Decimal::from(100));

        let bid = engine.create_bid(&bid_request(event.id, wallet.id, "Song", 60)).unwrap();
        assert_eq!(engine.get_wallet_balance("u1"), Decimal::from(40));
        assert_eq!(bid.status, BidStatus::Pending);

        engine.set_bid_status(bid.id, BidStatus::Rejected).unwrap();
        assert_eq!(engine.get_wallet_balance("u1"), Decimal::from(100));
    }

    #[test]
    fn test_subscribe_snapshot_then_delta() {
        let (engine, _, event) = engine();
        let wallet = engine.add_funds("u1", Decimal::from(200)).unwrap();
        engine.create_bid(&bid_request(event.id, wallet.id, "Before", 60)).unwrap();

        let (snapshot, mut rx) = engine.subscribe(event.id);
        assert_eq!(snapshot.bids.len(), 1);

        let after = engine.create_bid(&bid_request(event.id, wallet.id, "After", 70)).unwrap();

        // Skip anything already reflected in the snapshot, then expect the
        // new bid's delta.
        loop {
            let msg = rx.try_recv().expect("delta for the new bid must arrive");
            if msg.version <= snapshot.version {
                continue;
            }
            match msg.update {
                EngineUpdate::WalletChanged(_) => continue,
                EngineUpdate::BidCreated(bid) => {
                    assert_eq!(bid.id, after.id);
                    break;
                }
                other => panic!("unexpected update {other:?}"),
            }
        }
    }

    #[test]
    fn test_force_next_slot_refunds_and_opens_next() {
        let (engine, _, event) = engine();
        let wallet = engine.add_funds("u1", Decimal::from(100)).unwrap();
        let bid = engine.create_bid(&bid_request(event.id, wallet.id, "Song", 60)).unwrap();

        let opened = engine.force_next_slot(event.id).unwrap().unwrap();
        assert_eq!(opened.slot_number, 2);
        assert_eq!(opened.status, SlotStatus::Bidding);

        let resolved = engine.bids.get(bid.id).unwrap();
        assert_eq!(resolved.status, BidStatus::Rejected);
        assert_eq!(engine.get_wallet_balance("u1"), Decimal::from(100));

        // The forced-out slot no longer takes bids; new ones land in slot 2
        let next_bid = engine.create_bid(&bid_request(event.id, wallet.id, "Next", 60)).unwrap();
        assert_eq!(next_bid.slot_id, opened.id);
    }

    #[test]
    fn test_slot_statistics() {
        let (engine, clock, event) = engine();
        let wallet = engine.add_funds("u1", Decimal::from(500)).unwrap();

        let b1 = engine.create_bid(&bid_request(event.id, wallet.id, "A", 100)).unwrap();
        engine.create_bid(&bid_request(event.id, wallet.id, "B", 60)).unwrap();
        engine.set_bid_status(b1.id, BidStatus::Approved).unwrap();

        clock.advance(ChronoDuration::minutes(6));
        engine.sweep_now(event.id).unwrap();

        let stats = engine.slot_statistics(event.id).unwrap();
        assert_eq!(stats.total_slots, 24);
        assert_eq!(stats.completed_slots, 1);
        assert_eq!(stats.total_bids, 2);
        // Only the approved bid counts as revenue; it was refunded by the
        // sweep after its slot elapsed, so revenue reflects played/approved
        // at query time.
        assert_eq!(stats.total_revenue, Decimal::ZERO);
        assert_eq!(stats.active_slot.as_ref().unwrap().slot_number, 2);
    }

    #[tokio::test]
    async fn test_search_without_catalog_is_empty() {
        let (engine, _, _) = engine();
        assert!(engine.search_songs("daft punk", 5).await.is_empty());
    }
}
