use serde::{Deserialize, Serialize};

use crate::models::bid::Bid;
use crate::models::event::{Event, Slot};
use crate::models::wallet::Wallet;

/// One state mutation, with the updated record attached. Applying the same
/// update twice is harmless: every payload is the full record, so a delta
/// overlapping a snapshot upserts to the identical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineUpdate {
    BidCreated(Bid),
    BidUpdated(Bid),
    SlotChanged(Slot),
    WalletChanged(Wallet),
}

/// Versioned delta pushed to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    pub version: u64,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub update: EngineUpdate,
}

/// Full state a new subscriber receives before any delta. Deltas carrying a
/// version at or below `version` are duplicates and can be dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u64,
    pub event: Option<Event>,
    pub slots: Vec<Slot>,
    pub bids: Vec<Bid>,
    pub leaderboard: Vec<Bid>,
    pub current_winner: Option<Bid>,
}
