use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::event::{EventId, SlotId};
use crate::models::wallet::WalletId;

pub type BidId = Uuid;

/// Bid lifecycle states.
///
/// pending -> approved -> played
/// pending -> rejected
/// approved -> rejected   (late reject, refunds)
///
/// `rejected` and `played` are terminal. Slot expiry forces
/// pending/approved bids to rejected through the same transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Pending,
    Approved,
    Rejected,
    Played,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Played => "played",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "played" => Some(Self::Played),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Played)
    }

    /// Bids still competing for a slot. Only these count against capacity.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }

    /// Transition table for operator and expiry driven changes.
    pub fn can_transition_to(&self, target: BidStatus) -> bool {
        matches!(
            (self, target),
            (Self::Pending, BidStatus::Approved)
                | (Self::Pending, BidStatus::Rejected)
                | (Self::Approved, BidStatus::Played)
                | (Self::Approved, BidStatus::Rejected)
        )
    }
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the escrowed money is still held or has been returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Refunded => "refunded",
        }
    }
}

/// What the bidder asked to hear. Title is the only required field; the
/// rest comes from the external catalog when the bidder picked a track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongSelection {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub external_track_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub event_id: EventId,
    pub slot_id: SlotId,
    pub wallet_id: WalletId,
    pub song: SongSelection,
    pub amount: Decimal,
    pub bidder_name: String,
    pub submitted_at: DateTime<Utc>,
    pub status: BidStatus,
    pub payment_status: PaymentStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub played_at: Option<DateTime<Utc>>,
}

impl Bid {
    pub fn is_unresolved(&self) -> bool {
        self.status.is_unresolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(BidStatus::Pending.can_transition_to(BidStatus::Approved));
        assert!(BidStatus::Pending.can_transition_to(BidStatus::Rejected));
        assert!(BidStatus::Approved.can_transition_to(BidStatus::Played));
        assert!(BidStatus::Approved.can_transition_to(BidStatus::Rejected));
    }

    #[test]
    fn test_invalid_transitions() {
        // played only from approved
        assert!(!BidStatus::Pending.can_transition_to(BidStatus::Played));
        // terminal states are stable
        assert!(!BidStatus::Rejected.can_transition_to(BidStatus::Approved));
        assert!(!BidStatus::Played.can_transition_to(BidStatus::Rejected));
        assert!(!BidStatus::Played.can_transition_to(BidStatus::Approved));
    }

    #[test]
    fn test_terminal_and_unresolved() {
        assert!(BidStatus::Rejected.is_terminal());
        assert!(BidStatus::Played.is_terminal());
        assert!(BidStatus::Pending.is_unresolved());
        assert!(BidStatus::Approved.is_unresolved());
        assert!(!BidStatus::Played.is_unresolved());
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            BidStatus::Pending,
            BidStatus::Approved,
            BidStatus::Rejected,
            BidStatus::Played,
        ] {
            assert_eq!(BidStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(BidStatus::from_str("PLAYED"), None);
    }
}
