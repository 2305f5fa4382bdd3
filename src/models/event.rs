use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type EventId = Uuid;
pub type SlotId = Uuid;

/// A bookable session. Immutable once its slots have been generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub duration_hours: u32,
    /// Derives the slot duration: 60 / slots_per_hour minutes.
    pub slots_per_hour: u32,
    pub active: bool,
    pub slots_generated: bool,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn slot_duration(&self) -> Duration {
        Duration::seconds(3600 / self.slots_per_hour as i64)
    }

    pub fn total_slots(&self) -> u32 {
        self.duration_hours * self.slots_per_hour
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::hours(self.duration_hours as i64)
    }
}

/// Lifecycle of a slot. Timing is immutable after generation; only the
/// status and the winner reference ever change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Bidding,
    Locked,
    Completed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Bidding => "bidding",
            Self::Locked => "locked",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "bidding" => Some(Self::Bidding),
            "locked" => Some(Self::Locked),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Slots that can still receive bids.
    pub fn accepts_bids(&self) -> bool {
        matches!(self, Self::Available | Self::Bidding)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub event_id: EventId,
    /// Sequential 1..N, unique per event.
    pub slot_number: u32,
    pub scheduled_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SlotStatus,
    pub current_winner_bid_id: Option<Uuid>,
}

impl Slot {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time <= now && now < self.end_time
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(slots_per_hour: u32) -> Event {
        Event {
            id: Uuid::new_v4(),
            name: "Friday Night".to_string(),
            start_time: Utc::now(),
            duration_hours: 2,
            slots_per_hour,
            active: true,
            slots_generated: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_slot_duration_derivation() {
        assert_eq!(event(12).slot_duration(), Duration::minutes(5));
        assert_eq!(event(4).slot_duration(), Duration::minutes(15));
        assert_eq!(event(1).slot_duration(), Duration::hours(1));
    }

    #[test]
    fn test_total_slots() {
        assert_eq!(event(12).total_slots(), 24);
        assert_eq!(event(4).total_slots(), 8);
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            SlotStatus::Available,
            SlotStatus::Bidding,
            SlotStatus::Locked,
            SlotStatus::Completed,
        ] {
            assert_eq!(SlotStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(SlotStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_slot_window() {
        let ev = event(12);
        let slot = Slot {
            id: Uuid::new_v4(),
            event_id: ev.id,
            slot_number: 1,
            scheduled_time: ev.start_time,
            end_time: ev.start_time + ev.slot_duration(),
            status: SlotStatus::Bidding,
            current_winner_bid_id: None,
        };
        assert!(slot.contains(ev.start_time));
        assert!(slot.contains(ev.start_time + Duration::minutes(4)));
        assert!(!slot.contains(ev.start_time + Duration::minutes(5)));
        assert!(slot.has_ended(ev.start_time + Duration::minutes(5)));
    }
}
