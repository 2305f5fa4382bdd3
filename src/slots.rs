//! Slot scheduling: eager slot generation, wall-clock current-slot
//! resolution, capacity-aware slot selection, slot status transitions and
//! the rotation timer task.
//!
//! The current slot is always derived from the ordered schedule and the
//! clock, never from a stored pointer, so it stays correct across process
//! restarts and forced rotations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::RealtimeBroadcaster;
use crate::clock::Clock;
use crate::errors::{EngineError, EngineResult};
use crate::models::{EngineUpdate, Event, EventId, Slot, SlotId, SlotStatus};

#[derive(Default)]
struct SlotState {
    events: HashMap<EventId, Event>,
    slots: HashMap<SlotId, Slot>,
    /// Slot ids per event, ordered by slot number.
    event_slots: HashMap<EventId, Vec<SlotId>>,
}

pub struct SlotScheduler {
    state: RwLock<SlotState>,
    broadcaster: Arc<RealtimeBroadcaster>,
    clock: Arc<dyn Clock>,
}

impl SlotScheduler {
    pub fn new(broadcaster: Arc<RealtimeBroadcaster>, clock: Arc<dyn Clock>) -> Self {
        Self { state: RwLock::new(SlotState::default()), broadcaster, clock }
    }

    pub fn create_event(
        &self,
        name: &str,
        start_time: DateTime<Utc>,
        duration_hours: u32,
        slots_per_hour: u32,
    ) -> EngineResult<Event> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("event name is required".to_string()));
        }
        if duration_hours == 0 {
            return Err(EngineError::Validation("event duration must be at least one hour".to_string()));
        }
        // Slot duration must divide the hour evenly
        if slots_per_hour == 0 || slots_per_hour > 60 || 3600 % slots_per_hour != 0 {
            return Err(EngineError::Validation(format!(
                "slots_per_hour {} does not divide an hour evenly",
                slots_per_hour
            )));
        }

        let event = Event {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            start_time,
            duration_hours,
            slots_per_hour,
            active: true,
            slots_generated: false,
            created_at: self.clock.now(),
        };
        self.write().events.insert(event.id, event.clone());
        log::info!("Created event {} ({}): {} slots of {}s", event.id, event.name,
            event.total_slots(), event.slot_duration().num_seconds());
        Ok(event)
    }

    /// Generate the full contiguous schedule for an event. The first slot
    /// opens for bidding immediately, the rest wait as `available`.
    /// Calling twice is a conflict; the existing slots are untouched.
    pub fn generate_slots(&self, event_id: EventId) -> EngineResult<Vec<Slot>> {
        let mut state = self.write();
        let event = state
            .events
            .get(&event_id)
            .ok_or_else(|| EngineError::NotFound { kind: "event", id: event_id.to_string() })?
            .clone();
        if event.slots_generated {
            return Err(EngineError::Conflict(format!(
                "slots already generated for event {}",
                event_id
            )));
        }

        let slot_duration = event.slot_duration();
        let mut slots = Vec::with_capacity(event.total_slots() as usize);
        let mut current_time = event.start_time;
        for i in 0..event.total_slots() {
            let slot = Slot {
                id: Uuid::new_v4(),
                event_id,
                slot_number: i + 1,
                scheduled_time: current_time,
                end_time: current_time + slot_duration,
                status: if i == 0 { SlotStatus::Bidding } else { SlotStatus::Available },
                current_winner_bid_id: None,
            };
            current_time += slot_duration;
            slots.push(slot);
        }

        let ids: Vec<SlotId> = slots.iter().map(|s| s.id).collect();
        for slot in &slots {
            state.slots.insert(slot.id, slot.clone());
        }
        state.event_slots.insert(event_id, ids);
        state.events.get_mut(&event_id).expect("event vanished").slots_generated = true;

        log::info!("Generated {} slots for event {}", slots.len(), event_id);
        for slot in &slots {
            self.broadcaster.publish(EngineUpdate::SlotChanged(slot.clone()));
        }
        Ok(slots)
    }

    pub fn event(&self, event_id: EventId) -> Option<Event> {
        self.read().events.get(&event_id).cloned()
    }

    pub fn slot(&self, slot_id: SlotId) -> Option<Slot> {
        self.read().slots.get(&slot_id).cloned()
    }

    pub fn slots_for_event(&self, event_id: EventId) -> Vec<Slot> {
        let state = self.read();
        state
            .event_slots
            .get(&event_id)
            .map(|ids| ids.iter().filter_map(|id| state.slots.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// The slot whose window contains `now`, or None in a gap (before the
    /// first slot starts or after the last one ends).
    pub fn current_slot(&self, event_id: EventId, now: DateTime<Utc>) -> EngineResult<Option<Slot>> {
        let state = self.read();
        let ids = state
            .event_slots
            .get(&event_id)
            .ok_or_else(|| EngineError::NotFound { kind: "event", id: event_id.to_string() })?;

        // Last slot with scheduled_time <= now, then check its window
        let idx = ids.partition_point(|id| {
            state.slots.get(id).map(|s| s.scheduled_time <= now).unwrap_or(false)
        });
        if idx == 0 {
            return Ok(None);
        }
        let slot = state.slots.get(&ids[idx - 1]).expect("slot index out of sync");
        Ok(slot.contains(now).then(|| slot.clone()))
    }

    /// Capacity-aware admission. Prefers the current slot, scans up to
    /// `lookahead` future slots for spare capacity, and overbooks when the
    /// whole window is full: under saturation we loosen the capacity limit
    /// rather than turn the bid away. `unresolved_count` is evaluated by
    /// the caller under its own bid lock, making counting and the
    /// subsequent insert one atomic unit.
    pub fn select_slot_for_bid(
        &self,
        event_id: EventId,
        current_slot_id: SlotId,
        max_per_slot: usize,
        lookahead: usize,
        unresolved_count: &dyn Fn(SlotId) -> usize,
    ) -> EngineResult<Slot> {
        let state = self.read();
        let current = state
            .slots
            .get(&current_slot_id)
            .ok_or_else(|| EngineError::NotFound { kind: "slot", id: current_slot_id.to_string() })?;

        let ids = state
            .event_slots
            .get(&event_id)
            .ok_or_else(|| EngineError::NotFound { kind: "event", id: event_id.to_string() })?;

        let mut candidates: Vec<&Slot> = Vec::with_capacity(lookahead + 1);
        if current.status.accepts_bids() {
            candidates.push(current);
        }
        candidates.extend(
            ids.iter()
                .filter_map(|id| state.slots.get(id))
                .filter(|s| s.slot_number > current.slot_number && s.status.accepts_bids())
                .take(lookahead),
        );

        if candidates.is_empty() {
            return Err(EngineError::NotFound {
                kind: "assignable slot",
                id: event_id.to_string(),
            });
        }

        for slot in &candidates {
            if unresolved_count(slot.id) < max_per_slot {
                if slot.id != current_slot_id {
                    log::info!(
                        "Slot {} full, assigning bid to slot #{}",
                        current.slot_number, slot.slot_number
                    );
                }
                return Ok((*slot).clone());
            }
        }

        // Every slot in the window is full: overbook the nearest one.
        let fallback = candidates[0];
        log::warn!(
            "All slots within look-ahead full for event {}; overbooking slot #{}",
            event_id, fallback.slot_number
        );
        Ok(fallback.clone())
    }

    /// Completes every elapsed slot and opens the slot whose window
    /// contains `now`. Returns the (possibly just-opened) current slot.
    /// Idempotent: re-running at the same instant changes nothing.
    pub fn advance(&self, event_id: EventId, now: DateTime<Utc>) -> EngineResult<Option<Slot>> {
        let mut state = self.write();
        let ids = state
            .event_slots
            .get(&event_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound { kind: "event", id: event_id.to_string() })?;

        let mut changed = Vec::new();
        let mut current = None;
        for id in ids {
            let slot = state.slots.get_mut(&id).expect("slot index out of sync");
            if slot.has_ended(now) && slot.status != SlotStatus::Completed {
                slot.status = SlotStatus::Completed;
                changed.push(slot.clone());
            } else if slot.contains(now) {
                if slot.status == SlotStatus::Available {
                    slot.status = SlotStatus::Bidding;
                    changed.push(slot.clone());
                }
                current = Some(slot.clone());
            }
        }
        // Published before the lock is released so slot versions can never
        // invert across racing status changes.
        for slot in &changed {
            log::info!("Slot #{} -> {}", slot.slot_number, slot.status.as_str());
            self.broadcaster.publish(EngineUpdate::SlotChanged(slot.clone()));
        }
        Ok(current)
    }

    /// Operator control: stop further bidding on a slot.
    pub fn lock_slot(&self, slot_id: SlotId) -> EngineResult<Slot> {
        let mut state = self.write();
        let slot = state
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| EngineError::NotFound { kind: "slot", id: slot_id.to_string() })?;
        if slot.status == SlotStatus::Completed {
            return Err(EngineError::Conflict(format!("slot {} already completed", slot_id)));
        }
        slot.status = SlotStatus::Locked;
        let updated = slot.clone();
        self.broadcaster.publish(EngineUpdate::SlotChanged(updated.clone()));
        Ok(updated)
    }

    /// Record the winning bid on its slot and lock it.
    pub fn set_slot_winner(&self, slot_id: SlotId, bid_id: Uuid) -> EngineResult<Slot> {
        let mut state = self.write();
        let slot = state
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| EngineError::NotFound { kind: "slot", id: slot_id.to_string() })?;
        slot.current_winner_bid_id = Some(bid_id);
        if slot.status != SlotStatus::Completed {
            slot.status = SlotStatus::Locked;
        }
        let updated = slot.clone();
        self.broadcaster.publish(EngineUpdate::SlotChanged(updated.clone()));
        Ok(updated)
    }

    /// Force a slot to completed, outside its natural window. Used by the
    /// expiry sweep and operator-forced rotation.
    pub fn complete_slot(&self, slot_id: SlotId) -> EngineResult<Slot> {
        let mut state = self.write();
        let slot = state
            .slots
            .get_mut(&slot_id)
            .ok_or_else(|| EngineError::NotFound { kind: "slot", id: slot_id.to_string() })?;
        let already = slot.status == SlotStatus::Completed;
        slot.status = SlotStatus::Completed;
        let updated = slot.clone();
        if !already {
            self.broadcaster.publish(EngineUpdate::SlotChanged(updated.clone()));
        }
        Ok(updated)
    }

    /// Open the next waiting slot for bidding ahead of its scheduled
    /// window. Used by operator-forced rotation.
    pub fn open_next_slot(
        &self,
        event_id: EventId,
        after_slot_number: u32,
    ) -> EngineResult<Option<Slot>> {
        let mut state = self.write();
        let ids = state
            .event_slots
            .get(&event_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound { kind: "event", id: event_id.to_string() })?;

        let mut opened = None;
        for id in ids {
            let slot = state.slots.get_mut(&id).expect("slot index out of sync");
            if slot.slot_number > after_slot_number && slot.status == SlotStatus::Available {
                slot.status = SlotStatus::Bidding;
                opened = Some(slot.clone());
                break;
            }
        }
        if let Some(slot) = &opened {
            log::info!("Slot #{} opened for bidding", slot.slot_number);
            self.broadcaster.publish(EngineUpdate::SlotChanged(slot.clone()));
        }
        Ok(opened)
    }

    /// The next instant at which a slot starts or ends after `now`.
    /// None once the event schedule is exhausted.
    pub fn next_boundary(&self, event_id: EventId, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.read();
        let ids = state.event_slots.get(&event_id)?;
        ids.iter()
            .filter_map(|id| state.slots.get(id))
            .flat_map(|s| [s.scheduled_time, s.end_time])
            .filter(|t| *t > now)
            .min()
    }

    /// Schedulable rotation task: sleeps to the next slot boundary, runs
    /// `on_boundary`, and re-derives its deadline every iteration. A forced
    /// rotation wakes it early through the handle, so the timer is
    /// re-armed instead of firing twice for the same boundary.
    pub fn spawn_rotation_loop<F>(self: Arc<Self>, event_id: EventId, on_boundary: F) -> RotationHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let scheduler = self;
        let notified = notify.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = scheduler.clock.now();
                let Some(boundary) = scheduler.next_boundary(event_id, now) else {
                    log::info!("Rotation loop finished for event {}", event_id);
                    break;
                };
                let wait = (boundary - now).to_std().unwrap_or(StdDuration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = notified.notified() => {
                        log::info!("Rotation timer re-armed for event {}", event_id);
                    }
                }
                on_boundary();
            }
        });
        RotationHandle { notify, handle }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SlotState> {
        self.state.read().expect("slot state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SlotState> {
        self.state.write().expect("slot state lock poisoned")
    }
}

pub struct RotationHandle {
    notify: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl RotationHandle {
    /// Wake the rotation task now; it processes the boundary and re-arms.
    pub fn fire_now(&self) {
        self.notify.notify_one();
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::{Duration, TimeZone};

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 20, 0, 0).unwrap()
    }

    fn scheduler_at(start: DateTime<Utc>) -> (Arc<SlotScheduler>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let broadcaster = Arc::new(RealtimeBroadcaster::new(Arc::new(SystemClock)));
        (Arc::new(SlotScheduler::new(broadcaster, clock.clone())), clock)
    }

    fn setup_event(scheduler: &SlotScheduler, slots_per_hour: u32) -> (Event, Vec<Slot>) {
        let event = scheduler.create_event("Test Night", start_time(), 2, slots_per_hour).unwrap();
        let slots = scheduler.generate_slots(event.id).unwrap();
        (event, slots)
    }

    #[test]
    fn test_generate_slots_contiguous_and_numbered() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        assert_eq!(slots.len(), 24);
        assert_eq!(slots[0].scheduled_time, event.start_time);
        assert_eq!(slots[0].status, SlotStatus::Bidding);
        for (i, pair) in slots.windows(2).enumerate() {
            assert_eq!(pair[0].slot_number, (i + 1) as u32);
            assert_eq!(pair[0].end_time, pair[1].scheduled_time, "slots must be contiguous");
            assert_eq!(pair[1].status, SlotStatus::Available);
        }
    }

    #[test]
    fn test_generate_slots_twice_is_conflict() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        let err = scheduler.generate_slots(event.id).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(scheduler.slots_for_event(event.id).len(), slots.len());
    }

    #[test]
    fn test_invalid_slots_per_hour() {
        let (scheduler, _) = scheduler_at(start_time());
        assert!(scheduler.create_event("X", start_time(), 2, 0).is_err());
        assert!(scheduler.create_event("X", start_time(), 2, 7).is_err());
        assert!(scheduler.create_event("X", start_time(), 2, 12).is_ok());
    }

    #[test]
    fn test_current_slot_follows_wall_clock() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12); // 5-minute slots

        // Before the event
        let before = start_time() - Duration::minutes(1);
        assert!(scheduler.current_slot(event.id, before).unwrap().is_none());

        // Inside slot 1
        let cur = scheduler.current_slot(event.id, start_time()).unwrap().unwrap();
        assert_eq!(cur.slot_number, 1);

        // Inside slot 3
        let in_third = start_time() + Duration::minutes(11);
        let cur = scheduler.current_slot(event.id, in_third).unwrap().unwrap();
        assert_eq!(cur.slot_number, 3);

        // After the last slot ends: a gap
        let after = slots.last().unwrap().end_time;
        assert!(scheduler.current_slot(event.id, after).unwrap().is_none());
    }

    #[test]
    fn test_select_prefers_current_slot() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        let chosen = scheduler
            .select_slot_for_bid(event.id, slots[0].id, 5, 5, &|_| 0)
            .unwrap();
        assert_eq!(chosen.id, slots[0].id);
    }

    #[test]
    fn test_select_scans_forward_when_full() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        // Current and next slot full, slot 3 has room
        let full = [slots[0].id, slots[1].id];
        let chosen = scheduler
            .select_slot_for_bid(event.id, slots[0].id, 5, 5, &|id| {
                if full.contains(&id) { 5 } else { 0 }
            })
            .unwrap();
        assert_eq!(chosen.slot_number, 3);
    }

    #[test]
    fn test_select_overbooks_when_window_exhausted() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        let chosen = scheduler
            .select_slot_for_bid(event.id, slots[0].id, 5, 5, &|_| 5)
            .unwrap();
        // Degraded mode: the current slot takes the overflow
        assert_eq!(chosen.id, slots[0].id);
    }

    #[test]
    fn test_select_skips_completed_current() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        scheduler.complete_slot(slots[0].id).unwrap();
        let chosen = scheduler
            .select_slot_for_bid(event.id, slots[0].id, 5, 5, &|_| 0)
            .unwrap();
        assert_eq!(chosen.slot_number, 2);
    }

    #[test]
    fn test_advance_completes_elapsed_and_opens_current() {
        let (scheduler, clock) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        clock.advance(Duration::minutes(7)); // inside slot 2
        let current = scheduler.advance(event.id, clock.now()).unwrap().unwrap();
        assert_eq!(current.slot_number, 2);
        assert_eq!(current.status, SlotStatus::Bidding);
        assert_eq!(scheduler.slot(slots[0].id).unwrap().status, SlotStatus::Completed);

        // Idempotent
        let again = scheduler.advance(event.id, clock.now()).unwrap().unwrap();
        assert_eq!(again.slot_number, 2);
        assert_eq!(again.status, SlotStatus::Bidding);
    }

    #[test]
    fn test_set_slot_winner_locks_slot() {
        let (scheduler, _) = scheduler_at(start_time());
        let (_, slots) = setup_event(&scheduler, 12);

        let bid_id = Uuid::new_v4();
        let slot = scheduler.set_slot_winner(slots[0].id, bid_id).unwrap();
        assert_eq!(slot.current_winner_bid_id, Some(bid_id));
        assert_eq!(slot.status, SlotStatus::Locked);
    }

    #[test]
    fn test_next_boundary() {
        let (scheduler, _) = scheduler_at(start_time());
        let (event, slots) = setup_event(&scheduler, 12);

        // Before the event: first boundary is the first slot start
        let before = start_time() - Duration::minutes(10);
        assert_eq!(scheduler.next_boundary(event.id, before), Some(slots[0].scheduled_time));

        // Mid slot 1: next boundary is its end
        let mid = start_time() + Duration::minutes(2);
        assert_eq!(scheduler.next_boundary(event.id, mid), Some(slots[0].end_time));

        // After the event: nothing left
        let after = slots.last().unwrap().end_time;
        assert_eq!(scheduler.next_boundary(event.id, after), None);
    }
}
