use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedCalendar = Arc<RwLock<Calendar>>;

/// A storage constraint that rejected an event. The engine pre-checks the same
/// rules for friendlier errors; this is the check that actually guards commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    SlotTaken(Party),
    Missing(Ulid),
    Duplicate(Ulid),
    ExternalTaken(ExternalId),
    NegotiationPending(Ulid),
}

impl From<Violation> for EngineError {
    fn from(v: Violation) -> Self {
        match v {
            Violation::SlotTaken(party) => EngineError::SlotConflict(party),
            Violation::Missing(id) => EngineError::NotFound(id),
            Violation::Duplicate(id) => EngineError::WalError(format!("duplicate id {id}")),
            Violation::ExternalTaken(id) => EngineError::AlreadyRegistered(id),
            Violation::NegotiationPending(id) => EngineError::NegotiationPending(id),
        }
    }
}

/// Calendars plus the cross-calendar lookup indexes.
pub struct InMemoryStore {
    calendars: DashMap<Ulid, SharedCalendar>,
    /// Counterpart, booking or negotiation id → owning organizer.
    entity_to_organizer: DashMap<Ulid, Ulid>,
    organizers_by_external: DashMap<ExternalId, Ulid>,
    counterparts_by_external: DashMap<ExternalId, Ulid>,
    logins: DashMap<String, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            entity_to_organizer: DashMap::new(),
            organizers_by_external: DashMap::new(),
            counterparts_by_external: DashMap::new(),
            logins: DashMap::new(),
        }
    }

    // ── Directory ────────────────────────────────────────────

    pub fn calendar_count(&self) -> usize {
        self.calendars.len()
    }

    pub fn calendar(&self, organizer_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(organizer_id).map(|e| e.value().clone())
    }

    pub fn calendar_ids(&self) -> Vec<Ulid> {
        self.calendars.iter().map(|e| *e.key()).collect()
    }

    pub fn organizer_for(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_organizer.get(entity_id).map(|e| *e.value())
    }

    pub fn organizer_by_external(&self, external_id: &ExternalId) -> Option<Ulid> {
        self.organizers_by_external.get(external_id).map(|e| *e.value())
    }

    pub fn counterpart_by_external(&self, external_id: &ExternalId) -> Option<Ulid> {
        self.counterparts_by_external.get(external_id).map(|e| *e.value())
    }

    pub fn organizer_by_login(&self, login: &str) -> Option<Ulid> {
        self.logins.get(login).map(|e| *e.value())
    }

    pub fn insert_calendar(&self, organizer: Organizer) -> SharedCalendar {
        let id = organizer.id;
        self.organizers_by_external.insert(organizer.external_id, id);
        self.logins.insert(organizer.login.clone(), id);
        let cal = Arc::new(RwLock::new(Calendar::new(organizer)));
        self.calendars.insert(id, cal.clone());
        cal
    }

    /// Drop a whole calendar and every index entry pointing into it.
    /// Caller holds the calendar's write lock.
    pub fn remove_calendar(&self, cal: &mut Calendar) {
        for id in cal.bookings.keys().chain(cal.negotiations.keys()) {
            self.entity_to_organizer.remove(id);
        }
        for counterpart in cal.counterparts.values() {
            self.entity_to_organizer.remove(&counterpart.id);
            if let Some(ext) = counterpart.external_id {
                self.counterparts_by_external.remove(&ext);
            }
        }
        self.organizers_by_external.remove(&cal.organizer.external_id);
        self.logins.remove(&cal.organizer.login);
        self.calendars.remove(&cal.organizer.id);
        cal.retired = true;
    }

    // ── Constraints ──────────────────────────────────────────

    /// Check an event against the calendar's constraints without mutating anything.
    pub fn validate(&self, cal: &Calendar, event: &Event) -> Result<(), Violation> {
        match event {
            Event::CounterpartAdded { counterpart } => {
                if cal.counterparts.contains_key(&counterpart.id) {
                    return Err(Violation::Duplicate(counterpart.id));
                }
                if let Some(ext) = counterpart.external_id
                    && self.counterparts_by_external.contains_key(&ext)
                {
                    return Err(Violation::ExternalTaken(ext));
                }
                Ok(())
            }
            Event::CounterpartRemoved { id, .. } => {
                if cal.counterparts.contains_key(id) {
                    Ok(())
                } else {
                    Err(Violation::Missing(*id))
                }
            }
            Event::BookingCreated { booking } => {
                if cal.bookings.contains_key(&booking.id) {
                    return Err(Violation::Duplicate(booking.id));
                }
                if !cal.counterparts.contains_key(&booking.counterpart_id) {
                    return Err(Violation::Missing(booking.counterpart_id));
                }
                slot_free(cal, booking.counterpart_id, booking.slot(), None)
            }
            Event::BookingRescheduled { id, time, .. } => {
                let booking = cal.find_booking(id).ok_or(Violation::Missing(*id))?;
                let slot = Slot {
                    date: booking.date,
                    time: *time,
                };
                slot_free(cal, booking.counterpart_id, slot, Some(*id))
            }
            Event::BookingCancelled { id, .. } => {
                if cal.bookings.contains_key(id) {
                    Ok(())
                } else {
                    Err(Violation::Missing(*id))
                }
            }
            Event::NegotiationSaved { record } => {
                if !cal.counterparts.contains_key(&record.requester) {
                    return Err(Violation::Missing(record.requester));
                }
                let Some(booking_id) = record.state.booking_id() else {
                    return Ok(());
                };
                if !cal.bookings.contains_key(&booking_id) {
                    return Err(Violation::Missing(booking_id));
                }
                match cal.negotiation_for_booking(&booking_id) {
                    Some(other) if other.id != record.id => {
                        Err(Violation::NegotiationPending(booking_id))
                    }
                    _ => Ok(()),
                }
            }
            Event::NegotiationClosed { id, .. } => {
                if cal.negotiations.contains_key(id) {
                    Ok(())
                } else {
                    Err(Violation::Missing(*id))
                }
            }
            // Directory-level events never reach a calendar.
            Event::OrganizerRegistered { .. } | Event::OrganizerDeleted { .. } => Ok(()),
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a validated event. Caller holds the calendar's write lock.
    pub fn apply(&self, cal: &mut Calendar, event: &Event) {
        match event {
            Event::CounterpartAdded { counterpart } => {
                self.entity_to_organizer.insert(counterpart.id, cal.organizer.id);
                if let Some(ext) = counterpart.external_id {
                    self.counterparts_by_external.insert(ext, counterpart.id);
                }
                cal.counterparts.insert(counterpart.id, counterpart.clone());
            }
            Event::CounterpartRemoved { id, .. } => {
                let owned: Vec<Ulid> = cal
                    .bookings
                    .values()
                    .filter(|b| b.counterpart_id == *id)
                    .map(|b| b.id)
                    .collect();
                for booking_id in owned {
                    self.drop_booking(cal, booking_id);
                }
                let requested: Vec<Ulid> = cal
                    .negotiations
                    .values()
                    .filter(|n| n.requester == *id)
                    .map(|n| n.id)
                    .collect();
                for negotiation_id in requested {
                    cal.negotiations.remove(&negotiation_id);
                    self.entity_to_organizer.remove(&negotiation_id);
                }
                if let Some(counterpart) = cal.counterparts.remove(id)
                    && let Some(ext) = counterpart.external_id
                {
                    self.counterparts_by_external.remove(&ext);
                }
                self.entity_to_organizer.remove(id);
            }
            Event::BookingCreated { booking } => {
                self.entity_to_organizer.insert(booking.id, cal.organizer.id);
                cal.insert_booking(booking.clone());
            }
            Event::BookingRescheduled { id, time, .. } => {
                cal.move_booking(*id, *time);
            }
            Event::BookingCancelled { id, .. } => {
                self.drop_booking(cal, *id);
            }
            Event::NegotiationSaved { record } => {
                self.entity_to_organizer.insert(record.id, cal.organizer.id);
                cal.negotiations.insert(record.id, record.clone());
            }
            Event::NegotiationClosed { id, .. } => {
                cal.negotiations.remove(id);
                self.entity_to_organizer.remove(id);
            }
            Event::OrganizerRegistered { .. } | Event::OrganizerDeleted { .. } => {}
        }
    }

    /// Remove a booking and any negotiation targeting it.
    fn drop_booking(&self, cal: &mut Calendar, booking_id: Ulid) {
        if cal.remove_booking(booking_id).is_none() {
            return;
        }
        self.entity_to_organizer.remove(&booking_id);
        if let Some(negotiation_id) = cal.negotiation_for_booking(&booking_id).map(|n| n.id) {
            cal.negotiations.remove(&negotiation_id);
            self.entity_to_organizer.remove(&negotiation_id);
        }
    }
}

fn slot_free(
    cal: &Calendar,
    counterpart_id: Ulid,
    slot: Slot,
    exclude: Option<Ulid>,
) -> Result<(), Violation> {
    for party in [Party::Organizer, Party::Counterpart] {
        if let Some(holder) = cal.slot_holder(party, counterpart_id, slot)
            && Some(holder) != exclude
        {
            return Err(Violation::SlotTaken(party));
        }
    }
    Ok(())
}
