use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::negotiation::NegotiationRecord;

/// Chat-side user id. The only identity the transport knows about.
pub type ExternalId = i64;

/// Truncate a time-of-day to whole minutes.
pub fn minute_of(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// Which side of a booking an occupied slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Organizer,
    Counterpart,
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Party::Organizer => f.write_str("organizer"),
            Party::Counterpart => f.write_str("counterpart"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organizer {
    pub id: Ulid,
    pub external_id: ExternalId,
    pub name: String,
    pub contact: Option<String>,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterpart {
    pub id: Ulid,
    pub organizer_id: Ulid,
    /// Absent for counterparts added by their organizer who never joined the chat.
    pub external_id: Option<ExternalId>,
    pub name: String,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub organizer_id: Ulid,
    pub counterpart_id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Booking {
    pub fn slot(&self) -> Slot {
        Slot {
            date: self.date,
            time: self.time,
        }
    }
}

/// One date + minute on the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// A booking plus the participant data needed to compose a message about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingDetails {
    pub booking: Booking,
    pub organizer_name: String,
    pub organizer_external: ExternalId,
    pub counterpart_name: String,
    pub counterpart_external: Option<ExternalId>,
}

/// Everything owned by one organizer. Every counterpart belongs to exactly one
/// organizer, so all bookings that touch a counterpart live in the same calendar
/// and one lock covers both slot-uniqueness invariants.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub organizer: Organizer,
    pub counterparts: HashMap<Ulid, Counterpart>,
    pub bookings: HashMap<Ulid, Booking>,
    /// Active negotiations started by this organizer's counterparts.
    pub negotiations: HashMap<Ulid, NegotiationRecord>,
    organizer_slots: HashMap<Slot, Ulid>,
    counterpart_slots: HashMap<(Ulid, Slot), Ulid>,
    /// Set when the organizer is deleted. Writers that were queued on the lock
    /// observe it after acquiring and must bail out.
    pub retired: bool,
}

impl Calendar {
    pub fn new(organizer: Organizer) -> Self {
        Self {
            organizer,
            counterparts: HashMap::new(),
            bookings: HashMap::new(),
            negotiations: HashMap::new(),
            organizer_slots: HashMap::new(),
            counterpart_slots: HashMap::new(),
            retired: false,
        }
    }

    pub fn find_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    /// Organizer's bookings on `date`, ordered by time.
    pub fn bookings_on(&self, date: NaiveDate) -> Vec<&Booking> {
        let mut out: Vec<&Booking> = self.bookings.values().filter(|b| b.date == date).collect();
        out.sort_by_key(|b| b.time);
        out
    }

    /// A counterpart's bookings on or after `from`, ordered by date then time.
    pub fn bookings_for_counterpart_from(&self, counterpart_id: Ulid, from: NaiveDate) -> Vec<&Booking> {
        let mut out: Vec<&Booking> = self
            .bookings
            .values()
            .filter(|b| b.counterpart_id == counterpart_id && b.date >= from)
            .collect();
        out.sort_by_key(|b| b.slot());
        out
    }

    /// Unique-index lookup: which booking holds `slot` for the given party.
    pub fn slot_holder(&self, party: Party, counterpart_id: Ulid, slot: Slot) -> Option<Ulid> {
        match party {
            Party::Organizer => self.organizer_slots.get(&slot).copied(),
            Party::Counterpart => self.counterpart_slots.get(&(counterpart_id, slot)).copied(),
        }
    }

    /// Insert without checks; the store validates before calling this.
    pub fn insert_booking(&mut self, booking: Booking) {
        let slot = booking.slot();
        self.organizer_slots.insert(slot, booking.id);
        self.counterpart_slots.insert((booking.counterpart_id, slot), booking.id);
        self.bookings.insert(booking.id, booking);
    }

    /// Move a booking to a new time on the same date. Returns the previous time.
    pub fn move_booking(&mut self, id: Ulid, time: NaiveTime) -> Option<NaiveTime> {
        let booking = self.bookings.get_mut(&id)?;
        let old = booking.slot();
        let previous = booking.time;
        booking.time = time;
        let new = booking.slot();
        let counterpart_id = booking.counterpart_id;
        if self.organizer_slots.get(&old) == Some(&id) {
            self.organizer_slots.remove(&old);
        }
        if self.counterpart_slots.get(&(counterpart_id, old)) == Some(&id) {
            self.counterpart_slots.remove(&(counterpart_id, old));
        }
        self.organizer_slots.insert(new, id);
        self.counterpart_slots.insert((counterpart_id, new), id);
        Some(previous)
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let booking = self.bookings.remove(&id)?;
        let slot = booking.slot();
        if self.organizer_slots.get(&slot) == Some(&id) {
            self.organizer_slots.remove(&slot);
        }
        if self.counterpart_slots.get(&(booking.counterpart_id, slot)) == Some(&id) {
            self.counterpart_slots.remove(&(booking.counterpart_id, slot));
        }
        Some(booking)
    }

    /// The active negotiation targeting `booking_id`, if any.
    pub fn negotiation_for_booking(&self, booking_id: &Ulid) -> Option<&NegotiationRecord> {
        self.negotiations
            .values()
            .find(|n| n.state.booking_id().as_ref() == Some(booking_id))
    }

    /// Snapshot a booking together with both participants.
    pub fn details(&self, booking: &Booking) -> Option<BookingDetails> {
        let counterpart = self.counterparts.get(&booking.counterpart_id)?;
        Some(BookingDetails {
            booking: booking.clone(),
            organizer_name: self.organizer.name.clone(),
            organizer_external: self.organizer.external_id,
            counterpart_name: counterpart.name.clone(),
            counterpart_external: counterpart.external_id,
        })
    }
}

/// The log record format. Every state change is exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrganizerRegistered {
        organizer: Organizer,
    },
    OrganizerDeleted {
        id: Ulid,
    },
    CounterpartAdded {
        counterpart: Counterpart,
    },
    CounterpartRemoved {
        id: Ulid,
        organizer_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        organizer_id: Ulid,
        time: NaiveTime,
    },
    BookingCancelled {
        id: Ulid,
        organizer_id: Ulid,
    },
    NegotiationSaved {
        record: NegotiationRecord,
    },
    NegotiationClosed {
        id: Ulid,
        organizer_id: Ulid,
    },
}

impl Event {
    /// The calendar this event lands in.
    pub fn organizer_id(&self) -> Ulid {
        match self {
            Event::OrganizerRegistered { organizer } => organizer.id,
            Event::OrganizerDeleted { id } => *id,
            Event::CounterpartAdded { counterpart } => counterpart.organizer_id,
            Event::BookingCreated { booking } => booking.organizer_id,
            Event::NegotiationSaved { record } => record.organizer_id,
            Event::CounterpartRemoved { organizer_id, .. }
            | Event::BookingRescheduled { organizer_id, .. }
            | Event::BookingCancelled { organizer_id, .. }
            | Event::NegotiationClosed { organizer_id, .. } => *organizer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn calendar_with_counterparts(n: usize) -> (Calendar, Vec<Ulid>) {
        let organizer = Organizer {
            id: Ulid::new(),
            external_id: 1,
            name: "Olga".into(),
            contact: None,
            login: "olga".into(),
        };
        let mut cal = Calendar::new(organizer);
        let ids: Vec<Ulid> = (0..n).map(|_| Ulid::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            cal.counterparts.insert(
                *id,
                Counterpart {
                    id: *id,
                    organizer_id: cal.organizer.id,
                    external_id: Some(100 + i as ExternalId),
                    name: format!("student {i}"),
                    contact: None,
                },
            );
        }
        (cal, ids)
    }

    fn booking(cal: &Calendar, counterpart_id: Ulid, date: NaiveDate, time: NaiveTime) -> Booking {
        Booking {
            id: Ulid::new(),
            organizer_id: cal.organizer.id,
            counterpart_id,
            date,
            time,
        }
    }

    #[test]
    fn minute_truncation() {
        let precise = NaiveTime::from_hms_milli_opt(15, 30, 42, 250).unwrap();
        assert_eq!(minute_of(precise), t(15, 30));
        assert_eq!(minute_of(t(9, 0)), t(9, 0));
    }

    #[test]
    fn slot_indexes_track_inserts() {
        let (mut cal, cps) = calendar_with_counterparts(2);
        let b = booking(&cal, cps[0], d(15), t(15, 0));
        let slot = b.slot();
        cal.insert_booking(b.clone());

        assert_eq!(cal.slot_holder(Party::Organizer, cps[1], slot), Some(b.id));
        assert_eq!(cal.slot_holder(Party::Counterpart, cps[0], slot), Some(b.id));
        // The second counterpart's own slot is untouched.
        assert_eq!(cal.slot_holder(Party::Counterpart, cps[1], slot), None);
    }

    #[test]
    fn move_booking_reindexes() {
        let (mut cal, cps) = calendar_with_counterparts(1);
        let b = booking(&cal, cps[0], d(15), t(15, 0));
        cal.insert_booking(b.clone());

        let previous = cal.move_booking(b.id, t(16, 0));
        assert_eq!(previous, Some(t(15, 0)));

        let old = Slot { date: d(15), time: t(15, 0) };
        let new = Slot { date: d(15), time: t(16, 0) };
        assert_eq!(cal.slot_holder(Party::Organizer, cps[0], old), None);
        assert_eq!(cal.slot_holder(Party::Counterpart, cps[0], old), None);
        assert_eq!(cal.slot_holder(Party::Organizer, cps[0], new), Some(b.id));
        assert_eq!(cal.slot_holder(Party::Counterpart, cps[0], new), Some(b.id));
    }

    #[test]
    fn move_to_same_time_keeps_index() {
        let (mut cal, cps) = calendar_with_counterparts(1);
        let b = booking(&cal, cps[0], d(15), t(15, 0));
        cal.insert_booking(b.clone());
        cal.move_booking(b.id, t(15, 0));
        assert_eq!(cal.slot_holder(Party::Organizer, cps[0], b.slot()), Some(b.id));
    }

    #[test]
    fn remove_booking_frees_slots() {
        let (mut cal, cps) = calendar_with_counterparts(1);
        let b = booking(&cal, cps[0], d(15), t(15, 0));
        cal.insert_booking(b.clone());

        let removed = cal.remove_booking(b.id).unwrap();
        assert_eq!(removed, b);
        assert!(cal.bookings.is_empty());
        assert_eq!(cal.slot_holder(Party::Organizer, cps[0], b.slot()), None);
        assert!(cal.remove_booking(b.id).is_none());
    }

    #[test]
    fn bookings_on_is_time_ordered() {
        let (mut cal, cps) = calendar_with_counterparts(3);
        cal.insert_booking(booking(&cal, cps[0], d(15), t(17, 0)));
        cal.insert_booking(booking(&cal, cps[1], d(15), t(9, 0)));
        cal.insert_booking(booking(&cal, cps[2], d(16), t(8, 0)));

        let times: Vec<NaiveTime> = cal.bookings_on(d(15)).iter().map(|b| b.time).collect();
        assert_eq!(times, vec![t(9, 0), t(17, 0)]);
    }

    #[test]
    fn counterpart_bookings_from_date() {
        let (mut cal, cps) = calendar_with_counterparts(2);
        cal.insert_booking(booking(&cal, cps[0], d(10), t(10, 0)));
        cal.insert_booking(booking(&cal, cps[0], d(20), t(9, 0)));
        cal.insert_booking(booking(&cal, cps[0], d(15), t(11, 0)));
        cal.insert_booking(booking(&cal, cps[1], d(18), t(11, 0)));

        let dates: Vec<NaiveDate> = cal
            .bookings_for_counterpart_from(cps[0], d(15))
            .iter()
            .map(|b| b.date)
            .collect();
        assert_eq!(dates, vec![d(15), d(20)]);
    }

    #[test]
    fn details_carry_both_participants() {
        let (mut cal, cps) = calendar_with_counterparts(1);
        let b = booking(&cal, cps[0], d(15), t(15, 0));
        cal.insert_booking(b.clone());

        let details = cal.details(&b).unwrap();
        assert_eq!(details.organizer_name, "Olga");
        assert_eq!(details.organizer_external, 1);
        assert_eq!(details.counterpart_name, "student 0");
        assert_eq!(details.counterpart_external, Some(100));
    }

    #[test]
    fn event_survives_bincode() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                organizer_id: Ulid::new(),
                counterpart_id: Ulid::new(),
                date: d(15),
                time: t(15, 0),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
