use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// True when another booking already occupies `date`/`time` for either the
/// organizer or the counterpart. `exclude` skips a booking being moved.
pub(crate) fn has_conflict(
    cal: &Calendar,
    counterpart_id: Ulid,
    date: NaiveDate,
    time: NaiveTime,
    exclude: Option<Ulid>,
) -> bool {
    find_conflict(cal, counterpart_id, date, time, exclude).is_some()
}

/// Which side is double-booked. The organizer side is reported when both are.
pub(crate) fn find_conflict(
    cal: &Calendar,
    counterpart_id: Ulid,
    date: NaiveDate,
    time: NaiveTime,
    exclude: Option<Ulid>,
) -> Option<Party> {
    let at_slot = |b: &&Booking| Some(b.id) != exclude && b.date == date && b.time == time;
    if cal.bookings.values().any(|b| at_slot(&b)) {
        return Some(Party::Organizer);
    }
    if cal
        .bookings
        .values()
        .filter(at_slot)
        .any(|b| b.counterpart_id == counterpart_id)
    {
        return Some(Party::Counterpart);
    }
    None
}

pub(crate) fn check_slot(
    cal: &Calendar,
    counterpart_id: Ulid,
    date: NaiveDate,
    time: NaiveTime,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(cal, counterpart_id, date, time, exclude) {
        Some(party) => Err(EngineError::SlotConflict(party)),
        None => Ok(()),
    }
}

pub(crate) fn ensure_not_past(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::PastBooking(date));
    }
    Ok(())
}

pub(crate) fn validate_text(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::LimitExceeded(what));
    }
    if value.chars().count() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

pub(crate) fn validate_contact(contact: Option<&str>) -> Result<(), EngineError> {
    match contact {
        Some(c) if c.chars().count() > crate::limits::MAX_CONTACT_LEN => {
            Err(EngineError::LimitExceeded("contact too long"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn calendar(counterparts: usize) -> (Calendar, Vec<Ulid>) {
        let mut cal = Calendar::new(Organizer {
            id: Ulid::new(),
            external_id: 1,
            name: "Olga".into(),
            contact: None,
            login: "olga".into(),
        });
        let ids: Vec<Ulid> = (0..counterparts).map(|_| Ulid::new()).collect();
        for id in &ids {
            cal.counterparts.insert(
                *id,
                Counterpart {
                    id: *id,
                    organizer_id: cal.organizer.id,
                    external_id: None,
                    name: "x".into(),
                    contact: None,
                },
            );
        }
        (cal, ids)
    }

    fn book(cal: &mut Calendar, counterpart_id: Ulid, date: NaiveDate, time: NaiveTime) -> Ulid {
        let id = Ulid::new();
        cal.insert_booking(Booking {
            id,
            organizer_id: cal.organizer.id,
            counterpart_id,
            date,
            time,
        });
        id
    }

    #[test]
    fn empty_calendar_has_no_conflict() {
        let (cal, cps) = calendar(1);
        assert!(!has_conflict(&cal, cps[0], d(15), t(15), None));
    }

    #[test]
    fn organizer_busy_with_someone_else() {
        let (mut cal, cps) = calendar(2);
        book(&mut cal, cps[0], d(15), t(15));
        assert!(matches!(
            check_slot(&cal, cps[1], d(15), t(15), None),
            Err(EngineError::SlotConflict(Party::Organizer))
        ));
    }

    #[test]
    fn organizer_reported_when_both_sides_busy() {
        let (mut cal, cps) = calendar(1);
        book(&mut cal, cps[0], d(15), t(15));
        assert_eq!(
            find_conflict(&cal, cps[0], d(15), t(15), None),
            Some(Party::Organizer)
        );
    }

    #[test]
    fn moved_booking_does_not_conflict_with_itself() {
        let (mut cal, cps) = calendar(1);
        let id = book(&mut cal, cps[0], d(15), t(15));
        assert!(!has_conflict(&cal, cps[0], d(15), t(15), Some(id)));
        assert!(has_conflict(&cal, cps[0], d(15), t(15), None));
    }

    #[test]
    fn other_date_or_time_is_free() {
        let (mut cal, cps) = calendar(1);
        book(&mut cal, cps[0], d(15), t(15));
        assert!(!has_conflict(&cal, cps[0], d(16), t(15), None));
        assert!(!has_conflict(&cal, cps[0], d(15), t(16), None));
    }

    #[test]
    fn past_dates_rejected() {
        assert!(ensure_not_past(d(9), d(10)).is_err());
        assert!(ensure_not_past(d(10), d(10)).is_ok());
        assert!(ensure_not_past(d(11), d(10)).is_ok());
    }

    #[test]
    fn text_limits() {
        assert!(validate_text("Anna", 100, "name").is_ok());
        assert!(validate_text("   ", 100, "name").is_err());
        assert!(validate_text(&"x".repeat(101), 100, "name").is_err());
        assert!(validate_contact(None).is_ok());
        assert!(validate_contact(Some(&"y".repeat(101))).is_err());
    }
}
