//! Participant-facing message texts.

use chrono::NaiveTime;

use crate::model::{BookingDetails, Party};

pub fn hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn booking_created(d: &BookingDetails) -> String {
    format!(
        "You have a lesson scheduled with {} on {} at {}.",
        d.organizer_name,
        d.booking.date,
        hhmm(d.booking.time)
    )
}

pub fn booking_cancelled(d: &BookingDetails) -> String {
    format!(
        "The lesson with {} on {} at {} has been cancelled.",
        d.organizer_name,
        d.booking.date,
        hhmm(d.booking.time)
    )
}

pub fn booking_moved(d: &BookingDetails) -> String {
    format!(
        "Your lesson with {} has been rescheduled to {} at {}.",
        d.organizer_name,
        d.booking.date,
        hhmm(d.booking.time)
    )
}

pub fn reschedule_requested(d: &BookingDetails, proposed: NaiveTime, reason: &str) -> String {
    format!(
        "Student {} requests to reschedule the lesson on {} from {} to {} for reason: {}. Do you agree?",
        d.counterpart_name,
        d.booking.date,
        hhmm(d.booking.time),
        hhmm(proposed),
        reason
    )
}

/// `d` is the booking as it still stands, so the text names the original time.
pub fn reschedule_declined(d: &BookingDetails) -> String {
    format!(
        "Your request to reschedule the lesson with {} was declined. The lesson stays on {} at {}.",
        d.organizer_name,
        d.booking.date,
        hhmm(d.booking.time)
    )
}

pub fn reschedule_declined_busy(d: &BookingDetails, proposed: NaiveTime, party: Party) -> String {
    let busy = match party {
        Party::Organizer => format!("{} already has a lesson then", d.organizer_name),
        Party::Counterpart => "you already have a lesson then".to_string(),
    };
    format!(
        "Your lesson with {} could not be moved to {} because {busy}. The lesson stays on {} at {}.",
        d.organizer_name,
        hhmm(proposed),
        d.booking.date,
        hhmm(d.booking.time)
    )
}

pub fn reschedule_withdrawn(d: &BookingDetails, by: Party) -> String {
    let who = match by {
        Party::Organizer => d.organizer_name.as_str(),
        Party::Counterpart => d.counterpart_name.as_str(),
    };
    format!(
        "The reschedule request for the lesson on {} at {} was withdrawn by {}.",
        d.booking.date,
        hhmm(d.booking.time),
        who
    )
}

pub fn reschedule_expired(d: &BookingDetails) -> String {
    format!(
        "Your request to reschedule the lesson with {} on {} at {} expired without an answer.",
        d.organizer_name,
        d.booking.date,
        hhmm(d.booking.time)
    )
}
