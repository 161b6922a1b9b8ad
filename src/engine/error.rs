use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{ExternalId, Party};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    SlotConflict(Party),
    PastBooking(NaiveDate),
    Unregistered(ExternalId),
    AlreadyRegistered(ExternalId),
    LoginTaken(String),
    UnknownLogin(String),
    NothingToReschedule,
    /// The booking already has an active negotiation.
    NegotiationPending(Ulid),
    UnexpectedInput {
        state: &'static str,
        input: &'static str,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable tag, used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::PastBooking(_) => "past_booking",
            EngineError::Unregistered(_) => "unregistered",
            EngineError::AlreadyRegistered(_) => "already_registered",
            EngineError::LoginTaken(_) => "login_taken",
            EngineError::UnknownLogin(_) => "unknown_login",
            EngineError::NothingToReschedule => "nothing_to_reschedule",
            EngineError::NegotiationPending(_) => "negotiation_pending",
            EngineError::UnexpectedInput { .. } => "unexpected_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::SlotConflict(Party::Organizer) => {
                write!(f, "the organizer already has a lesson scheduled at this time")
            }
            EngineError::SlotConflict(Party::Counterpart) => {
                write!(f, "the counterpart already has a lesson scheduled at this time")
            }
            EngineError::PastBooking(date) => write!(f, "{date} is in the past"),
            EngineError::Unregistered(id) => write!(f, "user {id} is not registered"),
            EngineError::AlreadyRegistered(id) => write!(f, "user {id} is already registered"),
            EngineError::LoginTaken(login) => write!(f, "login {login:?} is already in use"),
            EngineError::UnknownLogin(login) => write!(f, "no organizer with login {login:?}"),
            EngineError::NothingToReschedule => write!(f, "no upcoming lessons to reschedule"),
            EngineError::NegotiationPending(id) => {
                write!(f, "booking {id} already has a pending reschedule request")
            }
            EngineError::UnexpectedInput { state, input } => {
                write!(f, "unexpected {input} while {state}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
