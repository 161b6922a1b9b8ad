//! Counterpart-initiated reschedule negotiation.
//!
//! `SelectingBooking → AwaitingReason → AwaitingNewTime → AwaitingOrganizerDecision`,
//! ending in `Accepted`, `Declined` or `Cancelled`. Records are addressable by id and
//! persisted through the log, so a negotiation waiting on the organizer survives a
//! restart. Nothing here touches storage; the engine drives the transitions.

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Booking, BookingDetails, Party};

/// Non-terminal states. Terminal results are reported as an [`Outcome`] and the
/// record is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    SelectingBooking,
    AwaitingReason {
        booking_id: Ulid,
    },
    AwaitingNewTime {
        booking_id: Ulid,
        reason: String,
    },
    AwaitingOrganizerDecision {
        booking_id: Ulid,
        reason: String,
        proposed: NaiveTime,
    },
}

/// Counterpart-side inputs. Organizer decisions and cancellation are handled
/// by the engine directly since they end the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Select(Ulid),
    Reason(String),
    Propose(NaiveTime),
}

impl Input {
    pub fn name(&self) -> &'static str {
        match self {
            Input::Select(_) => "booking selection",
            Input::Reason(_) => "reason",
            Input::Propose(_) => "proposed time",
        }
    }
}

impl NegotiationState {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationState::SelectingBooking => "selecting_booking",
            NegotiationState::AwaitingReason { .. } => "awaiting_reason",
            NegotiationState::AwaitingNewTime { .. } => "awaiting_new_time",
            NegotiationState::AwaitingOrganizerDecision { .. } => "awaiting_organizer_decision",
        }
    }

    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            NegotiationState::SelectingBooking => None,
            NegotiationState::AwaitingReason { booking_id }
            | NegotiationState::AwaitingNewTime { booking_id, .. }
            | NegotiationState::AwaitingOrganizerDecision { booking_id, .. } => Some(*booking_id),
        }
    }

    /// True once the request has been handed to the organizer.
    pub fn is_with_organizer(&self) -> bool {
        matches!(self, NegotiationState::AwaitingOrganizerDecision { .. })
    }

    /// Next state for a counterpart input. Fails without side effects when the
    /// input does not belong to the current state.
    pub fn advance(&self, input: Input) -> Result<NegotiationState, EngineError> {
        match (self, input) {
            (NegotiationState::SelectingBooking, Input::Select(booking_id)) => {
                Ok(NegotiationState::AwaitingReason { booking_id })
            }
            (NegotiationState::AwaitingReason { booking_id }, Input::Reason(reason)) => {
                Ok(NegotiationState::AwaitingNewTime {
                    booking_id: *booking_id,
                    reason,
                })
            }
            (NegotiationState::AwaitingNewTime { booking_id, reason }, Input::Propose(proposed)) => {
                Ok(NegotiationState::AwaitingOrganizerDecision {
                    booking_id: *booking_id,
                    reason: reason.clone(),
                    proposed,
                })
            }
            (state, input) => Err(EngineError::UnexpectedInput {
                state: state.name(),
                input: input.name(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Decline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineCause {
    /// The organizer said no.
    Organizer,
    /// The booking's date had already passed.
    PastBooking,
    /// The proposed slot was taken by the time the organizer accepted.
    SlotConflict(Party),
    /// The booking disappeared while the negotiation was open.
    BookingGone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted { booking: BookingDetails },
    Declined { booking_id: Ulid, cause: DeclineCause },
    Cancelled { negotiation_id: Ulid },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted { .. } => "accepted",
            Outcome::Declined { .. } => "declined",
            Outcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// Result of an input that may or may not end the negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Pending(NegotiationState),
    Finished(Outcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationRecord {
    pub id: Ulid,
    /// Counterpart who asked for the change.
    pub requester: Ulid,
    pub organizer_id: Ulid,
    /// Lets an expiry policy be layered on top; nothing expires by default.
    pub created_at: DateTime<Utc>,
    pub state: NegotiationState,
}

impl NegotiationRecord {
    pub fn new(requester: Ulid, organizer_id: Ulid, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Ulid::new(),
            requester,
            organizer_id,
            created_at,
            state: NegotiationState::SelectingBooking,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        now - self.created_at >= ttl
    }
}

/// Returned by `start_negotiation`: the new record plus the bookings the
/// requester may pick from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Started {
    pub negotiation: NegotiationRecord,
    pub choices: Vec<Booking>,
}
