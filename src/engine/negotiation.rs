use chrono::{NaiveTime, TimeDelta};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::messages;
use crate::model::*;
use crate::negotiation::*;
use crate::notify::Keyboard;
use crate::observability;

use super::conflict::{check_slot, ensure_not_past, validate_text};
use super::mutations::record_conflict;
use super::{Engine, EngineError};

fn finished(label: &'static str) {
    metrics::counter!(observability::NEGOTIATIONS_FINISHED_TOTAL, "outcome" => label).increment(1);
}

fn record_in(cal: &Calendar, negotiation_id: Ulid) -> Result<NegotiationRecord, EngineError> {
    cal.negotiations
        .get(&negotiation_id)
        .cloned()
        .ok_or(EngineError::NotFound(negotiation_id))
}

/// Only the counterpart who opened a negotiation may drive it. Anyone else
/// sees it as missing.
fn ensure_requester(
    cal: &Calendar,
    record: &NegotiationRecord,
    requester_external: ExternalId,
) -> Result<(), EngineError> {
    match cal.counterparts.get(&record.requester) {
        Some(c) if c.external_id == Some(requester_external) => Ok(()),
        _ => Err(EngineError::NotFound(record.id)),
    }
}

/// Details of the booking a negotiation targets, if it has picked one.
fn target_details(cal: &Calendar, record: &NegotiationRecord) -> Option<BookingDetails> {
    let booking = cal.find_booking(&record.state.booking_id()?)?;
    cal.details(booking)
}

impl Engine {
    async fn close_negotiation(&self, cal: &mut Calendar, negotiation_id: Ulid) -> Result<(), EngineError> {
        let event = Event::NegotiationClosed {
            id: negotiation_id,
            organizer_id: cal.organizer.id,
        };
        self.persist_and_apply(cal, &event).await
    }

    async fn save_negotiation(&self, cal: &mut Calendar, record: NegotiationRecord) -> Result<(), EngineError> {
        self.persist_and_apply(cal, &Event::NegotiationSaved { record })
            .await
    }

    /// Open a reschedule request for the counterpart behind `requester_external`.
    /// Earlier requests of theirs that never reached the organizer are dropped.
    pub async fn start_negotiation(&self, requester_external: ExternalId) -> Result<Started, EngineError> {
        let counterpart = self.counterpart_by_external(requester_external).await?;
        let today = self.today();
        let mut guard = self.write_calendar(counterpart.organizer_id).await?;
        if !guard.counterparts.contains_key(&counterpart.id) {
            return Err(EngineError::Unregistered(requester_external));
        }

        let stale: Vec<Ulid> = guard
            .negotiations
            .values()
            .filter(|n| n.requester == counterpart.id && !n.state.is_with_organizer())
            .map(|n| n.id)
            .collect();
        let choices: Vec<Booking> = guard
            .bookings_for_counterpart_from(counterpart.id, today)
            .into_iter()
            .filter(|b| match guard.negotiation_for_booking(&b.id) {
                None => true,
                Some(n) => stale.contains(&n.id),
            })
            .cloned()
            .collect();
        if choices.is_empty() {
            return Err(EngineError::NothingToReschedule);
        }

        for id in stale {
            self.close_negotiation(&mut guard, id).await?;
            finished("superseded");
        }
        let record = NegotiationRecord::new(counterpart.id, counterpart.organizer_id, self.now());
        self.save_negotiation(&mut guard, record.clone()).await?;
        drop(guard);

        metrics::counter!(observability::NEGOTIATIONS_OPENED_TOTAL).increment(1);
        info!(negotiation = %record.id, requester = %counterpart.id, "negotiation opened");
        Ok(Started {
            negotiation: record,
            choices,
        })
    }

    /// Pick the booking to move. Foreign, past or already negotiated bookings
    /// are refused and the negotiation stays where it was.
    pub async fn select_booking(
        &self,
        negotiation_id: Ulid,
        requester_external: ExternalId,
        booking_id: Ulid,
    ) -> Result<NegotiationState, EngineError> {
        let mut guard = self.resolve_entity_write(&negotiation_id).await?;
        let mut record = record_in(&guard, negotiation_id)?;
        ensure_requester(&guard, &record, requester_external)?;
        let next = record.state.advance(Input::Select(booking_id))?;

        let booking = guard
            .find_booking(&booking_id)
            .filter(|b| b.counterpart_id == record.requester)
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_not_past(booking.date, self.today())?;
        if let Some(other) = guard.negotiation_for_booking(&booking_id)
            && other.id != negotiation_id
        {
            return Err(EngineError::NegotiationPending(booking_id));
        }

        record.state = next.clone();
        self.save_negotiation(&mut guard, record).await?;
        Ok(next)
    }

    pub async fn submit_reason(
        &self,
        negotiation_id: Ulid,
        requester_external: ExternalId,
        reason: String,
    ) -> Result<NegotiationState, EngineError> {
        validate_text(&reason, MAX_REASON_LEN, "reason must be 1-500 chars")?;
        let mut guard = self.resolve_entity_write(&negotiation_id).await?;
        let mut record = record_in(&guard, negotiation_id)?;
        ensure_requester(&guard, &record, requester_external)?;
        let next = record.state.advance(Input::Reason(reason))?;

        record.state = next.clone();
        self.save_negotiation(&mut guard, record).await?;
        Ok(next)
    }

    /// Propose the new time. On success the request is handed to the organizer
    /// with an Accept/Decline keyboard and waits there for as long as it takes.
    pub async fn submit_proposed_time(
        &self,
        negotiation_id: Ulid,
        requester_external: ExternalId,
        time: NaiveTime,
    ) -> Result<Step, EngineError> {
        let time = minute_of(time);
        let mut guard = self.resolve_entity_write(&negotiation_id).await?;
        let mut record = record_in(&guard, negotiation_id)?;
        ensure_requester(&guard, &record, requester_external)?;
        let next = record.state.advance(Input::Propose(time))?;

        let NegotiationState::AwaitingOrganizerDecision {
            booking_id,
            reason,
            proposed,
        } = &next
        else {
            unreachable!("a proposed time always hands over to the organizer");
        };
        let (booking_id, proposed) = (*booking_id, *proposed);
        let booking = guard
            .find_booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if booking.date < self.today() {
            self.close_negotiation(&mut guard, negotiation_id).await?;
            finished("declined");
            info!(negotiation = %negotiation_id, "negotiation declined: booking is in the past");
            return Ok(Step::Finished(Outcome::Declined {
                booking_id,
                cause: DeclineCause::PastBooking,
            }));
        }
        // A slot that is already taken is refused up front; the counterpart
        // may propose another time.
        check_slot(&guard, booking.counterpart_id, booking.date, proposed, Some(booking_id))
            .inspect_err(record_conflict)?;

        let details = guard
            .details(&booking)
            .ok_or(EngineError::NotFound(booking.counterpart_id))?;
        let text = messages::reschedule_requested(&details, proposed, reason);
        record.state = next.clone();
        self.save_negotiation(&mut guard, record).await?;
        drop(guard);

        info!(negotiation = %negotiation_id, %proposed, "negotiation handed to organizer");
        self.dispatcher
            .notify(
                Some(details.organizer_external),
                text,
                Some(Keyboard::decision(negotiation_id)),
            )
            .await;
        Ok(Step::Pending(next))
    }

    /// The organizer's answer. A failed accept (slot taken meanwhile, booking
    /// now past) still ends the negotiation as declined and is not retried.
    pub async fn resolve_negotiation(
        &self,
        negotiation_id: Ulid,
        organizer_external: ExternalId,
        decision: Decision,
    ) -> Result<Outcome, EngineError> {
        let mut guard = self.resolve_entity_write(&negotiation_id).await?;
        let record = record_in(&guard, negotiation_id)?;
        if guard.organizer.external_id != organizer_external {
            return Err(EngineError::NotFound(negotiation_id));
        }
        let (booking_id, proposed) = match &record.state {
            NegotiationState::AwaitingOrganizerDecision {
                booking_id,
                proposed,
                ..
            } => (*booking_id, *proposed),
            other => {
                return Err(EngineError::UnexpectedInput {
                    state: other.name(),
                    input: "organizer decision",
                });
            }
        };
        let original = guard
            .find_booking(&booking_id)
            .and_then(|b| guard.details(b));

        let (outcome, notice) = match decision {
            Decision::Decline => (
                Outcome::Declined {
                    booking_id,
                    cause: DeclineCause::Organizer,
                },
                original.as_ref().map(|d| {
                    (d.counterpart_external, messages::reschedule_declined(d))
                }),
            ),
            Decision::Accept => {
                match self.reschedule_locked(&mut guard, booking_id, proposed).await {
                    Ok(moved) => (
                        Outcome::Accepted {
                            booking: moved.clone(),
                        },
                        Some((moved.counterpart_external, messages::booking_moved(&moved))),
                    ),
                    Err(EngineError::SlotConflict(party)) => (
                        Outcome::Declined {
                            booking_id,
                            cause: DeclineCause::SlotConflict(party),
                        },
                        original.as_ref().map(|d| {
                            (
                                d.counterpart_external,
                                messages::reschedule_declined_busy(d, proposed, party),
                            )
                        }),
                    ),
                    Err(EngineError::PastBooking(_)) => (
                        Outcome::Declined {
                            booking_id,
                            cause: DeclineCause::PastBooking,
                        },
                        original.as_ref().map(|d| {
                            (d.counterpart_external, messages::reschedule_declined(d))
                        }),
                    ),
                    Err(EngineError::NotFound(_)) => (
                        Outcome::Declined {
                            booking_id,
                            cause: DeclineCause::BookingGone,
                        },
                        None,
                    ),
                    Err(e) => return Err(e),
                }
            }
        };

        self.close_negotiation(&mut guard, negotiation_id).await?;
        drop(guard);

        finished(outcome.label());
        info!(negotiation = %negotiation_id, outcome = outcome.label(), "negotiation resolved");
        if let Some((recipient, text)) = notice {
            self.dispatcher.notify(recipient, text, None).await;
        }
        Ok(outcome)
    }

    /// Withdraw a negotiation. Either the requester or the organizer may do
    /// this at any point before it ends; the booking is left alone.
    pub async fn cancel_negotiation(
        &self,
        negotiation_id: Ulid,
        party_external: ExternalId,
    ) -> Result<Outcome, EngineError> {
        let mut guard = self.resolve_entity_write(&negotiation_id).await?;
        let record = record_in(&guard, negotiation_id)?;
        let by = if guard.organizer.external_id == party_external {
            Party::Organizer
        } else {
            ensure_requester(&guard, &record, party_external)?;
            Party::Counterpart
        };

        // The other side only knows about the request once it reached the organizer.
        let notice = target_details(&guard, &record)
            .filter(|_| record.state.is_with_organizer())
            .map(|d| {
                let recipient = match by {
                    Party::Organizer => d.counterpart_external,
                    Party::Counterpart => Some(d.organizer_external),
                };
                (recipient, messages::reschedule_withdrawn(&d, by))
            });

        self.close_negotiation(&mut guard, negotiation_id).await?;
        drop(guard);

        let outcome = Outcome::Cancelled { negotiation_id };
        finished(outcome.label());
        info!(negotiation = %negotiation_id, %by, "negotiation cancelled");
        if let Some((recipient, text)) = notice {
            self.dispatcher.notify(recipient, text, None).await;
        }
        Ok(outcome)
    }

    /// Cancel every negotiation older than `ttl` and tell the requester.
    /// Nothing calls this unless an expiry policy is configured.
    pub async fn expire_negotiations(&self, ttl: TimeDelta) -> Vec<Ulid> {
        let now = self.now();
        let mut expired = Vec::new();
        for organizer_id in self.store.calendar_ids() {
            let Ok(mut guard) = self.write_calendar(organizer_id).await else {
                continue;
            };
            let due: Vec<NegotiationRecord> = guard
                .negotiations
                .values()
                .filter(|n| n.is_expired(now, ttl))
                .cloned()
                .collect();
            let mut notices = Vec::new();
            for record in due {
                let requester = guard
                    .counterparts
                    .get(&record.requester)
                    .and_then(|c| c.external_id);
                let details = target_details(&guard, &record);
                if let Err(e) = self.close_negotiation(&mut guard, record.id).await {
                    warn!(negotiation = %record.id, "could not expire negotiation: {e}");
                    continue;
                }
                finished("expired");
                expired.push(record.id);
                if let Some(d) = details {
                    notices.push((requester, messages::reschedule_expired(&d)));
                }
            }
            drop(guard);
            for (recipient, text) in notices {
                self.dispatcher.notify(recipient, text, None).await;
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale negotiations");
        }
        expired
    }
}
