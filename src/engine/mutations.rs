use chrono::{NaiveDate, NaiveTime};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::messages;
use crate::model::*;
use crate::observability;

use super::conflict::{check_slot, ensure_not_past, validate_contact, validate_text};
use super::{Engine, EngineError, WalCommand};

pub(super) fn record_conflict(e: &EngineError) {
    if let EngineError::SlotConflict(party) = e {
        let party = match party {
            Party::Organizer => "organizer",
            Party::Counterpart => "counterpart",
        };
        metrics::counter!(observability::SLOT_CONFLICTS_TOTAL, "party" => party).increment(1);
    }
}

impl Engine {
    // ── Directory ────────────────────────────────────────────

    fn ensure_unregistered(&self, external_id: ExternalId) -> Result<(), EngineError> {
        if self.store.organizer_by_external(&external_id).is_some()
            || self.store.counterpart_by_external(&external_id).is_some()
        {
            return Err(EngineError::AlreadyRegistered(external_id));
        }
        Ok(())
    }

    pub async fn register_organizer(
        &self,
        external_id: ExternalId,
        name: String,
        contact: Option<String>,
        login: String,
    ) -> Result<Organizer, EngineError> {
        validate_text(&name, MAX_NAME_LEN, "name must be 1-100 chars")?;
        validate_text(&login, MAX_LOGIN_LEN, "login must be 1-100 chars")?;
        validate_contact(contact.as_deref())?;

        let _registry = self.registry.lock().await;
        self.ensure_unregistered(external_id)?;
        if self.store.organizer_by_login(&login).is_some() {
            return Err(EngineError::LoginTaken(login));
        }

        let organizer = Organizer {
            id: Ulid::new(),
            external_id,
            name,
            contact,
            login,
        };
        self.persist_directory(&Event::OrganizerRegistered {
            organizer: organizer.clone(),
        })
        .await?;
        self.store.insert_calendar(organizer.clone());
        metrics::gauge!(observability::ORGANIZERS_ACTIVE).set(self.store.calendar_count() as f64);
        info!(organizer = %organizer.id, login = %organizer.login, "organizer registered");
        Ok(organizer)
    }

    /// Self-registration of a counterpart under an organizer's login.
    pub async fn register_counterpart(
        &self,
        external_id: ExternalId,
        organizer_login: &str,
        name: String,
    ) -> Result<Counterpart, EngineError> {
        validate_text(&name, MAX_NAME_LEN, "name must be 1-100 chars")?;

        let _registry = self.registry.lock().await;
        self.ensure_unregistered(external_id)?;
        let organizer_id = self
            .store
            .organizer_by_login(organizer_login)
            .ok_or_else(|| EngineError::UnknownLogin(organizer_login.to_string()))?;
        let mut guard = self.write_calendar(organizer_id).await?;
        self.add_to_roster(&mut guard, Some(external_id), name, None)
            .await
    }

    /// Counterpart entered by the organizer; it has no chat identity.
    pub async fn add_counterpart(
        &self,
        organizer_id: Ulid,
        name: String,
        contact: Option<String>,
    ) -> Result<Counterpart, EngineError> {
        validate_text(&name, MAX_NAME_LEN, "name must be 1-100 chars")?;
        validate_contact(contact.as_deref())?;
        let mut guard = self.write_calendar(organizer_id).await?;
        self.add_to_roster(&mut guard, None, name, contact).await
    }

    async fn add_to_roster(
        &self,
        cal: &mut Calendar,
        external_id: Option<ExternalId>,
        name: String,
        contact: Option<String>,
    ) -> Result<Counterpart, EngineError> {
        if cal.counterparts.len() >= MAX_COUNTERPARTS_PER_ORGANIZER {
            return Err(EngineError::LimitExceeded("too many counterparts"));
        }
        let counterpart = Counterpart {
            id: Ulid::new(),
            organizer_id: cal.organizer.id,
            external_id,
            name,
            contact,
        };
        let event = Event::CounterpartAdded {
            counterpart: counterpart.clone(),
        };
        self.persist_and_apply(cal, &event).await?;
        info!(counterpart = %counterpart.id, organizer = %cal.organizer.id, "counterpart added");
        Ok(counterpart)
    }

    /// Drops the counterpart together with its bookings and negotiations.
    pub async fn remove_counterpart(&self, counterpart_id: Ulid) -> Result<Counterpart, EngineError> {
        let mut guard = self.resolve_entity_write(&counterpart_id).await?;
        let counterpart = guard
            .counterparts
            .get(&counterpart_id)
            .cloned()
            .ok_or(EngineError::NotFound(counterpart_id))?;
        let event = Event::CounterpartRemoved {
            id: counterpart_id,
            organizer_id: guard.organizer.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(counterpart = %counterpart_id, "counterpart removed");
        Ok(counterpart)
    }

    /// Drops the organizer's whole calendar.
    pub async fn delete_organizer(&self, organizer_id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut guard = self.write_calendar(organizer_id).await?;
        self.persist_directory(&Event::OrganizerDeleted { id: organizer_id })
            .await?;
        self.store.remove_calendar(&mut guard);
        metrics::gauge!(observability::ORGANIZERS_ACTIVE).set(self.store.calendar_count() as f64);
        info!(organizer = %organizer_id, "organizer deleted");
        Ok(())
    }

    // ── Scheduling ───────────────────────────────────────────

    pub async fn create_booking(
        &self,
        organizer_id: Ulid,
        counterpart_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<BookingDetails, EngineError> {
        let time = minute_of(time);
        ensure_not_past(date, self.today())?;

        let mut guard = self.write_calendar(organizer_id).await?;
        if !guard.counterparts.contains_key(&counterpart_id) {
            return Err(EngineError::NotFound(counterpart_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ORGANIZER {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        check_slot(&guard, counterpart_id, date, time, None).inspect_err(record_conflict)?;

        let booking = Booking {
            id: Ulid::new(),
            organizer_id,
            counterpart_id,
            date,
            time,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event)
            .await
            .inspect_err(record_conflict)?;
        let details = guard
            .details(&booking)
            .ok_or(EngineError::NotFound(counterpart_id))?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(booking = %booking.id, %date, %time, "booking created");
        self.dispatcher
            .notify(
                details.counterpart_external,
                messages::booking_created(&details),
                None,
            )
            .await;
        Ok(details)
    }

    /// Returns the booking as it was before deletion.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<BookingDetails, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let booking = guard
            .find_booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let details = guard
            .details(&booking)
            .ok_or(EngineError::NotFound(booking.counterpart_id))?;
        let event = Event::BookingCancelled {
            id: booking_id,
            organizer_id: guard.organizer.id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(booking = %booking_id, "booking cancelled");
        self.dispatcher
            .notify(
                details.counterpart_external,
                messages::booking_cancelled(&details),
                None,
            )
            .await;
        Ok(details)
    }

    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        new_time: NaiveTime,
    ) -> Result<BookingDetails, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let details = self
            .reschedule_locked(&mut guard, booking_id, new_time)
            .await?;
        drop(guard);

        self.dispatcher
            .notify(
                details.counterpart_external,
                messages::booking_moved(&details),
                None,
            )
            .await;
        Ok(details)
    }

    /// Move a booking within an already locked calendar. The booking's current
    /// date gates the past check, not the new time.
    pub(super) async fn reschedule_locked(
        &self,
        cal: &mut Calendar,
        booking_id: Ulid,
        new_time: NaiveTime,
    ) -> Result<BookingDetails, EngineError> {
        let new_time = minute_of(new_time);
        let booking = cal
            .find_booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        ensure_not_past(booking.date, self.today())?;
        check_slot(cal, booking.counterpart_id, booking.date, new_time, Some(booking_id))
            .inspect_err(record_conflict)?;

        let event = Event::BookingRescheduled {
            id: booking_id,
            organizer_id: cal.organizer.id,
            time: new_time,
        };
        self.persist_and_apply(cal, &event)
            .await
            .inspect_err(record_conflict)?;

        let moved = cal
            .find_booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        metrics::counter!(observability::BOOKINGS_RESCHEDULED_TOTAL).increment(1);
        info!(booking = %booking_id, from = %booking.time, to = %new_time, "booking rescheduled");
        cal.details(&moved)
            .ok_or(EngineError::NotFound(moved.counterpart_id))
    }

    // ── Log maintenance ──────────────────────────────────────

    /// Rewrite the log as the minimal event sequence for the current state.
    /// Holds the registry and every calendar's read lock so the snapshot is
    /// consistent with what the log already contains.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut ids = self.store.calendar_ids();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(cal) = self.store.calendar(&id) {
                guards.push(cal.read_owned().await);
            }
        }

        let mut events = Vec::new();
        for cal in guards.iter().filter(|c| !c.retired) {
            events.push(Event::OrganizerRegistered {
                organizer: cal.organizer.clone(),
            });
            let mut counterparts: Vec<&Counterpart> = cal.counterparts.values().collect();
            counterparts.sort_by_key(|c| c.id);
            events.extend(counterparts.into_iter().map(|c| Event::CounterpartAdded {
                counterpart: c.clone(),
            }));
            let mut bookings: Vec<&Booking> = cal.bookings.values().collect();
            bookings.sort_by_key(|b| b.id);
            events.extend(bookings.into_iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
            events.extend(cal.negotiations.values().map(|n| Event::NegotiationSaved {
                record: n.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        debug!(events = count, "log compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
