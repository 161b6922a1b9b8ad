use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::negotiation::NegotiationRecord;

use super::{Engine, EngineError};

impl Engine {
    pub fn organizer_count(&self) -> usize {
        self.store.calendar_count()
    }

    /// Identity lookup for an organizer's chat id.
    pub async fn organizer_by_external(&self, external_id: ExternalId) -> Result<Organizer, EngineError> {
        let organizer_id = self
            .store
            .organizer_by_external(&external_id)
            .ok_or(EngineError::Unregistered(external_id))?;
        let guard = self
            .read_calendar(organizer_id)
            .await
            .map_err(|_| EngineError::Unregistered(external_id))?;
        Ok(guard.organizer.clone())
    }

    /// Identity lookup for a counterpart's chat id.
    pub async fn counterpart_by_external(&self, external_id: ExternalId) -> Result<Counterpart, EngineError> {
        let counterpart_id = self
            .store
            .counterpart_by_external(&external_id)
            .ok_or(EngineError::Unregistered(external_id))?;
        let guard = self
            .resolve_entity_read(&counterpart_id)
            .await
            .map_err(|_| EngineError::Unregistered(external_id))?;
        guard
            .counterparts
            .get(&counterpart_id)
            .cloned()
            .ok_or(EngineError::Unregistered(external_id))
    }

    pub async fn organizer(&self, organizer_id: Ulid) -> Result<Organizer, EngineError> {
        Ok(self.read_calendar(organizer_id).await?.organizer.clone())
    }

    pub async fn booking(&self, booking_id: Ulid) -> Result<BookingDetails, EngineError> {
        let guard = self.resolve_entity_read(&booking_id).await?;
        guard
            .find_booking(&booking_id)
            .and_then(|b| guard.details(b))
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// The organizer's bookings on one date, ordered by time.
    pub async fn day_schedule(
        &self,
        organizer_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<BookingDetails>, EngineError> {
        let guard = self.read_calendar(organizer_id).await?;
        Ok(guard
            .bookings_on(date)
            .into_iter()
            .filter_map(|b| guard.details(b))
            .collect())
    }

    /// A counterpart's bookings from today on, ordered by date then time.
    pub async fn upcoming_for_counterpart(
        &self,
        counterpart_id: Ulid,
    ) -> Result<Vec<BookingDetails>, EngineError> {
        let today = self.today();
        let guard = self.resolve_entity_read(&counterpart_id).await?;
        if !guard.counterparts.contains_key(&counterpart_id) {
            return Err(EngineError::NotFound(counterpart_id));
        }
        Ok(guard
            .bookings_for_counterpart_from(counterpart_id, today)
            .into_iter()
            .filter_map(|b| guard.details(b))
            .collect())
    }

    /// The organizer's roster, ordered by name.
    pub async fn list_counterparts(&self, organizer_id: Ulid) -> Result<Vec<Counterpart>, EngineError> {
        let guard = self.read_calendar(organizer_id).await?;
        let mut out: Vec<Counterpart> = guard.counterparts.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub async fn negotiation(&self, negotiation_id: Ulid) -> Result<NegotiationRecord, EngineError> {
        let guard = self.resolve_entity_read(&negotiation_id).await?;
        guard
            .negotiations
            .get(&negotiation_id)
            .cloned()
            .ok_or(EngineError::NotFound(negotiation_id))
    }
}
