mod conflict;
mod error;
mod mutations;
mod negotiation;
mod queries;
mod store;

pub use error::EngineError;
pub use store::{InMemoryStore, SharedCalendar, Violation};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use mockable::Clock;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Dispatcher;
use crate::observability;
use crate::wal::Wal;

pub type SharedClock = Arc<dyn Clock + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the log. Appends that arrive while a batch is being gathered share a
/// single fsync; non-append commands flush the open batch first.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("log flush failed, rejecting {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a partial batch does not leak into
    // the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) dispatcher: Dispatcher,
    pub(super) clock: SharedClock,
    /// Serializes directory changes (registrations, deletions) and compaction.
    /// Always taken before any calendar lock.
    pub(super) registry: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, dispatcher: Dispatcher, clock: SharedClock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            dispatcher,
            clock,
            registry: Mutex::new(()),
        };

        // Nothing else holds these locks yet, so try_write never waits. Blocking
        // variants would panic inside the runtime.
        for event in &events {
            match event {
                Event::OrganizerRegistered { organizer } => {
                    engine.store.insert_calendar(organizer.clone());
                }
                Event::OrganizerDeleted { id } => {
                    if let Some(cal) = engine.store.calendar(id) {
                        let mut guard = cal.try_write().map_err(|_| contended(id))?;
                        engine.store.remove_calendar(&mut guard);
                    }
                }
                other => {
                    let organizer_id = other.organizer_id();
                    if let Some(cal) = engine.store.calendar(&organizer_id) {
                        let mut guard = cal.try_write().map_err(|_| contended(&organizer_id))?;
                        engine.store.apply(&mut guard, other);
                    }
                }
            }
        }
        info!(
            events = events.len(),
            organizers = engine.store.calendar_count(),
            "state restored from {}",
            wal_path.display()
        );

        Ok(engine)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Current local date; bookings before it are in the past.
    pub fn today(&self) -> NaiveDate {
        self.clock.local().date_naive()
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.utc()
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Constraint check, durable append, then in-memory apply. The caller holds
    /// the calendar's write lock across all three.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut Calendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        if let Err(violation) = self.store.validate(cal, event) {
            if let Violation::SlotTaken(party) = violation {
                warn!(%party, organizer = %cal.organizer.id, "slot constraint rejected write");
            }
            return Err(violation.into());
        }
        self.wal_append(event).await?;
        self.store.apply(cal, event);
        Ok(())
    }

    /// Append a directory-level event that has no calendar to validate against.
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await
    }

    pub(super) async fn write_calendar(
        &self,
        organizer_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Calendar>, EngineError> {
        let cal = self
            .store
            .calendar(&organizer_id)
            .ok_or(EngineError::NotFound(organizer_id))?;
        let guard = cal.write_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(organizer_id));
        }
        Ok(guard)
    }

    pub(super) async fn read_calendar(
        &self,
        organizer_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<Calendar>, EngineError> {
        let cal = self
            .store
            .calendar(&organizer_id)
            .ok_or(EngineError::NotFound(organizer_id))?;
        let guard = cal.read_owned().await;
        if guard.retired {
            return Err(EngineError::NotFound(organizer_id));
        }
        Ok(guard)
    }

    /// Lookup entity → organizer, then lock that calendar for writing.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Calendar>, EngineError> {
        let organizer_id = self
            .store
            .organizer_for(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.write_calendar(organizer_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }

    pub(super) async fn resolve_entity_read(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<Calendar>, EngineError> {
        let organizer_id = self
            .store
            .organizer_for(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.read_calendar(organizer_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }
}

fn contended(id: &Ulid) -> io::Error {
    io::Error::other(format!("replay: calendar {id} unexpectedly locked"))
}
