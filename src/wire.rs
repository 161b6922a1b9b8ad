//! JSON-lines transport.
//!
//! One request per line, tagged by `"op"`. Every request gets exactly one
//! reply line, `{"ok":true,"data":…}` or `{"ok":false,"error":{"kind":…,"message":…}}`.
//! After `identify`, messages addressed to that external id are pushed on the
//! same connection as `{"ok":true,"data":{"type":"message",…}}`.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::negotiation::*;
use crate::notify::{Message, NotifyHub};
use crate::observability;

/// Accepts `HH:MM` or `HH:MM:SS`.
fn hhmm<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
    let s = String::deserialize(d)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Bind this connection to a chat identity.
    Identify { external_id: ExternalId },
    RegisterOrganizer {
        name: String,
        #[serde(default)]
        contact: Option<String>,
        login: String,
    },
    RegisterCounterpart { organizer_login: String, name: String },

    // Organizer side.
    AddCounterpart {
        name: String,
        #[serde(default)]
        contact: Option<String>,
    },
    RemoveCounterpart { counterpart_id: Ulid },
    DeleteOrganizer,
    ListCounterparts,
    DaySchedule { date: NaiveDate },
    CreateBooking {
        counterpart_id: Ulid,
        date: NaiveDate,
        #[serde(deserialize_with = "hhmm")]
        time: NaiveTime,
    },
    CancelBooking { booking_id: Ulid },
    RescheduleBooking {
        booking_id: Ulid,
        #[serde(deserialize_with = "hhmm")]
        time: NaiveTime,
    },
    ResolveNegotiation { negotiation_id: Ulid, decision: Decision },

    // Counterpart side.
    Upcoming,
    StartNegotiation,
    SelectBooking { negotiation_id: Ulid, booking_id: Ulid },
    SubmitReason { negotiation_id: Ulid, reason: String },
    ProposeTime {
        negotiation_id: Ulid,
        #[serde(deserialize_with = "hhmm")]
        time: NaiveTime,
    },

    /// Either side.
    CancelNegotiation { negotiation_id: Ulid },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Identified { external_id: ExternalId },
    Organizer { organizer: Organizer },
    Counterpart { counterpart: Counterpart },
    Counterparts { counterparts: Vec<Counterpart> },
    Booking { booking: BookingDetails },
    Bookings { bookings: Vec<BookingDetails> },
    Deleted,
    Negotiation {
        negotiation: NegotiationRecord,
        choices: Vec<Booking>,
    },
    State { state: NegotiationState },
    Step { step: Step },
    Outcome { outcome: Outcome },
    Message { message: Message },
}

#[derive(Debug)]
pub enum WireError {
    Engine(EngineError),
    Unidentified,
    BadRequest(String),
}

impl WireError {
    pub fn kind(&self) -> &'static str {
        match self {
            WireError::Engine(e) => e.kind(),
            WireError::Unidentified => "unidentified",
            WireError::BadRequest(_) => "bad_request",
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Engine(e) => write!(f, "{e}"),
            WireError::Unidentified => write!(f, "identify first"),
            WireError::BadRequest(msg) => write!(f, "bad request: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        WireError::Engine(e)
    }
}

#[derive(Serialize)]
struct OkEnvelope<'a> {
    ok: bool,
    data: &'a Reply,
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrEnvelope {
    ok: bool,
    error: ErrorBody,
}

const ENCODE_FAILED: &str = r#"{"ok":false,"error":{"kind":"internal","message":"encoding failed"}}"#;

pub fn encode_ok(reply: &Reply) -> String {
    serde_json::to_string(&OkEnvelope {
        ok: true,
        data: reply,
    })
    .unwrap_or_else(|_| ENCODE_FAILED.to_string())
}

pub fn encode_err(err: &WireError) -> String {
    serde_json::to_string(&ErrEnvelope {
        ok: false,
        error: ErrorBody {
            kind: err.kind(),
            message: err.to_string(),
        },
    })
    .unwrap_or_else(|_| ENCODE_FAILED.to_string())
}

/// Per-connection state.
#[derive(Default)]
pub struct Session {
    identity: Option<ExternalId>,
    inbox: Option<broadcast::Receiver<Message>>,
}

impl Session {
    fn me(&self) -> Result<ExternalId, WireError> {
        self.identity.ok_or(WireError::Unidentified)
    }

    fn bind(&mut self, hub: &NotifyHub, external_id: ExternalId) {
        if let Some(previous) = self.identity.replace(external_id) {
            self.inbox = None;
            hub.release(&previous);
        }
        self.inbox = Some(hub.subscribe(external_id));
    }

    fn close(&mut self, hub: &NotifyHub) {
        self.inbox = None;
        if let Some(id) = self.identity.take() {
            hub.release(&id);
        }
    }
}

async fn next_push(inbox: &mut Option<broadcast::Receiver<Message>>) -> Result<Message, RecvError> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Incoming {
    Line(Option<Result<String, LinesCodecError>>),
    Push(Result<Message, RecvError>),
}

pub async fn process_connection<S>(
    stream: S,
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut session = Session::default();

    let result = loop {
        let incoming = tokio::select! {
            line = framed.next() => Incoming::Line(line),
            push = next_push(&mut session.inbox) => Incoming::Push(push),
        };
        let out = match incoming {
            Incoming::Line(None) => break Ok(()),
            Incoming::Line(Some(Err(LinesCodecError::Io(e)))) => break Err(e),
            Incoming::Line(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                encode_err(&WireError::BadRequest("line too long".into()))
            }
            Incoming::Line(Some(Ok(line))) => {
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&engine, &hub, &mut session, &line).await
            }
            Incoming::Push(Ok(message)) => encode_ok(&Reply::Message { message }),
            Incoming::Push(Err(RecvError::Lagged(skipped))) => {
                warn!("connection fell behind, {skipped} messages dropped");
                continue;
            }
            Incoming::Push(Err(RecvError::Closed)) => {
                session.inbox = None;
                continue;
            }
        };
        if let Err(e) = framed.send(out).await {
            break Err(match e {
                LinesCodecError::Io(e) => e,
                LinesCodecError::MaxLineLengthExceeded => io::Error::other(e),
            });
        }
    };

    session.close(&hub);
    result
}

/// Decode, run and encode a single request line.
pub async fn handle_line(engine: &Engine, hub: &NotifyHub, session: &mut Session, line: &str) -> String {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                .increment(1);
            return encode_err(&WireError::BadRequest(e.to_string()));
        }
    };
    let op = observability::request_label(&request);
    let start = Instant::now();
    let result = execute(engine, hub, session, request).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);

    match result {
        Ok(reply) => encode_ok(&reply),
        Err(e) => {
            debug!(op, kind = e.kind(), "request failed: {e}");
            encode_err(&e)
        }
    }
}

async fn execute(
    engine: &Engine,
    hub: &NotifyHub,
    session: &mut Session,
    request: Request,
) -> Result<Reply, WireError> {
    if let Request::Identify { external_id } = request {
        session.bind(hub, external_id);
        return Ok(Reply::Identified { external_id });
    }
    let me = session.me()?;

    let reply = match request {
        Request::Identify { .. } => unreachable!("handled above"),
        Request::RegisterOrganizer {
            name,
            contact,
            login,
        } => Reply::Organizer {
            organizer: engine.register_organizer(me, name, contact, login).await?,
        },
        Request::RegisterCounterpart {
            organizer_login,
            name,
        } => Reply::Counterpart {
            counterpart: engine
                .register_counterpart(me, &organizer_login, name)
                .await?,
        },
        Request::AddCounterpart { name, contact } => {
            let organizer = engine.organizer_by_external(me).await?;
            Reply::Counterpart {
                counterpart: engine.add_counterpart(organizer.id, name, contact).await?,
            }
        }
        Request::RemoveCounterpart { counterpart_id } => {
            let organizer = engine.organizer_by_external(me).await?;
            let roster = engine.list_counterparts(organizer.id).await?;
            if !roster.iter().any(|c| c.id == counterpart_id) {
                return Err(EngineError::NotFound(counterpart_id).into());
            }
            Reply::Counterpart {
                counterpart: engine.remove_counterpart(counterpart_id).await?,
            }
        }
        Request::DeleteOrganizer => {
            let organizer = engine.organizer_by_external(me).await?;
            engine.delete_organizer(organizer.id).await?;
            Reply::Deleted
        }
        Request::ListCounterparts => {
            let organizer = engine.organizer_by_external(me).await?;
            Reply::Counterparts {
                counterparts: engine.list_counterparts(organizer.id).await?,
            }
        }
        Request::DaySchedule { date } => {
            let organizer = engine.organizer_by_external(me).await?;
            Reply::Bookings {
                bookings: engine.day_schedule(organizer.id, date).await?,
            }
        }
        Request::CreateBooking {
            counterpart_id,
            date,
            time,
        } => {
            let organizer = engine.organizer_by_external(me).await?;
            Reply::Booking {
                booking: engine
                    .create_booking(organizer.id, counterpart_id, date, time)
                    .await?,
            }
        }
        Request::CancelBooking { booking_id } => {
            owned_booking(engine, me, booking_id).await?;
            Reply::Booking {
                booking: engine.cancel_booking(booking_id).await?,
            }
        }
        Request::RescheduleBooking { booking_id, time } => {
            owned_booking(engine, me, booking_id).await?;
            Reply::Booking {
                booking: engine.reschedule_booking(booking_id, time).await?,
            }
        }
        Request::ResolveNegotiation {
            negotiation_id,
            decision,
        } => Reply::Outcome {
            outcome: engine
                .resolve_negotiation(negotiation_id, me, decision)
                .await?,
        },
        Request::Upcoming => {
            let counterpart = engine.counterpart_by_external(me).await?;
            Reply::Bookings {
                bookings: engine.upcoming_for_counterpart(counterpart.id).await?,
            }
        }
        Request::StartNegotiation => {
            let started = engine.start_negotiation(me).await?;
            Reply::Negotiation {
                negotiation: started.negotiation,
                choices: started.choices,
            }
        }
        Request::SelectBooking {
            negotiation_id,
            booking_id,
        } => Reply::State {
            state: engine.select_booking(negotiation_id, me, booking_id).await?,
        },
        Request::SubmitReason {
            negotiation_id,
            reason,
        } => Reply::State {
            state: engine.submit_reason(negotiation_id, me, reason).await?,
        },
        Request::ProposeTime {
            negotiation_id,
            time,
        } => Reply::Step {
            step: engine
                .submit_proposed_time(negotiation_id, me, time)
                .await?,
        },
        Request::CancelNegotiation { negotiation_id } => Reply::Outcome {
            outcome: engine.cancel_negotiation(negotiation_id, me).await?,
        },
    };
    Ok(reply)
}

/// Organizers may only touch bookings in their own calendar; anything else
/// looks missing.
async fn owned_booking(engine: &Engine, me: ExternalId, booking_id: Ulid) -> Result<(), WireError> {
    let organizer = engine.organizer_by_external(me).await?;
    let details = engine.booking(booking_id).await?;
    if details.booking.organizer_id != organizer.id {
        return Err(EngineError::NotFound(booking_id).into());
    }
    Ok(())
}
