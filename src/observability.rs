use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: transport requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "lessond_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "lessond_request_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "lessond_bookings_created_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "lessond_bookings_cancelled_total";
pub const BOOKINGS_RESCHEDULED_TOTAL: &str = "lessond_bookings_rescheduled_total";

/// Counter: writes refused because a slot was taken. Labels: party.
pub const SLOT_CONFLICTS_TOTAL: &str = "lessond_slot_conflicts_total";

pub const NEGOTIATIONS_OPENED_TOTAL: &str = "lessond_negotiations_opened_total";

/// Counter: negotiations that ended. Labels: outcome.
pub const NEGOTIATIONS_FINISHED_TOTAL: &str = "lessond_negotiations_finished_total";

pub const NOTIFICATIONS_SENT_TOTAL: &str = "lessond_notifications_sent_total";

/// Counter: notifications that could not be delivered. Labels: reason.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "lessond_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "lessond_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "lessond_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "lessond_connections_rejected_total";

/// Gauge: registered organizers (loaded calendars).
pub const ORGANIZERS_ACTIVE: &str = "lessond_organizers_active";

/// Histogram: log group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "lessond_wal_flush_duration_seconds";

/// Histogram: log group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "lessond_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used on every request metric.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Identify { .. } => "identify",
        Request::RegisterOrganizer { .. } => "register_organizer",
        Request::RegisterCounterpart { .. } => "register_counterpart",
        Request::AddCounterpart { .. } => "add_counterpart",
        Request::RemoveCounterpart { .. } => "remove_counterpart",
        Request::DeleteOrganizer => "delete_organizer",
        Request::ListCounterparts => "list_counterparts",
        Request::DaySchedule { .. } => "day_schedule",
        Request::Upcoming => "upcoming",
        Request::CreateBooking { .. } => "create_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::RescheduleBooking { .. } => "reschedule_booking",
        Request::StartNegotiation => "start_negotiation",
        Request::SelectBooking { .. } => "select_booking",
        Request::SubmitReason { .. } => "submit_reason",
        Request::ProposeTime { .. } => "propose_time",
        Request::ResolveNegotiation { .. } => "resolve_negotiation",
        Request::CancelNegotiation { .. } => "cancel_negotiation",
    }
}
