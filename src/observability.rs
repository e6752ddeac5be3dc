use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "studioslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "studioslot_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (`created` or an error kind).
pub const BOOKINGS_TOTAL: &str = "studioslot_bookings_total";

/// Histogram: time spent acquiring the studio, coach and wallet locks for a commit.
pub const BOOKING_LOCK_WAIT_SECONDS: &str = "studioslot_booking_lock_wait_seconds";

/// Counter: cancellations. Labels: refunded.
pub const CANCELLATIONS_TOTAL: &str = "studioslot_cancellations_total";

/// Counter: waitlist entries created.
pub const WAITLIST_JOINS_TOTAL: &str = "studioslot_waitlist_joins_total";

/// Counter: promotion attempts. Labels: outcome (booked, notified, confirmed, skipped).
pub const PROMOTIONS_TOTAL: &str = "studioslot_promotions_total";

/// Counter: time-based waitlist transitions. Labels: outcome (expired, reverted).
pub const WAITLIST_SWEEP_TOTAL: &str = "studioslot_waitlist_sweep_total";

/// Counter: notifications the collaborator failed to accept. Labels: event.
pub const NOTIFY_FAILURES_TOTAL: &str = "studioslot_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "studioslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "studioslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "studioslot_connections_rejected_total";

/// Gauge: number of loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "studioslot_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studioslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studioslot_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSessions { .. } => "select_sessions",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectPackages { .. } => "select_packages",
        Command::SelectTimeOff { .. } => "select_time_off",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSettings => "select_settings",
        Command::InsertSession { .. } => "insert_session",
        Command::InsertCancellation { .. } => "insert_cancellation",
        Command::InsertAttendance { .. } => "insert_attendance",
        Command::InsertWaitlist { .. } => "insert_waitlist",
        Command::DeleteWaitlist { .. } => "delete_waitlist",
        Command::InsertWaitlistConfirmation { .. } => "insert_waitlist_confirmation",
        Command::InsertAvailability { .. } => "insert_availability",
        Command::DeleteAvailability { .. } => "delete_availability",
        Command::InsertTimeOff { .. } => "insert_time_off",
        Command::InsertTimeOffReview { .. } => "insert_time_off_review",
        Command::InsertStudio { .. } => "insert_studio",
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertCoach { .. } => "insert_coach",
        Command::InsertPackage { .. } => "insert_package",
        Command::InsertSetting { .. } => "insert_setting",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
