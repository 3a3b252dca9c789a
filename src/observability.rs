use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotward_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotward_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (created, conflict, rejected).
pub const RESERVATIONS_TOTAL: &str = "slotward_reservations_total";

// ── Availability cache ──────────────────────────────────────────

pub const CACHE_HITS_TOTAL: &str = "slotward_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "slotward_cache_misses_total";
pub const CACHE_INVALIDATIONS_TOTAL: &str = "slotward_cache_invalidations_total";

/// Counter: entries removed by the TTL sweeper.
pub const CACHE_EVICTIONS_TOTAL: &str = "slotward_cache_evictions_total";

// ── Collaborators ───────────────────────────────────────────────

/// Counter: busy sources that failed or timed out. Labels: reason.
pub const BUSY_SOURCE_FAILURES_TOTAL: &str = "slotward_busy_source_failures_total";

/// Counter: post-commit side effects that failed. Labels: kind.
pub const DISPATCH_FAILURES_TOTAL: &str = "slotward_dispatch_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotward_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotward_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotward_connections_rejected_total";

/// Gauge: booking pages loaded.
pub const PAGES_ACTIVE: &str = "slotward_pages_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotward_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotward_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotward_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::CreatePage { .. } => "create_page",
        Command::UpdatePage { .. } => "update_page",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::Listen { .. } => "listen",
    }
}
