use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "condobook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "condobook_query_duration_seconds";

/// Counter: façade call outcomes. Labels: operation, outcome
/// (`ok` or the error label, e.g. `slot_taken`, `date_blocked`).
pub const BOOKING_OUTCOMES_TOTAL: &str = "condobook_booking_outcomes_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "condobook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "condobook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "condobook_connections_rejected_total";

/// Gauge: condominiums with a loaded engine.
pub const CONDOS_ACTIVE: &str = "condobook_condos_active";

/// Counter: logins refused because the user name maps to no identity.
pub const AUTH_FAILURES_TOTAL: &str = "condobook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "condobook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "condobook_wal_flush_batch_size";

/// Counter: completed WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "condobook_wal_compactions_total";

/// Install the Prometheus exporter on `bind:port`. No-op if port is None.
pub fn init(bind: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertArea { .. } => "insert_area",
        Command::UpdateArea { .. } => "update_area",
        Command::DeleteArea { .. } => "delete_area",
        Command::SelectAreas { .. } => "select_areas",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertBlocks { .. } => "insert_blocks",
        Command::DeleteBlocks { .. } => "delete_blocks",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::Listen { .. } => "listen",
    }
}
