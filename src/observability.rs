use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetbook_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings accepted (single and batch).
pub const BOOKINGS_CREATED_TOTAL: &str = "fleetbook_bookings_created_total";

/// Counter: booking requests refused because of an overlap or downtime.
pub const BOOKINGS_REJECTED_TOTAL: &str = "fleetbook_bookings_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "fleetbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "fleetbook_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetbook_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "fleetbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. A failure is logged and the
/// server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://{addr}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertAsset { .. } => "insert_asset",
        Command::UpdateAsset { .. } => "update_asset",
        Command::DeleteAsset { .. } => "delete_asset",
        Command::InsertBooking { .. } => "insert_booking",
        Command::BatchInsertBookings { .. } => "batch_insert_bookings",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DecideBooking { .. } => "decide_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertDowntime { .. } => "insert_downtime",
        Command::UpdateDowntime { .. } => "update_downtime",
        Command::DeleteDowntime { .. } => "delete_downtime",
        Command::SelectUsers => "select_users",
        Command::SelectAssets => "select_assets",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectDowntimes { .. } => "select_downtimes",
        Command::SelectFleetStats => "select_fleet_stats",
        Command::SelectFleetCategories => "select_fleet_categories",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
