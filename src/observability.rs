use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "kitbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "kitbook_query_duration_seconds";

/// Counter: checkout attempts. Labels: outcome.
pub const CHECKOUTS_TOTAL: &str = "kitbook_checkouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "kitbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "kitbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "kitbook_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "kitbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kitbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kitbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Label for a checkout result.
pub fn checkout_outcome<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "placed",
        Err(EngineError::InsufficientStock { .. }) => "insufficient_stock",
        Err(EngineError::Conflict { .. }) => "conflict",
        Err(EngineError::OutOfService { .. } | EngineError::Inactive(_)) => "out_of_service",
        Err(EngineError::ConcurrentConflict) => "concurrent_conflict",
        Err(_) => "rejected",
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProduct(_) => "insert_product",
        Command::InsertStudio(_) => "insert_studio",
        Command::InsertStaff(_) => "insert_staff",
        Command::InsertEquipment(_) => "insert_equipment",
        Command::SetEquipmentStatus { .. } => "set_equipment_status",
        Command::SetStaffActive { .. } => "set_staff_active",
        Command::StockUnits { .. } => "stock_units",
        Command::PlaceBooking { .. } => "place_booking",
        Command::Transition { .. } => "transition",
        Command::Reschedule { .. } => "reschedule",
        Command::Assign { .. } => "assign",
        Command::Release { .. } => "release",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectSoldOut { .. } => "select_sold_out",
        Command::SelectInventory { .. } => "select_inventory",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectIssues { .. } => "select_issues",
        Command::SelectQuote { .. } => "select_quote",
    }
}
