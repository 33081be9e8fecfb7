use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "shiftboard_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "shiftboard_query_duration_seconds";

/// Counter: applied shift mutations. Labels: op.
pub const MUTATIONS_TOTAL: &str = "shiftboard_mutations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shiftboard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shiftboard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shiftboard_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "shiftboard_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shiftboard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shiftboard_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "shiftboard_wal_compactions_total";

// ── Domain ──────────────────────────────────────────────────────

/// Gauge: live shifts across all devices.
pub const SHIFTS_ACTIVE: &str = "shiftboard_shifts_active";

/// Counter: overlap links created by inserts and moves.
pub const OVERLAP_LINKS_CREATED_TOTAL: &str = "shiftboard_overlap_links_created_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertShift { .. } => "insert_shift",
        Command::UpdateShift { .. } => "update_shift",
        Command::DeleteShift { .. } => "delete_shift",
        Command::SelectShift { .. } => "select_shift",
        Command::SelectShiftsOnDevice { .. } => "select_shifts_on_device",
        Command::SelectBlocksByDay { .. } => "select_blocks_day",
        Command::SelectBlocksByMonth { .. } => "select_blocks_month",
        Command::SelectDevices => "select_devices",
    }
}
