use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "runboard_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "runboard_request_duration_seconds";

/// Counter: top-level allocation calls. Labels: outcome (ok, unresolved, error).
pub const ALLOCATIONS_TOTAL: &str = "runboard_allocations_total";

/// Histogram: allocation latency in seconds, lock wait and journal included.
pub const ALLOCATION_DURATION_SECONDS: &str = "runboard_allocation_duration_seconds";

/// Counter: parties evicted and queued for rehoming.
pub const DISPLACEMENTS_TOTAL: &str = "runboard_displacements_total";

/// Counter: availability checks. Labels: result (available, full, error).
pub const AVAILABILITY_CHECKS_TOTAL: &str = "runboard_availability_checks_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "runboard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "runboard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "runboard_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "runboard_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (allocation calls per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "runboard_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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

/// Map a request to a short label for metrics.
pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::CheckAvailability { .. } => "check_availability",
        Request::Allocate(_) => "allocate",
        Request::Vacancy { .. } => "vacancy",
        Request::VacancySeries { .. } => "vacancy_series",
        Request::Occupancy { .. } => "occupancy",
        Request::BookingOccupancy { .. } => "booking_occupancy",
        Request::RunsOfType { .. } => "runs_of_type",
        Request::RegisterBooking(_) => "register_booking",
        Request::RegisterPet(_) => "register_pet",
        Request::ExtendHorizon { .. } => "extend_horizon",
        Request::Checkpoint => "checkpoint",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
    }
}
