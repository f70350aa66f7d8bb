use std::net::SocketAddr;

// ── Allocation outcomes ─────────────────────────────────────────

/// Counter: hold attempts. Labels: outcome (`held` or an error kind).
pub const HOLDS_TOTAL: &str = "roomslot_holds_total";

/// Histogram: hold latency in seconds, store round trips included.
pub const HOLD_DURATION_SECONDS: &str = "roomslot_hold_duration_seconds";

/// Counter: holds turned into bookings.
pub const BOOKINGS_FINALIZED_TOTAL: &str = "roomslot_bookings_finalized_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "roomslot_bookings_cancelled_total";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "roomslot_holds_reaped_total";

/// Counter: ledger rows skipped because they could not be decoded.
pub const CORRUPT_RECORDS_TOTAL: &str = "roomslot_corrupt_records_total";

// ── Store ───────────────────────────────────────────────────────

/// Counter: tabular store round trips. Labels: op.
pub const STORE_CALLS_TOTAL: &str = "roomslot_store_calls_total";

/// Counter: commands served on the command surface. Labels: op, status.
pub const COMMANDS_TOTAL: &str = "roomslot_commands_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomslot_wal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomslot_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
