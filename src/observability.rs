use std::net::SocketAddr;

use crate::sql::Command;

// ── Admission ───────────────────────────────────────────────────

/// Counter: claim requests by outcome. Labels: outcome.
pub const CLAIMS_TOTAL: &str = "slotgate_claims_total";

/// Histogram: end-to-end claim latency in seconds.
pub const CLAIM_DURATION_SECONDS: &str = "slotgate_claim_duration_seconds";

/// Counter: GROUP_FULL answered from the cache without a ledger write.
pub const FAST_REJECTIONS_TOTAL: &str = "slotgate_fast_rejections_total";

/// Counter: release requests. Labels: released (true/false).
pub const RELEASES_TOTAL: &str = "slotgate_releases_total";

/// Counter: cache failures. Labels: op (get, refresh).
pub const CACHE_ERRORS_TOTAL: &str = "slotgate_cache_errors_total";

/// Counter: successful pool resyncs.
pub const RESYNCS_TOTAL: &str = "slotgate_resyncs_total";

// ── Wire server ─────────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotgate_queries_total";

pub const CONNECTIONS_ACTIVE: &str = "slotgate_connections_active";

pub const CONNECTIONS_TOTAL: &str = "slotgate_connections_total";

pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotgate_connections_rejected_total";

// ── Ledger ──────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotgate_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotgate_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser { .. } => "register_user",
        Command::Claim { .. } => "claim",
        Command::Release { .. } => "release",
        Command::SelectClaims { .. } => "select_claims",
        Command::SelectRemaining { .. } => "select_remaining",
        Command::SelectSlots { .. } => "select_slots",
        Command::Resync { .. } => "resync",
    }
}
