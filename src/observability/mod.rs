//! Logging and metrics for the system database.
//!
//! Metrics are recorded through the `metrics` facade; installing a recorder
//! and exporter is left to the embedding process.

use crate::config::ObservabilityConfig;
use crate::error::{Result, SysdbError};
use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| SysdbError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| SysdbError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    register_metrics();
    info!("Observability initialized");
    Ok(())
}

/// Register standard metrics.
fn register_metrics() {
    gauge!("sysdb_map_version").set(0.0);
    gauge!("sysdb_members_total").set(0.0);
    counter!("sysdb_raft_ops_total").absolute(0);
    counter!("sysdb_emergency_shutdowns_total").absolute(0);
    counter!("sysdb_joins_total").absolute(0);
}

/// Record a committed replicated operation.
pub fn record_raft_op(op: &str) {
    counter!("sysdb_raft_ops_total", "op" => op.to_string()).increment(1);
}

/// Record a replica taking itself out of service.
pub fn record_emergency_shutdown() {
    counter!("sysdb_emergency_shutdowns_total").increment(1);
}

/// Record the outcome of a join request.
pub fn record_join(outcome: &str) {
    counter!("sysdb_joins_total", "outcome" => outcome.to_string()).increment(1);
}

/// Update membership gauges after a committed change.
pub fn update_membership_metrics(map_version: u32, members: usize) {
    gauge!("sysdb_map_version").set(map_version as f64);
    gauge!("sysdb_members_total").set(members as f64);
}
