//! Logging/tracing bootstrap (spec §4.7, grounded on `x402-rs::telemetry`).
//!
//! The spec externalizes analytics and SNMP counters as an out-of-scope collaborator
//! (§1 Non-goals), so unlike the teacher this does not export spans to an OTLP
//! collector — it keeps only the local `tracing-subscriber::fmt` layer, gated by
//! `EnvFilter` the same way the teacher gates its OTLP layer by environment variable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global `tracing` subscriber. Call once at process start.
pub struct Telemetry;

impl Telemetry {
    pub fn init() -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();

        tracing::info!("structured logging initialized (no OTel exporter configured)");
        Telemetry
    }
}
