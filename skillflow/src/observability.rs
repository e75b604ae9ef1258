//! Tracing setup for engine embedders.
//!
//! The engine itself only emits `tracing` events and never installs a
//! subscriber; binaries call [`init_tracing`] once at startup. The
//! filter comes from `RUST_LOG`, defaulting to `info` for this crate.

use tracing::Span;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Installs a global `tracing` subscriber.
///
/// Filtering follows `RUST_LOG` when set, otherwise `skillflow=info`.
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("skillflow=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Installs a global subscriber that writes JSON lines, for log
/// pipelines.
pub fn init_json_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("skillflow=info"));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .try_init();
}

/// A span covering one engine run, carrying the run id and workflow
/// name so per-stage events correlate.
#[must_use]
pub fn run_span(run_id: Uuid, workflow: &str) -> Span {
    tracing::info_span!("workflow_run", run_id = %run_id, workflow = %workflow)
}
