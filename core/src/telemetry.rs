//! Minimal tracing-subscriber installer. Bespoke log *sinks* and metrics
//! formatting are an explicit non-goal of this core; this only wires up the
//! default `tracing_subscriber::fmt` layer so the rest of the crate's
//! `debug!`/`warn!` call sites have somewhere to go.

use tracing_subscriber::EnvFilter;

/// Installs a process-wide `tracing` subscriber reading `RUST_LOG`
/// (defaulting to `info`). Idempotent: a second call is a no-op.
pub fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
