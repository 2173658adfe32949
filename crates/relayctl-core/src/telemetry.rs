//! Logging setup. A plain `tracing-subscriber` fmt layer driven by `RUST_LOG`
//! (or the `logging` config key) is all this crate needs; nothing here tries
//! to reproduce a bespoke non-blocking JSON pipeline.

use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// Process start time, used to report task durations in readiness logs.
pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

const DEFAULT_FILTER: &str = "info";

/// Installs a global `tracing` subscriber. Call once, at the top of `main`.
/// `filter` overrides `RUST_LOG` when set; otherwise `RUST_LOG` is used, and
/// failing that the crate falls back to logging at `info`.
pub fn setup_logging(filter: Option<&str>) {
	Lazy::force(&APPLICATION_START_TIME);

	let env_filter = match filter {
		Some(f) => EnvFilter::try_new(f).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
	};

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_span_events(FmtSpan::NONE)
		.with_target(true)
		.try_init()
		.ok();
}
