//! Wires every component together and runs the background task set (§5):
//! reconciliation worker, fast-path sampler, policy-expiry sweeper, policy
//! sweep loop, plus the two loopback-bound HTTP endpoints.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use relayctl_core::drain;
use relayctl_core::readiness::Ready;
use relayctl_core::signal::Shutdown;
use relayctl_core::telemetry;
use relayctl_exec::{Executor, SystemExecutor};
use relayctl_fastpath::{run_control_loop, FastPathManager, UnsupportedFastPath};
use relayctl_geo::GeoDb;
use relayctl_store::{AuditRing, Store};
use relayctl_tunnel::{ensure_interface, TunnelKeyPair, TunnelManager};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{server_tunnel_address, RuntimeConfig};
use crate::reconciler::Reconciler;

const GEOLITE_ARCHIVE_URL: &str = "https://download.maxmind.com/app/geoip_download?edition_id=GeoLite2-Country-CSV&suffix=zip";

pub async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
	let ready = Ready::new();
	let shutdown = Shutdown::new();

	std::fs::create_dir_all(&config.data_dir).with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

	let store = Arc::new(Store::connect(&config.database_path()).await.context("opening config store")?);

	let geo = GeoDb::with_persist_path(config.geo_persist_path());
	geo.load_from_disk().context("loading persisted geo database")?;
	if let Some(license_key) = &config.geo_license_key {
		if let Err(e) = geo.refresh(GEOLITE_ARCHIVE_URL, Some(license_key)).await {
			warn!(error = %e, "initial geo database refresh failed, continuing with whatever was persisted");
		}
	}

	let executor: Arc<dyn Executor> = Arc::new(SystemExecutor::new());

	let server_keypair = load_or_generate_server_key(&config.server_key_path())?;
	let tunnel_subnet = config.tunnel_subnet;
	let server_tunnel_addr = server_tunnel_address(tunnel_subnet);
	ensure_interface(&executor, &config.tunnel_interface, &server_keypair.private, server_tunnel_addr, tunnel_subnet.prefix_len(), config.tunnel_listen_port)
		.await
		.context("bringing up tunnel interface")?;
	let tunnel = TunnelManager::new(config.tunnel_interface.clone(), executor.clone());

	// No real attach path is wired up on a generic host; `UnsupportedFastPath`
	// fails `enable()` cleanly. If the defense settings require the fast path
	// that's fatal at startup; otherwise it's simply never attempted and the
	// system runs slow-path-only.
	let fastpath = Arc::new(FastPathManager::new(Box::new(UnsupportedFastPath)));
	let settings = store.defense_settings().await.context("reading defense settings")?;
	if settings.fastpath_enabled {
		if let Err(e) = fastpath.enable().await {
			return Err(e).context("defense settings require the fast path, but it failed to attach on this host");
		}
	}

	let audit = Arc::new(AuditRing::new());

	let reconciler = Arc::new(Reconciler::new(
		store.clone(),
		tunnel,
		fastpath.clone(),
		geo.clone(),
		audit.clone(),
		executor.clone(),
		config.public_interface.clone(),
		tunnel_subnet,
		config.tunnel_listen_port,
		config.management_tcp_ports.clone(),
		config.staging_rules_path(),
	));

	let startup_guard = ready.register_task("initial-reconciliation");
	reconciler.apply_desired_state().await.context("initial reconciliation")?;
	drop(startup_guard);

	let mut tasks = Vec::new();
	let mut shutdown_senders = Vec::new();
	let (drain_trigger, drain_watcher) = drain::new();

	{
		let reconciler = reconciler.clone();
		let (tx, rx) = mpsc::channel(1);
		shutdown_senders.push(tx);
		let watcher = drain_watcher.clone();
		tasks.push(tokio::spawn(async move {
			let _watcher = watcher;
			reconciler.run_worker(rx).await
		}));
	}

	{
		let fastpath = fastpath.clone();
		let geo = geo.clone();
		let interval = config.fastpath_sample_interval;
		let (tx, rx) = mpsc::channel(1);
		shutdown_senders.push(tx);
		let watcher = drain_watcher.clone();
		tasks.push(tokio::spawn(async move {
			let _watcher = watcher;
			run_control_loop(fastpath, geo, interval, 20, rx).await
		}));
	}

	{
		let store = store.clone();
		let reconciler = reconciler.clone();
		let interval = config.policy_sweep_interval;
		let ready_guard = ready.register_task("policy-sweeper");
		let (tx, rx) = mpsc::channel(1);
		shutdown_senders.push(tx);
		let watcher = drain_watcher.clone();
		tasks.push(tokio::spawn(async move {
			let _guard = ready_guard;
			let _watcher = watcher;
			policy_sweep_loop(store, reconciler, interval, rx).await
		}));
	}

	{
		let fastpath = fastpath.clone();
		let bind = config.metrics_bind_addr;
		tasks.push(tokio::spawn(async move {
			if let Err(e) = serve_metrics(bind, fastpath).await {
				error!(error = %e, "metrics endpoint exited");
			}
		}));
	}

	{
		let ready = ready.clone();
		let bind = config.readiness_bind_addr;
		tasks.push(tokio::spawn(async move {
			if let Err(e) = serve_readiness(bind, ready).await {
				error!(error = %e, "readiness endpoint exited");
			}
		}));
	}

	// Every clone of `drain_watcher` above is held by its task for the task's
	// entire lifetime; dropping the original here means `start_drain_and_wait`
	// below only resolves once all of them have actually returned, not merely
	// been asked to.
	drop(drain_watcher);

	info!(uptime = ?telemetry::APPLICATION_START_TIME.elapsed(), "relayctl started");
	shutdown.wait().await;
	info!("shutdown requested, draining background tasks");
	for tx in &shutdown_senders {
		let _ = tx.send(()).await;
	}
	// In-flight work (an atomic-restore in particular) must run to completion,
	// not be cancelled mid-flight, so the shutdown-signalled tasks are joined
	// rather than aborted. Only once that join times out do we force-stop
	// whatever is left, which also tears down the stateless HTTP servers that
	// never watch the shutdown channel.
	match tokio::time::timeout(Duration::from_secs(30), drain_trigger.start_drain_and_wait()).await {
		Ok(()) => info!("background tasks drained cleanly"),
		Err(_) => warn!("timed out waiting for background tasks to drain, forcing shutdown"),
	}
	for task in tasks {
		task.abort();
	}
	Ok(())
}

async fn policy_sweep_loop(store: Arc<Store>, reconciler: Arc<Reconciler>, interval: Duration, mut shutdown: mpsc::Receiver<()>) {
	let mut ticker = tokio::time::interval(interval);
	loop {
		tokio::select! {
			_ = ticker.tick() => {
				match store.prune_expired_policy(chrono::Utc::now()).await {
					Ok(0) => {},
					Ok(n) => {
						info!(pruned = n, "swept expired policy entries");
						reconciler.request_reconciliation();
					},
					Err(e) => warn!(error = %e, "policy sweep failed"),
				}
			}
			_ = shutdown.recv() => {
				info!("policy sweep loop shutting down");
				return;
			}
		}
	}
}

#[derive(Clone)]
struct MetricsState {
	fastpath: Arc<FastPathManager>,
}

async fn serve_metrics(bind: std::net::SocketAddr, fastpath: Arc<FastPathManager>) -> anyhow::Result<()> {
	let app = Router::new().route("/metrics", get(metrics_handler)).with_state(MetricsState { fastpath });
	let listener = tokio::net::TcpListener::bind(bind).await.with_context(|| format!("binding metrics endpoint on {bind}"))?;
	axum::serve(listener, app).await.context("metrics endpoint")?;
	Ok(())
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
	let mut registry = Registry::default();
	let snapshot = state.fastpath.traffic_snapshot();

	let active_sources = Gauge::<i64>::default();
	active_sources.set(snapshot.len() as i64);
	registry.register("relayctl_fastpath_active_sources", "Sources with live fast-path counters", active_sources);

	let blocked = Gauge::<i64>::default();
	blocked.set(snapshot.iter().filter(|(_, _, _, is_blocked)| *is_blocked).count() as i64);
	registry.register("relayctl_fastpath_blocked_sources", "Sources currently blocked at the fast path", blocked);

	let mut buf = String::new();
	let _ = encode(&mut buf, &registry);
	(axum::http::StatusCode::OK, buf)
}

async fn serve_readiness(bind: std::net::SocketAddr, ready: Ready) -> anyhow::Result<()> {
	let app = Router::new().route("/readyz", get(move || readyz_handler(ready.clone())));
	let listener = tokio::net::TcpListener::bind(bind).await.with_context(|| format!("binding readiness endpoint on {bind}"))?;
	axum::serve(listener, app).await.context("readiness endpoint")?;
	Ok(())
}

async fn readyz_handler(ready: Ready) -> impl IntoResponse {
	if ready.is_ready() {
		(axum::http::StatusCode::OK, "ready".to_string())
	} else {
		(axum::http::StatusCode::SERVICE_UNAVAILABLE, format!("pending: {:?}", ready.pending()))
	}
}

/// Reads the server's persisted WireGuard-style keypair, generating and
/// persisting one (mode 0600) on first run.
fn load_or_generate_server_key(path: &Path) -> anyhow::Result<TunnelKeyPair> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
	}
	if path.exists() {
		let bytes = std::fs::read(path).with_context(|| format!("reading server key {}", path.display()))?;
		let private: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| anyhow::anyhow!("server key at {} has wrong length {}", path.display(), v.len()))?;
		let secret = x25519_dalek::StaticSecret::from(private);
		let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
		return Ok(TunnelKeyPair { private, public });
	}
	let pair = TunnelKeyPair::generate();
	let mut file = std::fs::File::create(path).with_context(|| format!("creating server key {}", path.display()))?;
	file.write_all(&pair.private)?;
	file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
	info!(path = %path.display(), "generated new server tunnel key");
	Ok(pair)
}
