//! The Reconciler (§4.F): the only component that mutates live packet-filter
//! and tunnel state. Everything else stages intent into the store and
//! signals this component to run.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use ipnet::Ipv4Net;
use relayctl_core::model::SynthesisInput;
use relayctl_exec::Executor;
use relayctl_fastpath::FastPathManager;
use relayctl_geo::GeoDb;
use relayctl_store::{AuditRing, Severity, Store};
use relayctl_tunnel::{encode_key, TunnelManager};
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{info, warn};

use crate::error::ReconcileError;

pub struct Reconciler {
	store: Arc<Store>,
	tunnel: TunnelManager,
	fastpath: Arc<FastPathManager>,
	geo: Arc<GeoDb>,
	audit: Arc<AuditRing>,
	executor: Arc<dyn Executor>,
	public_interface: String,
	tunnel_subnet: Ipv4Net,
	tunnel_listen_port: u16,
	management_tcp_ports: Vec<u16>,
	staging_path: PathBuf,
	lock: Mutex<()>,
	pending: AtomicBool,
	notify: Notify,
}

impl Reconciler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		store: Arc<Store>,
		tunnel: TunnelManager,
		fastpath: Arc<FastPathManager>,
		geo: Arc<GeoDb>,
		audit: Arc<AuditRing>,
		executor: Arc<dyn Executor>,
		public_interface: String,
		tunnel_subnet: Ipv4Net,
		tunnel_listen_port: u16,
		management_tcp_ports: Vec<u16>,
		staging_path: PathBuf,
	) -> Self {
		Reconciler {
			store,
			tunnel,
			fastpath,
			geo,
			audit,
			executor,
			public_interface,
			tunnel_subnet,
			tunnel_listen_port,
			management_tcp_ports,
			staging_path,
			lock: Mutex::new(()),
			pending: AtomicBool::new(false),
			notify: Notify::new(),
		}
	}

	/// Called by API handlers after a mutating write. Coalesces: a request
	/// that arrives while a run is already in flight doesn't queue a second
	/// run for itself — it just ensures one more run happens after the
	/// current one finishes.
	pub fn request_reconciliation(&self) {
		self.pending.store(true, Ordering::SeqCst);
		self.notify.notify_one();
	}

	/// Runs `apply_desired_state` whenever woken, until `shutdown` fires.
	pub async fn run_worker(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
		loop {
			tokio::select! {
				_ = self.notify.notified() => {},
				_ = shutdown.recv() => {
					info!("reconciliation worker shutting down");
					return;
				}
			}
			while self.pending.swap(false, Ordering::SeqCst) {
				if let Err(e) = self.apply_desired_state().await {
					warn!(error = %e, step = e.step(), "reconciliation failed");
				}
			}
		}
	}

	/// Serialized behind a single-slot mutex (§5): at most one run executes
	/// at a time, whether triggered by the worker loop or called directly.
	pub async fn apply_desired_state(&self) -> Result<(), ReconcileError> {
		let _guard = self.lock.lock().await;
		let now = Utc::now();
		let result = self.apply_inner(now).await;
		match &result {
			Ok(()) => self.audit.push(now, Severity::Success, "reconciliation applied"),
			Err(e) => self.audit.push(now, Severity::Error, format!("reconciliation failed at {}: {e}", e.step())),
		}
		result
	}

	async fn apply_inner(&self, now: chrono::DateTime<Utc>) -> Result<(), ReconcileError> {
		self.store.prune_expired_policy(now).await?;

		let snapshot = self.store.snapshot().await?;
		let mut policy = snapshot.policy.clone();
		policy.prune_expired(now);

		let origin_addresses: HashMap<uuid::Uuid, Ipv4Addr> = snapshot.origins.iter().map(|o| (o.id, o.tunnel_address)).collect();

		let input = SynthesisInput {
			services: snapshot.services.clone(),
			origin_addresses: origin_addresses.clone(),
			policy: policy.clone(),
			settings: snapshot.settings.clone(),
			tunnel_subnet: self.tunnel_subnet,
			public_interface: self.public_interface.clone(),
			management_tcp_ports: self.management_tcp_ports.clone(),
			tunnel_listen_port: self.tunnel_listen_port,
		};
		let rule_text = relayctl_rules::synthesize(&input)?;

		let geo_allow_cidrs: Vec<Ipv4Net> = snapshot.settings.geo_allow_countries.iter().flat_map(|c| self.geo.cidrs_for(*c)).collect();
		let foreign_allow_cidrs: Vec<Ipv4Net> = policy.allow_foreign.iter().flat_map(|c| self.geo.cidrs_for(*c)).collect();
		let ipset_text = relayctl_rules::synthesize_ipsets(&policy, &geo_allow_cidrs, &foreign_allow_cidrs);

		if let Some(parent) = self.staging_path.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(ReconcileError::Staging)?;
		}
		tokio::fs::write(&self.staging_path, &rule_text).await.map_err(ReconcileError::Staging)?;
		let ipset_staging_path = self.staging_path.with_file_name("ipsets.restore");
		tokio::fs::write(&ipset_staging_path, &ipset_text).await.map_err(ReconcileError::Staging)?;

		// Populate the kernel ipsets GAME_GUARD's `--match-set` rules reference
		// before loading those rules, or the restore would either reject an
		// undefined set or silently never match anything against an empty one.
		let ipset_path = ipset_staging_path.to_string_lossy().into_owned();
		self.executor.execute_default(&["ipset", "restore", "-file", &ipset_path]).await.map_err(ReconcileError::AtomicApply)?;

		let path = self.staging_path.to_string_lossy().into_owned();
		self.executor.execute_default(&["iptables-restore", "--noflush", &path]).await.map_err(ReconcileError::AtomicApply)?;
		info!(bytes = rule_text.len(), "rule-set applied atomically");

		self.reconcile_tunnel_peers(&snapshot).await?;

		self.fastpath.apply_geo_allow(&self.geo, &snapshot.settings.geo_allow_countries);
		for entry in &policy.ban_ip {
			let ttl = entry.expires_at.and_then(|exp| (exp - now).to_std().ok());
			self.fastpath.block(entry.address, entry.reason.clone(), ttl);
		}

		Ok(())
	}

	async fn reconcile_tunnel_peers(&self, snapshot: &relayctl_store::Snapshot) -> Result<(), ReconcileError> {
		let origin_addresses: HashMap<uuid::Uuid, Ipv4Addr> = snapshot.origins.iter().map(|o| (o.id, o.tunnel_address)).collect();

		let desired: Vec<(String, Ipv4Addr)> = snapshot
			.peers
			.iter()
			.filter_map(|p| origin_addresses.get(&p.origin_id).map(|addr| (encode_key(&p.public_key), *addr)))
			.collect();
		let desired_keys: HashSet<&str> = desired.iter().map(|(k, _)| k.as_str()).collect();

		for (key, addr) in &desired {
			self.tunnel.add_peer(key, *addr).await?;
		}

		let actual = self.tunnel.peers().await?;
		for peer in &actual {
			if !desired_keys.contains(peer.public_key.as_str()) {
				self.tunnel.remove_peer(&peer.public_key).await?;
				info!(peer = %peer.public_key, "removed orphaned tunnel peer");
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use relayctl_core::model::{Origin, Peer};
	use relayctl_exec::mock::MockExecutor;
	use relayctl_exec::Os;
	use relayctl_fastpath::{FastPathManager, SimulatedFastPath};
	use relayctl_geo::GeoDb;
	use relayctl_store::{AuditRing, Store};
	use relayctl_tunnel::TunnelManager;
	use uuid::Uuid;

	use super::*;

	async fn harness() -> (Reconciler, Arc<MockExecutor>, tempfile::TempDir) {
		let store = Arc::new(Store::connect_in_memory().await.unwrap());
		let executor = Arc::new(MockExecutor::new(Os::Linux));
		// `wg show <iface> dump` with no peers.
		executor.push_ok("");
		let tunnel = TunnelManager::new("wg-relay0", executor.clone() as Arc<dyn Executor>);
		let fastpath = Arc::new(FastPathManager::new(Box::new(SimulatedFastPath::default())));
		let geo = GeoDb::empty();
		let audit = Arc::new(AuditRing::new());
		let dir = tempfile::tempdir().unwrap();
		let staging_path = dir.path().join("staging/rules.txt");

		let r = Reconciler::new(
			store,
			tunnel,
			fastpath,
			geo,
			audit,
			executor.clone() as Arc<dyn Executor>,
			"eth0".to_string(),
			"10.200.0.0/24".parse().unwrap(),
			51820,
			vec![22, 8443],
			staging_path,
		);
		(r, executor, dir)
	}

	#[tokio::test]
	async fn empty_state_reconciles_cleanly_and_stages_rules() {
		let (reconciler, _exec, _dir) = harness().await;
		reconciler.apply_desired_state().await.unwrap();
		let text = tokio::fs::read_to_string(&reconciler.staging_path).await.unwrap();
		assert!(text.contains("*filter"));
		assert!(text.contains("COMMIT"));
	}

	#[tokio::test]
	async fn ipset_restore_runs_before_iptables_restore_and_stages_every_set() {
		let (reconciler, exec, _dir) = harness().await;
		reconciler.apply_desired_state().await.unwrap();

		let ipset_path = reconciler.staging_path.with_file_name("ipsets.restore");
		let ipset_text = tokio::fs::read_to_string(&ipset_path).await.unwrap();
		for name in ["ban_set", "geo_allow_set", "foreign_allow_set", "vpn_set", "tor_set"] {
			assert!(ipset_text.contains(&format!("create {name} ")), "missing create for {name}");
		}

		let calls = exec.calls.lock().unwrap();
		let ipset_pos = calls.iter().position(|argv| argv.first().map(String::as_str) == Some("ipset")).expect("ipset restore was never invoked");
		let iptables_pos = calls.iter().position(|argv| argv.first().map(String::as_str) == Some("iptables-restore")).expect("iptables-restore was never invoked");
		assert!(ipset_pos < iptables_pos, "ipsets must be populated before the filter rules that reference them load");
	}

	#[tokio::test]
	async fn applying_twice_is_idempotent() {
		let (reconciler, _exec, _dir) = harness().await;
		reconciler.apply_desired_state().await.unwrap();
		let first = tokio::fs::read_to_string(&reconciler.staging_path).await.unwrap();
		reconciler.apply_desired_state().await.unwrap();
		let second = tokio::fs::read_to_string(&reconciler.staging_path).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn atomic_apply_failure_is_surfaced_and_audited() {
		let (reconciler, exec, _dir) = harness().await;
		exec.push_ok(""); // ipset restore
		exec.push_err(relayctl_exec::ExecError::NonZeroExit {
			program: "iptables-restore".to_string(),
			status: 1,
			output: "bad rule".into(),
		});
		let err = reconciler.apply_desired_state().await.unwrap_err();
		assert!(matches!(err, ReconcileError::AtomicApply(_)));
		let snap = reconciler.audit.snapshot();
		assert!(snap[0].text.contains("atomic-restore"));
	}

	#[tokio::test]
	async fn tier_escalation_produces_exactly_one_reconciliation_audit_entry() {
		let (reconciler, _exec, _dir) = harness().await;
		let before = reconciler.audit.len();
		let mut settings = reconciler.store.defense_settings().await.unwrap();
		settings.tier = relayctl_core::model::DefenseTier::Tier3;
		reconciler.store.set_defense_settings(&settings).await.unwrap();
		reconciler.apply_desired_state().await.unwrap();
		assert_eq!(reconciler.audit.len(), before + 1);
	}

	#[tokio::test]
	async fn new_origin_peer_is_added_and_orphan_is_removed() {
		let (reconciler, exec, _dir) = harness().await;
		let origin = Origin { id: Uuid::new_v4(), name: "o1".to_string(), tunnel_address: "10.200.0.2".parse().unwrap() };
		let peer = Peer { origin_id: origin.id, public_key: [9; 32], private_key: [1; 32], last_handshake: None, rx_bytes: 0, tx_bytes: 0 };
		reconciler.store.insert_origin(&origin, &peer).await.unwrap();

		// add_peer, then the `wg show dump` performed inside reconcile_tunnel_peers.
		exec.push_ok("");
		exec.push_ok("");
		reconciler.apply_desired_state().await.unwrap();

		let calls = exec.calls.lock().unwrap();
		assert!(calls.iter().any(|argv| argv.contains(&"set".to_string()) && argv.contains(&"allowed-ips".to_string())));
	}
}
