//! Typed reconciliation failures (§7), so the Reconciler can decide
//! retry-vs-fatal-vs-surface and the audit ring can record a reason.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("reading desired state: {0}")]
	Store(#[from] relayctl_store::StoreError),
	#[error("rule synthesis rejected the desired state: {0}")]
	Synthesis(#[from] relayctl_rules::SynthesisError),
	#[error("staging rule-text to disk: {0}")]
	Staging(#[source] std::io::Error),
	#[error("atomic-restore rejected the rule-set, previous rules remain live: {0}")]
	AtomicApply(#[source] relayctl_exec::ExecError),
	#[error("tunnel peer reconciliation failed: {0}")]
	Tunnel(#[from] relayctl_tunnel::TunnelError),
}

impl ReconcileError {
	/// Short, stable tag for the audit event and for deciding whether a
	/// failure is safe to retry on the next timer tick.
	pub fn step(&self) -> &'static str {
		match self {
			ReconcileError::Store(_) => "snapshot",
			ReconcileError::Synthesis(_) => "synthesize",
			ReconcileError::Staging(_) => "stage",
			ReconcileError::AtomicApply(_) => "atomic-restore",
			ReconcileError::Tunnel(_) => "tunnel-reconcile",
		}
	}
}
