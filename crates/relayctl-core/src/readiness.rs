//! Tracks which background tasks (reconciliation worker, fast-path sampler,
//! policy-expiry sweeper, metrics snapshot timer, ...) still need to finish
//! their initial startup work before the readiness endpoint reports ready.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Registers a dependency that must be marked ready before `pending()` is empty.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().unwrap().is_empty()
	}
}

/// Blocks readiness until dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		let dur = telemetry::APPLICATION_START_TIME.elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking server ready", self.name);
		} else {
			info!(
				"task '{}' complete ({dur:?}), still awaiting {left} tasks",
				self.name
			);
		}
	}
}
