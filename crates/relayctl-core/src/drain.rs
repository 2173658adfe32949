//! Graceful drain support for background tasks.
//!
//! [`DrainTrigger`] starts a drain and waits for every outstanding
//! [`DrainWatcher`] to release its handle. A task holds onto the watcher (or
//! the blocker returned by [`DrainWatcher::wait_for_drain`]) for as long as it
//! is doing work that should not be interrupted mid-reconciliation.

use tokio::sync::{mpsc, watch};

/// Constructs a new drain pair. `DrainTrigger` starts the drain; `DrainWatcher`
/// can be cloned freely and a drain will not complete until every clone (and
/// every blocker it has handed out) has been dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (drained_tx, drained_rx) = mpsc::channel(1);
	(
		DrainTrigger {
			signal_tx,
			drained_rx,
		},
		DrainWatcher {
			signal_rx,
			drained_tx,
		},
	)
}

enum Never {}

pub struct DrainTrigger {
	signal_tx: watch::Sender<bool>,
	drained_rx: mpsc::Receiver<Never>,
}

impl DrainTrigger {
	/// Signals all watchers to begin draining and waits until every one of
	/// them (and every blocker derived from them) has been dropped.
	pub async fn start_drain_and_wait(mut self) {
		let _ = self.signal_tx.send(true);
		match self.drained_rx.recv().await {
			None => {},
			Some(never) => match never {},
		}
	}

	/// Number of outstanding watchers, for diagnostics.
	pub fn count(&self) -> usize {
		self.signal_tx.receiver_count()
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal_rx: watch::Receiver<bool>,
	drained_tx: mpsc::Sender<Never>,
}

impl DrainWatcher {
	/// Resolves once a drain has been signaled, returning a handle that must
	/// be dropped once in-flight work is safe to interrupt.
	pub async fn wait_for_drain(mut self) -> DrainBlocker {
		let _ = self.signal_rx.wait_for(|v| *v).await;
		DrainBlocker(self.drained_tx)
	}

	/// True if a drain has already been signaled, without waiting.
	pub fn is_draining(&self) -> bool {
		*self.signal_rx.borrow()
	}
}

#[must_use = "DrainBlocker should be dropped explicitly to release the drain"]
pub struct DrainBlocker(#[allow(dead_code)] mpsc::Sender<Never>);

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn drain_waits_for_all_watchers() {
		let (trigger, watcher) = new();
		let completed = Arc::new(AtomicUsize::new(0));

		for i in 1..=3u64 {
			let watcher = watcher.clone();
			let completed = completed.clone();
			tokio::spawn(async move {
				let blocker = watcher.wait_for_drain().await;
				tokio::time::sleep(std::time::Duration::from_millis(i * 5)).await;
				completed.fetch_add(1, Ordering::SeqCst);
				drop(blocker);
			});
		}
		drop(watcher);

		tokio::select! {
			_ = tokio::time::sleep(std::time::Duration::from_millis(200)) => panic!("drain timed out"),
			_ = trigger.start_drain_and_wait() => {
				assert_eq!(completed.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn is_draining_reflects_signal_state() {
		let (trigger, watcher) = new();
		assert!(!watcher.is_draining());
		let watcher2 = watcher.clone();
		drop(watcher);
		tokio::spawn(async move {
			trigger.start_drain_and_wait().await;
		});
		let blocker = watcher2.wait_for_drain().await;
		assert!(watcher2.is_draining());
		drop(blocker);
	}
}
