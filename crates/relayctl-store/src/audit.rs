//! Bounded, time-stamped event ring (§4.H). Append is fire-and-forget: the
//! Reconciler never awaits or blocks on it.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

const CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Severity {
	Info,
	Warning,
	Error,
	Success,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEvent {
	pub time: DateTime<Utc>,
	pub severity: Severity,
	pub text: String,
}

/// Newest-first ring, bounded at 100 entries. `push` drops the oldest entry
/// once full rather than growing.
pub struct AuditRing {
	entries: Mutex<VecDeque<AuditEvent>>,
}

impl AuditRing {
	pub fn new() -> Self {
		AuditRing { entries: Mutex::new(VecDeque::with_capacity(CAPACITY)) }
	}

	pub fn push(&self, now: DateTime<Utc>, severity: Severity, text: impl Into<String>) {
		let mut entries = self.entries.lock().expect("audit ring mutex poisoned");
		if entries.len() == CAPACITY {
			entries.pop_back();
		}
		entries.push_front(AuditEvent { time: now, severity, text: text.into() });
	}

	/// Readers take a copy under the lock; no borrowed iterator ever escapes it.
	pub fn snapshot(&self) -> Vec<AuditEvent> {
		self.entries.lock().expect("audit ring mutex poisoned").iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().expect("audit ring mutex poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for AuditRing {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn t(offset_secs: i64) -> DateTime<Utc> {
		DateTime::UNIX_EPOCH + chrono::Duration::seconds(offset_secs)
	}

	#[test]
	fn newest_first_ordering() {
		let ring = AuditRing::new();
		ring.push(t(1), Severity::Info, "first");
		ring.push(t(2), Severity::Success, "second");
		let snap = ring.snapshot();
		assert_eq!(snap[0].text, "second");
		assert_eq!(snap[1].text, "first");
	}

	#[test]
	fn drops_oldest_on_overflow() {
		let ring = AuditRing::new();
		for i in 0..150 {
			ring.push(t(i), Severity::Info, format!("event-{i}"));
		}
		let snap = ring.snapshot();
		assert_eq!(snap.len(), 100);
		assert_eq!(snap[0].text, "event-149");
		assert_eq!(snap.last().unwrap().text, "event-50");
	}
}
