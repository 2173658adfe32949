//! Policy Evaluator (§4.G): a pure, side-effect-free query over the
//! declarative tables plus a fast-path block lookup supplied by the caller.
//! No I/O here — callers (the Reconciler) gather the inputs.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;

use relayctl_core::model::{DefenseSettings, PolicyTables};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStatus {
	Allowed,
	Blocked,
	Neutral,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
	pub status: PolicyStatus,
	pub reason: &'static str,
	pub remaining_ttl: Option<Duration>,
}

/// What the Reconciler observed in the fast-path `blocked_set` for this
/// source, if anything. Kept here rather than depending on the fast-path
/// crate directly, to avoid a dependency cycle.
#[derive(Debug, Clone)]
pub struct FastPathBlock {
	pub remaining_ttl: Duration,
}

/// Implements the §4.G chain, extended per the VPN/TOR supplement: Allow-IP
/// → Ban-IP → VPN/TOR (if toggled on) → fast-path active block → neutral.
/// Geo evaluation is deliberately absent — it happens inline in the
/// synthesized filter, not here (§8 scenario 5).
#[allow(clippy::too_many_arguments)]
pub fn evaluate(
	addr: Ipv4Addr,
	now: DateTime<Utc>,
	tables: &PolicyTables,
	settings: &DefenseSettings,
	vpn_ranges: &[Ipv4Net],
	tor_ranges: &[Ipv4Net],
	fastpath_block: Option<&FastPathBlock>,
) -> Evaluation {
	if tables.allow_ip.iter().any(|e| e.address == addr && !e.is_expired(now)) {
		return Evaluation { status: PolicyStatus::Allowed, reason: "manual-whitelist", remaining_ttl: None };
	}
	if tables.ban_ip.iter().any(|e| e.address == addr && !e.is_expired(now)) {
		return Evaluation { status: PolicyStatus::Blocked, reason: "blacklist", remaining_ttl: None };
	}
	if settings.block_vpn && vpn_ranges.iter().any(|n| n.contains(&addr)) {
		return Evaluation { status: PolicyStatus::Blocked, reason: "vpn-range", remaining_ttl: None };
	}
	if settings.block_tor && tor_ranges.iter().any(|n| n.contains(&addr)) {
		return Evaluation { status: PolicyStatus::Blocked, reason: "tor-range", remaining_ttl: None };
	}
	if let Some(block) = fastpath_block {
		return Evaluation { status: PolicyStatus::Blocked, reason: "active-block", remaining_ttl: Some(block.remaining_ttl) };
	}
	Evaluation { status: PolicyStatus::Neutral, reason: "not-in-any-deny-list", remaining_ttl: None }
}

#[cfg(test)]
mod tests {
	use relayctl_core::model::PolicyEntry;

	use super::*;

	fn now() -> DateTime<Utc> {
		DateTime::UNIX_EPOCH + chrono::Duration::seconds(1_000)
	}

	#[test]
	fn ban_with_ttl_then_expiry_transitions_to_neutral() {
		let addr: Ipv4Addr = "198.51.100.7".parse().unwrap();
		let mut tables = PolicyTables::default();
		tables.ban_ip.push(PolicyEntry { address: addr, reason: "manual".into(), expires_at: Some(now() + chrono::Duration::seconds(60)) });
		let settings = DefenseSettings::default();

		let during = evaluate(addr, now(), &tables, &settings, &[], &[], None);
		assert_eq!(during.status, PolicyStatus::Blocked);
		assert_eq!(during.reason, "blacklist");

		let after = now() + chrono::Duration::seconds(61);
		tables.prune_expired(after);
		let post = evaluate(addr, after, &tables, &settings, &[], &[], None);
		assert_eq!(post.status, PolicyStatus::Neutral);
	}

	#[test]
	fn geo_allow_without_match_still_neutral() {
		// The evaluator never consults geography directly — only the
		// synthesized filter does (§8 scenario 5).
		let addr: Ipv4Addr = "203.0.113.9".parse().unwrap();
		let tables = PolicyTables::default();
		let settings = DefenseSettings::default();
		let eval = evaluate(addr, now(), &tables, &settings, &[], &[], None);
		assert_eq!(eval.status, PolicyStatus::Neutral);
	}

	#[test]
	fn allow_ip_wins_over_ban_ip() {
		let addr: Ipv4Addr = "203.0.113.1".parse().unwrap();
		let mut tables = PolicyTables::default();
		tables.allow_ip.push(PolicyEntry { address: addr, reason: "vip".into(), expires_at: None });
		tables.ban_ip.push(PolicyEntry { address: addr, reason: "stale-ban".into(), expires_at: None });
		let settings = DefenseSettings::default();
		let eval = evaluate(addr, now(), &tables, &settings, &[], &[], None);
		assert_eq!(eval.status, PolicyStatus::Allowed);
	}

	#[test]
	fn fastpath_block_reports_remaining_ttl() {
		let addr: Ipv4Addr = "203.0.113.2".parse().unwrap();
		let tables = PolicyTables::default();
		let settings = DefenseSettings::default();
		let block = FastPathBlock { remaining_ttl: Duration::from_secs(42) };
		let eval = evaluate(addr, now(), &tables, &settings, &[], &[], Some(&block));
		assert_eq!(eval.status, PolicyStatus::Blocked);
		assert_eq!(eval.remaining_ttl, Some(Duration::from_secs(42)));
	}

	#[test]
	fn vpn_block_only_applies_when_toggle_enabled() {
		let addr: Ipv4Addr = "45.32.0.1".parse().unwrap();
		let tables = PolicyTables::default();
		let mut settings = DefenseSettings::default();
		let vpn_ranges = vec!["45.32.0.0/16".parse().unwrap()];

		settings.block_vpn = false;
		let eval = evaluate(addr, now(), &tables, &settings, &vpn_ranges, &[], None);
		assert_eq!(eval.status, PolicyStatus::Neutral);

		settings.block_vpn = true;
		let eval = evaluate(addr, now(), &tables, &settings, &vpn_ranges, &[], None);
		assert_eq!(eval.status, PolicyStatus::Blocked);
		assert_eq!(eval.reason, "vpn-range");
	}
}
