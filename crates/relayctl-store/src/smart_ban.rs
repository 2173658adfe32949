//! Smart-banning effect surface (the defense-settings toggle's observable
//! behavior, left under-specified by the source spec — see Open Questions).
//! Promotes a source to an auto-generated Ban-IP entry once its sampled
//! packet rate has exceeded the active tier's cap for 3 consecutive
//! sampling windows. Pure over a window history so it is testable without a
//! live fast-path sampler.

use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use relayctl_core::model::{DefenseTier, PolicyEntry};

pub const CONSECUTIVE_WINDOWS_REQUIRED: usize = 3;
pub const AUTO_BAN_TTL: Duration = Duration::hours(1);
pub const AUTO_BAN_REASON: &str = "auto:rate";

/// One source's packets-per-second samples across the most recent sampling
/// windows, newest last.
#[derive(Debug, Clone)]
pub struct SourceWindowHistory {
	pub source: Ipv4Addr,
	pub pps_samples: Vec<u64>,
}

/// Sources whose last `CONSECUTIVE_WINDOWS_REQUIRED` samples all exceeded
/// `tier`'s packets-per-second cap.
pub fn sources_exceeding_tier(history: &[SourceWindowHistory], tier: DefenseTier) -> Vec<Ipv4Addr> {
	let (cap, _burst) = tier.rate_limit();
	let cap = u64::from(cap);
	history
		.iter()
		.filter(|h| {
			let tail = h.pps_samples.len().saturating_sub(CONSECUTIVE_WINDOWS_REQUIRED);
			let recent = &h.pps_samples[tail..];
			recent.len() == CONSECUTIVE_WINDOWS_REQUIRED && recent.iter().all(|&pps| pps > cap)
		})
		.map(|h| h.source)
		.collect()
}

pub fn to_ban_entries(sources: &[Ipv4Addr], now: DateTime<Utc>) -> Vec<PolicyEntry> {
	sources
		.iter()
		.map(|&address| PolicyEntry { address, reason: AUTO_BAN_REASON.to_string(), expires_at: Some(now + AUTO_BAN_TTL) })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hist(source: &str, samples: Vec<u64>) -> SourceWindowHistory {
		SourceWindowHistory { source: source.parse().unwrap(), pps_samples: samples }
	}

	#[test]
	fn promotes_after_three_consecutive_breaches() {
		let history = vec![hist("203.0.113.9", vec![100, 400, 400, 400])];
		let banned = sources_exceeding_tier(&history, DefenseTier::Tier2);
		assert_eq!(banned, vec!["203.0.113.9".parse::<Ipv4Addr>().unwrap()]);
	}

	#[test]
	fn does_not_promote_on_two_breaches() {
		let history = vec![hist("203.0.113.9", vec![400, 400, 100])];
		let banned = sources_exceeding_tier(&history, DefenseTier::Tier2);
		assert!(banned.is_empty());
	}

	#[test]
	fn insufficient_history_never_promotes() {
		let history = vec![hist("203.0.113.9", vec![900, 900])];
		let banned = sources_exceeding_tier(&history, DefenseTier::Tier3);
		assert!(banned.is_empty());
	}

	#[test]
	fn ban_entries_carry_auto_rate_reason_and_one_hour_ttl() {
		let now = DateTime::UNIX_EPOCH;
		let entries = to_ban_entries(&["198.51.100.7".parse().unwrap()], now);
		assert_eq!(entries[0].reason, "auto:rate");
		assert_eq!(entries[0].expires_at, Some(now + AUTO_BAN_TTL));
	}
}
