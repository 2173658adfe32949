//! Declarative data model (§3): the shapes the admin-facing store persists
//! and the rule synthesizer, reconciler, and policy evaluator consume. Kept
//! free of any I/O so the pure components (rule synthesis, policy
//! evaluation) can depend on it without pulling in storage or networking.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use uuid::Uuid;

use crate::net::{CountryCode, Protocol};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Origin {
	pub id: Uuid,
	pub name: String,
	/// Unique within the tunnel subnet.
	pub tunnel_address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
	pub origin_id: Uuid,
	pub public_key: [u8; 32],
	pub private_key: [u8; 32],
	pub last_handshake: Option<DateTime<Utc>>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
}

/// One public-port-range-to-private-port-range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRule {
	pub protocol: Protocol,
	pub public_start: u16,
	pub public_end: u16,
	pub private_start: u16,
	pub private_end: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRuleError {
	/// Public is a range but private is a single port, or vice versa, with
	/// unequal lengths — the operator must specify both ends.
	UnequalRangeLengths,
	InvalidRange,
}

impl PortRule {
	pub fn public_len(&self) -> u32 {
		u32::from(self.public_end) - u32::from(self.public_start) + 1
	}

	pub fn private_len(&self) -> u32 {
		u32::from(self.private_end) - u32::from(self.private_start) + 1
	}

	pub fn is_range(&self) -> bool {
		self.public_start != self.public_end
	}

	pub fn validate(&self) -> Result<(), PortRuleError> {
		if self.public_end < self.public_start || self.private_end < self.private_start {
			return Err(PortRuleError::InvalidRange);
		}
		if self.public_len() != self.private_len() {
			return Err(PortRuleError::UnequalRangeLengths);
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Service {
	pub id: Uuid,
	pub name: String,
	pub origin_id: Uuid,
	pub rules: Vec<PortRule>,
}

/// One entry in the Allow-IP, Ban-IP, or Allow-Foreign table. Allow-Foreign
/// entries use `subject` to carry a country code instead of an address.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PolicyEntry {
	pub address: Ipv4Addr,
	pub reason: String,
	pub expires_at: Option<DateTime<Utc>>,
}

impl PolicyEntry {
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		matches!(self.expires_at, Some(exp) if exp <= now)
	}
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PolicyTables {
	pub allow_ip: Vec<PolicyEntry>,
	pub ban_ip: Vec<PolicyEntry>,
	/// Per-country override granting non-allowed-country sources passage.
	pub allow_foreign: Vec<CountryCode>,
	/// Known VPN exit-node ranges, consulted when `DefenseSettings::block_vpn` is set.
	pub vpn_ranges: Vec<Ipv4Net>,
	/// Known TOR exit-node ranges, consulted when `DefenseSettings::block_tor` is set.
	pub tor_ranges: Vec<Ipv4Net>,
}

impl PolicyTables {
	/// Drops entries whose expiry has passed. Expired entries are treated as
	/// absent for every purpose before this is called on the next
	/// reconciliation.
	pub fn prune_expired(&mut self, now: DateTime<Utc>) {
		self.allow_ip.retain(|e| !e.is_expired(now));
		self.ban_ip.retain(|e| !e.is_expired(now));
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum DefenseTier {
	Tier1,
	Tier2,
	Tier3,
}

impl DefenseTier {
	/// (packets-per-second cap, burst) for the per-rule game-port limiter.
	pub fn rate_limit(&self) -> (u32, u32) {
		match self {
			DefenseTier::Tier1 => (300, 600),
			DefenseTier::Tier2 => (250, 500),
			DefenseTier::Tier3 => (100, 200),
		}
	}

	/// Tier 3 short-circuits: only geo-allowed sources reach the per-rule limiter.
	pub fn drop_all_foreign(&self) -> bool {
		matches!(self, DefenseTier::Tier3)
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DefenseSettings {
	pub enabled: bool,
	pub syn_cookie: bool,
	pub block_vpn: bool,
	pub block_tor: bool,
	pub geo_allow_countries: Vec<CountryCode>,
	pub tier: DefenseTier,
	pub fastpath_enabled: bool,
}

impl Default for DefenseSettings {
	fn default() -> Self {
		DefenseSettings {
			enabled: true,
			syn_cookie: true,
			block_vpn: false,
			block_tor: false,
			geo_allow_countries: Vec::new(),
			tier: DefenseTier::Tier2,
			fastpath_enabled: true,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdminCredentials {
	pub username: String,
	pub password_hash: String,
	pub failed_attempts: u32,
	pub lockout_until: Option<DateTime<Utc>>,
}

/// Everything the rule synthesizer needs, gathered into one snapshot so it
/// stays a pure function of its arguments.
#[derive(Debug, Clone)]
pub struct SynthesisInput {
	pub services: Vec<Service>,
	/// origin_id -> tunnel address, needed to resolve DNAT targets.
	pub origin_addresses: std::collections::HashMap<Uuid, Ipv4Addr>,
	pub policy: PolicyTables,
	pub settings: DefenseSettings,
	pub tunnel_subnet: Ipv4Net,
	pub public_interface: String,
	/// Management TCP ports (SSH, API) always accepted on INPUT.
	pub management_tcp_ports: Vec<u16>,
	/// Tunnel listen UDP port, always accepted on INPUT.
	pub tunnel_listen_port: u16,
}
