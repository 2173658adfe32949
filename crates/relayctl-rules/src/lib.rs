//! Pure function from (services, policy, settings, defense tier) to a
//! textual atomic-restore blob for the packet filter. No I/O, no clock, no
//! randomness: identical inputs produce byte-identical output.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use relayctl_core::model::{PolicyTables, PortRuleError, Service, SynthesisInput};
use relayctl_core::net::Protocol;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SynthesisError {
	#[error("service {service} rule for public ports {public_start}-{public_end}: {reason}")]
	InvalidPortRule {
		service: String,
		public_start: u16,
		public_end: u16,
		reason: &'static str,
	},
	#[error("public port ranges overlap on protocol {protocol}: {a_service} and {b_service} both claim port {port}")]
	OverlappingPublicPorts {
		protocol: Protocol,
		port: u16,
		a_service: String,
		b_service: String,
	},
	#[error("service {0} references unknown origin")]
	UnknownOrigin(String),
}

const GAME_PRE_CHAIN: &str = "GAME_PRE";
const GAME_GUARD_CHAIN: &str = "GAME_GUARD";

/// Synthesizes the three-table atomic-restore blob. Deterministic: sorts
/// services by id and each service's rules by (protocol, public_start)
/// before emitting anything, so the same declarative state always produces
/// the same bytes.
pub fn synthesize(input: &SynthesisInput) -> Result<String, SynthesisError> {
	let mut services = input.services.clone();
	services.sort_by_key(|s| s.id);
	for svc in &mut services {
		svc.rules.sort_by_key(|r| (r.protocol, r.public_start));
	}

	validate(&services, &input.origin_addresses)?;

	let mut out = String::new();
	out.push_str(&build_mangle(&services, &input.policy, &input.settings, &input.public_interface));
	out.push_str(&build_nat(&services, &input.origin_addresses, &input.tunnel_subnet.to_string(), &input.public_interface));
	out.push_str(&build_filter(&input.settings, &input.public_interface, &input.management_tcp_ports, input.tunnel_listen_port));
	Ok(out)
}

/// Builds the `ipset restore` blob that must be applied before the
/// synthesized GAME_GUARD chain is loaded — every `--match-set` name it
/// references has to exist (and carry current membership) or the restore
/// either rejects the ruleset or every lookup against it silently misses.
/// `geo_allow_cidrs` and `foreign_allow_cidrs` are the already-resolved CIDR
/// blocks for `settings.geo_allow_countries` and `policy.allow_foreign`
/// respectively; geography resolution lives with the caller, which holds the
/// `GeoDb`, not here.
pub fn synthesize_ipsets(policy: &PolicyTables, geo_allow_cidrs: &[Ipv4Net], foreign_allow_cidrs: &[Ipv4Net]) -> String {
	let mut lines = Vec::new();

	let mut ips: Vec<Ipv4Addr> = policy.ban_ip.iter().map(|e| e.address).collect();
	ips.sort_unstable();
	push_ip_set(&mut lines, "ban_set", &ips);

	let mut geo_allow = geo_allow_cidrs.to_vec();
	geo_allow.sort_unstable();
	push_net_set(&mut lines, "geo_allow_set", &geo_allow);

	let mut foreign_allow = foreign_allow_cidrs.to_vec();
	foreign_allow.sort_unstable();
	push_net_set(&mut lines, "foreign_allow_set", &foreign_allow);

	let mut vpn = policy.vpn_ranges.clone();
	vpn.sort_unstable();
	push_net_set(&mut lines, "vpn_set", &vpn);

	let mut tor = policy.tor_ranges.clone();
	tor.sort_unstable();
	push_net_set(&mut lines, "tor_set", &tor);

	lines.join("\n") + "\n"
}

fn push_ip_set(lines: &mut Vec<String>, name: &str, members: &[Ipv4Addr]) {
	lines.push(format!("create {name} hash:ip family inet hashsize 1024 maxelem 65536 -exist"));
	lines.push(format!("flush {name}"));
	for ip in members {
		lines.push(format!("add {name} {ip}"));
	}
}

fn push_net_set(lines: &mut Vec<String>, name: &str, members: &[Ipv4Net]) {
	lines.push(format!("create {name} hash:net family inet hashsize 1024 maxelem 65536 -exist"));
	lines.push(format!("flush {name}"));
	for net in members {
		lines.push(format!("add {name} {net}"));
	}
}

fn validate(services: &[Service], origins: &HashMap<Uuid, Ipv4Addr>) -> Result<(), SynthesisError> {
	for svc in services {
		if !origins.contains_key(&svc.origin_id) {
			return Err(SynthesisError::UnknownOrigin(svc.name.clone()));
		}
		for rule in &svc.rules {
			if let Err(e) = rule.validate() {
				let reason = match e {
					PortRuleError::UnequalRangeLengths => {
						"public and private ranges must have equal length (range-to-single mapping is invalid)"
					},
					PortRuleError::InvalidRange => "end port must not be less than start port",
				};
				return Err(SynthesisError::InvalidPortRule {
					service: svc.name.clone(),
					public_start: rule.public_start,
					public_end: rule.public_end,
					reason,
				});
			}
		}
	}

	// Pairwise disjoint public ranges, per protocol, across all services.
	let mut claims: Vec<(Protocol, u16, u16, &str)> = Vec::new();
	for svc in services {
		for rule in &svc.rules {
			claims.push((rule.protocol, rule.public_start, rule.public_end, svc.name.as_str()));
		}
	}
	claims.sort_by_key(|(p, s, _, _)| (*p, *s));
	for window in claims.windows(2) {
		let (proto_a, _, end_a, name_a) = window[0];
		let (proto_b, start_b, _, name_b) = window[1];
		if proto_a == proto_b && start_b <= end_a {
			return Err(SynthesisError::OverlappingPublicPorts {
				protocol: proto_a,
				port: start_b,
				a_service: name_a.to_string(),
				b_service: name_b.to_string(),
			});
		}
	}
	Ok(())
}

fn ports_by_protocol(services: &[Service], protocol: Protocol) -> Vec<String> {
	services
		.iter()
		.flat_map(|s| s.rules.iter())
		.filter(|r| r.protocol == protocol)
		.map(|r| {
			if r.is_range() {
				format!("{}:{}", r.public_start, r.public_end)
			} else {
				r.public_start.to_string()
			}
		})
		.collect()
}

fn build_mangle(services: &[Service], policy: &PolicyTables, settings: &relayctl_core::model::DefenseSettings, public_if: &str) -> String {
	let mut lines = Vec::new();
	lines.push("*mangle".to_string());
	lines.push(":PREROUTING ACCEPT [0:0]".to_string());
	lines.push(format!(":{GAME_PRE_CHAIN} - [0:0]"));
	lines.push(format!(":{GAME_GUARD_CHAIN} - [0:0]"));

	if settings.enabled {
		lines.push("-A PREROUTING -m conntrack --ctstate INVALID -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp --tcp-flags SYN,FIN SYN,FIN -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp --tcp-flags SYN,RST SYN,RST -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp --tcp-flags FIN,RST FIN,RST -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp --tcp-flags ALL NONE -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp --tcp-flags FIN,PSH,URG FIN,PSH,URG -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp -m conntrack --ctstate NEW -m tcp ! --syn -j DROP".to_string());
		lines.push("-A PREROUTING -p tcp -m conntrack --ctstate NEW -m tcpmss ! --mss 536:65535 -j DROP".to_string());
		lines.push("-A PREROUTING -f -j DROP".to_string());
	}

	let tcp_ports = ports_by_protocol(services, Protocol::Tcp);
	let udp_ports = ports_by_protocol(services, Protocol::Udp);
	if !tcp_ports.is_empty() {
		lines.push(format!(
			"-A PREROUTING -i {public_if} -p tcp -m multiport --dports {} -j {GAME_PRE_CHAIN}",
			tcp_ports.join(",")
		));
	}
	if !udp_ports.is_empty() {
		lines.push(format!(
			"-A PREROUTING -i {public_if} -p udp -m multiport --dports {} -j {GAME_PRE_CHAIN}",
			udp_ports.join(",")
		));
	}

	lines.push(format!("-A {GAME_PRE_CHAIN} -j {GAME_GUARD_CHAIN}"));

	build_game_guard(&mut lines, policy, settings);
	build_game_pre_limiter(&mut lines, services, settings);

	lines.push("COMMIT".to_string());
	lines.push(String::new());
	lines.join("\n") + "\n"
}

fn build_game_guard(lines: &mut Vec<String>, policy: &relayctl_core::model::PolicyTables, settings: &relayctl_core::model::DefenseSettings) {
	let _ = policy;
	if settings.tier.drop_all_foreign() {
		// Tier 3: top-of-chain short-circuit — anything not geo-allowed drops
		// before the ban-set check even runs.
		lines.push(format!("-A {GAME_GUARD_CHAIN} ! -m set --match-set geo_allow_set src -j DROP"));
	}
	lines.push(format!("-A {GAME_GUARD_CHAIN} -m set --match-set ban_set src -j DROP"));
	if settings.block_vpn {
		lines.push(format!("-A {GAME_GUARD_CHAIN} -m set --match-set vpn_set src -j DROP"));
	}
	if settings.block_tor {
		lines.push(format!("-A {GAME_GUARD_CHAIN} -m set --match-set tor_set src -j DROP"));
	}
	lines.push(format!("-A {GAME_GUARD_CHAIN} -m set --match-set geo_allow_set src -j RETURN"));
	lines.push(format!("-A {GAME_GUARD_CHAIN} -m set --match-set foreign_allow_set src -j RETURN"));
	lines.push(format!("-A {GAME_GUARD_CHAIN} -j DROP"));
}

fn build_game_pre_limiter(lines: &mut Vec<String>, services: &[Service], settings: &relayctl_core::model::DefenseSettings) {
	let (tier_cap, tier_burst) = settings.tier.rate_limit();
	for svc in services {
		for rule in &svc.rules {
			let port_spec = if rule.is_range() {
				format!("{}:{}", rule.public_start, rule.public_end)
			} else {
				rule.public_start.to_string()
			};
			let limiter_name = format!("{}_{}", svc.name, rule.public_start);
			lines.push(format!(
				"-A {GAME_PRE_CHAIN} -p {} --dport {port_spec} -m hashlimit --hashlimit-name {limiter_name} --hashlimit-above {tier_cap}/sec --hashlimit-burst {tier_burst} --hashlimit-mode srcip,dstport -j DROP",
				rule.protocol
			));
			lines.push(format!("-A {GAME_PRE_CHAIN} -p {} --dport {port_spec} -j RETURN", rule.protocol));
		}
	}
}

fn build_nat(services: &[Service], origins: &HashMap<Uuid, Ipv4Addr>, tunnel_subnet: &str, public_if: &str) -> String {
	let mut lines = Vec::new();
	lines.push("*nat".to_string());
	lines.push(":PREROUTING ACCEPT [0:0]".to_string());
	lines.push(":POSTROUTING ACCEPT [0:0]".to_string());

	for svc in services {
		let origin_addr = origins.get(&svc.origin_id).expect("validated above");
		for rule in &svc.rules {
			let dport = if rule.is_range() {
				format!("{}:{}", rule.public_start, rule.public_end)
			} else {
				rule.public_start.to_string()
			};
			let dest = if rule.is_range() {
				format!("{origin_addr}:{}-{}", rule.private_start, rule.private_end)
			} else {
				format!("{origin_addr}:{}", rule.private_start)
			};
			lines.push(format!(
				"-A PREROUTING -i {public_if} -p {} --dport {dport} -j DNAT --to-destination {dest}",
				rule.protocol
			));
		}
	}

	lines.push(format!("-A POSTROUTING -s {tunnel_subnet} -o {public_if} -j MASQUERADE"));
	lines.push("COMMIT".to_string());
	lines.push(String::new());
	lines.join("\n") + "\n"
}

fn build_filter(settings: &relayctl_core::model::DefenseSettings, public_if: &str, management_tcp_ports: &[u16], tunnel_listen_port: u16) -> String {
	let mut lines = Vec::new();
	lines.push("*filter".to_string());
	lines.push(":INPUT DROP [0:0]".to_string());
	lines.push(":FORWARD DROP [0:0]".to_string());
	lines.push(":OUTPUT ACCEPT [0:0]".to_string());

	lines.push("-A INPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT".to_string());
	lines.push("-A INPUT -i lo -j ACCEPT".to_string());
	let mut ports = management_tcp_ports.to_vec();
	ports.sort_unstable();
	for port in ports {
		lines.push(format!("-A INPUT -p tcp --dport {port} -j ACCEPT"));
	}
	lines.push(format!("-A INPUT -p udp --dport {tunnel_listen_port} -j ACCEPT"));
	lines.push("-A INPUT -p icmp --icmp-type echo-request -m hashlimit --hashlimit-name icmp_echo --hashlimit-above 5/sec --hashlimit-burst 10 -j DROP".to_string());
	lines.push("-A INPUT -p tcp --tcp-flags RST RST -m hashlimit --hashlimit-name rst_flood --hashlimit-above 10/sec --hashlimit-burst 20 -j DROP".to_string());
	lines.push("-A INPUT -p tcp --syn -m connlimit --connlimit-above 64 --connlimit-mask 32 -j DROP".to_string());

	// Non-negotiable: omission regresses outbound connectivity.
	lines.push("-A OUTPUT -m conntrack --ctstate NEW,ESTABLISHED,RELATED -j ACCEPT".to_string());

	lines.push(format!("-A FORWARD -i {public_if} -m conntrack --ctstate NEW,ESTABLISHED,RELATED -j ACCEPT"));
	lines.push(format!("-A FORWARD -o {public_if} -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT"));

	let _ = settings;
	lines.push("COMMIT".to_string());
	lines.push(String::new());
	lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use relayctl_core::model::{DefenseSettings, DefenseTier, PolicyTables, PortRule};
	use relayctl_core::net::Protocol;
	use uuid::Uuid;

	use super::*;

	fn svc(name: &str, origin_id: Uuid, rules: Vec<PortRule>) -> Service {
		Service {
			id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
			name: name.to_string(),
			origin_id,
			rules,
		}
	}

	fn base_input() -> SynthesisInput {
		SynthesisInput {
			services: Vec::new(),
			origin_addresses: HashMap::new(),
			policy: PolicyTables::default(),
			settings: DefenseSettings::default(),
			tunnel_subnet: "10.200.0.0/24".parse().unwrap(),
			public_interface: "eth0".to_string(),
			management_tcp_ports: vec![22, 8443],
			tunnel_listen_port: 51820,
		}
	}

	#[test]
	fn deterministic_for_identical_inputs() {
		let o1 = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"O1");
		let mut input = base_input();
		input.origin_addresses.insert(o1, "10.200.0.2".parse().unwrap());
		input.services = vec![svc(
			"A",
			o1,
			vec![PortRule {
				protocol: Protocol::Udp,
				public_start: 20001,
				public_end: 20001,
				private_start: 20001,
				private_end: 20001,
			}],
		)];

		let a = synthesize(&input).unwrap();
		let b = synthesize(&input).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn disjoint_single_port_rules_produce_exact_dnat_lines() {
		let o1 = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"O1");
		let o2 = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"O2");
		let mut input = base_input();
		input.origin_addresses.insert(o1, "10.200.0.2".parse().unwrap());
		input.origin_addresses.insert(o2, "10.200.0.3".parse().unwrap());
		input.services = vec![
			svc(
				"A",
				o1,
				vec![PortRule {
					protocol: Protocol::Udp,
					public_start: 20001,
					public_end: 20001,
					private_start: 20001,
					private_end: 20001,
				}],
			),
			svc(
				"B",
				o2,
				vec![PortRule {
					protocol: Protocol::Udp,
					public_start: 20011,
					public_end: 20011,
					private_start: 20001,
					private_end: 20001,
				}],
			),
		];

		let out = synthesize(&input).unwrap();
		assert!(out.contains("-A PREROUTING -i eth0 -p udp --dport 20001 -j DNAT --to-destination 10.200.0.2:20001"));
		assert!(out.contains("-A PREROUTING -i eth0 -p udp --dport 20011 -j DNAT --to-destination 10.200.0.3:20001"));
	}

	#[test]
	fn range_rule_produces_single_range_dnat() {
		let o1 = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"O1");
		let mut input = base_input();
		input.origin_addresses.insert(o1, "10.200.0.4".parse().unwrap());
		input.services = vec![svc(
			"Game",
			o1,
			vec![PortRule {
				protocol: Protocol::Udp,
				public_start: 27015,
				public_end: 27030,
				private_start: 27015,
				private_end: 27030,
			}],
		)];

		let out = synthesize(&input).unwrap();
		assert!(out.contains("-A PREROUTING -i eth0 -p udp --dport 27015:27030 -j DNAT --to-destination 10.200.0.4:27015-27030"));
	}

	#[test]
	fn range_to_single_mapping_is_rejected() {
		let o1 = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"O1");
		let mut input = base_input();
		input.origin_addresses.insert(o1, "10.200.0.4".parse().unwrap());
		input.services = vec![svc(
			"Game",
			o1,
			vec![PortRule {
				protocol: Protocol::Udp,
				public_start: 27015,
				public_end: 27030,
				private_start: 27015,
				private_end: 27015,
			}],
		)];

		let err = synthesize(&input).unwrap_err();
		assert!(matches!(err, SynthesisError::InvalidPortRule { .. }));
	}

	#[test]
	fn overlapping_public_ports_same_protocol_rejected() {
		let o1 = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"O1");
		let mut input = base_input();
		input.origin_addresses.insert(o1, "10.200.0.2".parse().unwrap());
		input.services = vec![
			svc(
				"A",
				o1,
				vec![PortRule {
					protocol: Protocol::Udp,
					public_start: 20000,
					public_end: 20010,
					private_start: 20000,
					private_end: 20010,
				}],
			),
			svc(
				"B",
				o1,
				vec![PortRule {
					protocol: Protocol::Udp,
					public_start: 20005,
					public_end: 20005,
					private_start: 20005,
					private_end: 20005,
				}],
			),
		];

		let err = synthesize(&input).unwrap_err();
		assert!(matches!(err, SynthesisError::OverlappingPublicPorts { .. }));
	}

	#[test]
	fn output_chain_always_accepts_new_established_related_when_defense_on() {
		let input = base_input();
		let out = synthesize(&input).unwrap();
		assert!(out.contains("-A OUTPUT -m conntrack --ctstate NEW,ESTABLISHED,RELATED -j ACCEPT"));
	}

	#[test]
	fn empty_services_and_policy_still_installs_loopback_and_management() {
		let input = base_input();
		let out = synthesize(&input).unwrap();
		assert!(out.contains("-A INPUT -i lo -j ACCEPT"));
		assert!(out.contains("-A INPUT -p tcp --dport 22 -j ACCEPT"));
		assert!(out.contains("-A INPUT -p tcp --dport 8443 -j ACCEPT"));
		assert!(out.contains("COMMIT"));
	}

	#[test]
	fn tier_escalation_changes_rate_limit_and_adds_short_circuit() {
		let mut input = base_input();
		input.settings.tier = DefenseTier::Tier3;
		let out = synthesize(&input).unwrap();
		assert!(out.contains(&format!("-A {GAME_GUARD_CHAIN} ! -m set --match-set geo_allow_set src -j DROP")));

		input.settings.tier = DefenseTier::Tier1;
		let out_tier1 = synthesize(&input).unwrap();
		assert!(!out_tier1.contains("! -m set --match-set geo_allow_set"));
	}

	#[test]
	fn applying_twice_with_no_mutation_is_idempotent() {
		let input = base_input();
		let first = synthesize(&input).unwrap();
		let second = synthesize(&input).unwrap();
		assert_eq!(first, second, "reconciliation must be idempotent");
	}

	#[test]
	fn vpn_and_tor_drops_are_gated_on_their_own_toggles_and_follow_ban_set() {
		let mut input = base_input();
		input.settings.block_vpn = false;
		input.settings.block_tor = false;
		let out = synthesize(&input).unwrap();
		assert!(!out.contains("--match-set vpn_set"));
		assert!(!out.contains("--match-set tor_set"));

		input.settings.block_vpn = true;
		let out = synthesize(&input).unwrap();
		assert!(out.contains(&format!("-A {GAME_GUARD_CHAIN} -m set --match-set vpn_set src -j DROP")));
		assert!(!out.contains("--match-set tor_set"));
		let ban_pos = out.find(&format!("-A {GAME_GUARD_CHAIN} -m set --match-set ban_set src -j DROP")).unwrap();
		let vpn_pos = out.find(&format!("-A {GAME_GUARD_CHAIN} -m set --match-set vpn_set src -j DROP")).unwrap();
		let geo_return_pos = out.find(&format!("-A {GAME_GUARD_CHAIN} -m set --match-set geo_allow_set src -j RETURN")).unwrap();
		assert!(ban_pos < vpn_pos && vpn_pos < geo_return_pos, "vpn_set drop must sit between ban_set and the allow returns");

		input.settings.block_tor = true;
		let out = synthesize(&input).unwrap();
		assert!(out.contains(&format!("-A {GAME_GUARD_CHAIN} -m set --match-set tor_set src -j DROP")));
	}

	#[test]
	fn synthesize_ipsets_creates_and_populates_every_referenced_set() {
		let mut policy = PolicyTables::default();
		policy.ban_ip.push(relayctl_core::model::PolicyEntry {
			address: "198.51.100.7".parse().unwrap(),
			reason: "manual".into(),
			expires_at: None,
		});
		policy.vpn_ranges.push("45.32.0.0/16".parse().unwrap());
		policy.tor_ranges.push("185.220.101.0/24".parse().unwrap());
		let geo_allow = vec!["203.0.113.0/24".parse().unwrap()];
		let foreign_allow = vec!["198.18.0.0/15".parse().unwrap()];

		let out = synthesize_ipsets(&policy, &geo_allow, &foreign_allow);

		assert!(out.contains("create ban_set hash:ip family inet hashsize 1024 maxelem 65536 -exist"));
		assert!(out.contains("add ban_set 198.51.100.7"));
		assert!(out.contains("create geo_allow_set hash:net family inet hashsize 1024 maxelem 65536 -exist"));
		assert!(out.contains("add geo_allow_set 203.0.113.0/24"));
		assert!(out.contains("add foreign_allow_set 198.18.0.0/15"));
		assert!(out.contains("add vpn_set 45.32.0.0/16"));
		assert!(out.contains("add tor_set 185.220.101.0/24"));
	}

	#[test]
	fn synthesize_ipsets_with_empty_policy_still_creates_every_set_so_restore_never_references_an_undefined_set() {
		let policy = PolicyTables::default();
		let out = synthesize_ipsets(&policy, &[], &[]);
		for name in ["ban_set", "geo_allow_set", "foreign_allow_set", "vpn_set", "tor_set"] {
			assert!(out.contains(&format!("create {name} ")), "missing create for {name}");
			assert!(out.contains(&format!("flush {name}")), "missing flush for {name}");
		}
	}
}
