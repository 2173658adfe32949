//! Small shared network types used across the rule synthesizer and the
//! fast-path manager, so both speak the same protocol/range vocabulary.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// ISO 3166-1 alpha-2 country code, upper-cased. `"--"` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CountryCode(pub [u8; 2]);

pub const UNKNOWN_COUNTRY: CountryCode = CountryCode(*b"--");

impl CountryCode {
	pub fn parse(s: &str) -> Option<CountryCode> {
		let bytes = s.as_bytes();
		if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
			return None;
		}
		Some(CountryCode([bytes[0].to_ascii_uppercase(), bytes[1].to_ascii_uppercase()]))
	}

	pub fn as_str(&self) -> &str {
		std::str::from_utf8(&self.0).unwrap_or("--")
	}
}

impl std::fmt::Display for CountryCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
	Tcp,
	Udp,
}

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Protocol::Tcp => "tcp",
			Protocol::Udp => "udp",
		}
	}
}

impl std::fmt::Display for Protocol {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Private, non-routable IPv4 ranges that the fast-path ingress filter must
/// always bypass: RFC 1918 10/8, 172.16/12, 192.168/16, plus loopback 127/8.
pub const PRIVATE_RANGES: [&str; 4] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "127.0.0.0/8"];

pub fn is_private(addr: Ipv4Addr) -> bool {
	PRIVATE_RANGES
		.iter()
		.any(|cidr| cidr.parse::<Ipv4Net>().expect("valid literal").contains(&addr))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn private_ranges_detected() {
		assert!(is_private("10.1.2.3".parse().unwrap()));
		assert!(is_private("172.16.0.5".parse().unwrap()));
		assert!(is_private("192.168.0.1".parse().unwrap()));
		assert!(is_private("127.0.0.1".parse().unwrap()));
		assert!(!is_private("8.8.8.8".parse().unwrap()));
		assert!(!is_private("172.32.0.1".parse().unwrap()));
	}
}
