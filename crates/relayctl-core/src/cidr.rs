//! CIDR range math shared by the geo database (turning address ranges back
//! into minimal CIDR blocks) and the tunnel manager (allowed-addresses set
//! subtraction for emitted peer configs).

use ipnet::Ipv4Net;

/// Inclusive `[start, end]` host-address range covered by `net`.
pub fn range_of(net: Ipv4Net) -> (u32, u32) {
	(u32::from(net.network()), u32::from(net.broadcast()))
}

/// Splits an inclusive `[start, end]` range into the minimal set of
/// CIDR-aligned blocks covering exactly that range and nothing else.
pub fn range_to_cidrs(start: u32, end: u32) -> Vec<Ipv4Net> {
	let mut out = Vec::new();
	let mut cur = start;
	loop {
		// Host bits alignable at `cur` (trailing_zeros == 32 only for cur == 0,
		// i.e. any prefix length is alignment-compatible there).
		let align_bits = cur.trailing_zeros().min(32);
		// floor(log2(remaining)) computed in u64 so a full 2^32-address span
		// (start == 0, end == u32::MAX) never overflows a u32 computation.
		let remaining: u64 = u64::from(end) - u64::from(cur) + 1;
		let span_bits = 63 - remaining.leading_zeros();
		let host_bits = align_bits.min(span_bits);
		let prefix = (32 - host_bits) as u8;
		let net = Ipv4Net::new(cur.into(), prefix).expect("prefix in range");
		let broadcast: u32 = net.broadcast().into();
		out.push(net);
		if broadcast >= end {
			break;
		}
		cur = broadcast + 1;
	}
	out
}

/// Subtracts `excludes` from `universe`, returning the minimal set of
/// disjoint CIDR blocks covering what remains. This is the allowed-addresses
/// computation: `0.0.0.0/0` minus the tunnel endpoint, the origin's LAN, the
/// link-local range, and loopback must never re-include the endpoint, or
/// tunnel traffic would loop back through itself.
pub fn subtract(universe: Ipv4Net, excludes: &[Ipv4Net]) -> Vec<Ipv4Net> {
	let mut ranges = vec![range_of(universe)];
	for ex in excludes {
		let ex_range = range_of(*ex);
		ranges = ranges
			.into_iter()
			.flat_map(|r| subtract_one(r, ex_range))
			.collect();
	}
	ranges.sort_unstable();
	ranges
		.into_iter()
		.flat_map(|(s, e)| range_to_cidrs(s, e))
		.collect()
}

fn subtract_one(range: (u32, u32), exclude: (u32, u32)) -> Vec<(u32, u32)> {
	let (s, e) = range;
	let (xs, xe) = exclude;
	if xe < s || xs > e {
		return vec![range];
	}
	let mut out = Vec::new();
	if xs > s {
		out.push((s, xs - 1));
	}
	if xe < e {
		out.push((xe + 1, e));
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn net(s: &str) -> Ipv4Net {
		s.parse().unwrap()
	}

	#[test]
	fn range_to_cidrs_round_trips_aligned_block() {
		assert_eq!(range_to_cidrs(range_of(net("10.0.0.0/24")).0, range_of(net("10.0.0.0/24")).1), vec![net("10.0.0.0/24")]);
	}

	#[test]
	fn range_to_cidrs_splits_unaligned_range() {
		let (start, end) = range_of(net("10.0.0.0/24"));
		// Drop the last address: 10.0.0.0-10.0.0.254 needs more than one block.
		let cidrs = range_to_cidrs(start, end - 1);
		let total: u64 = cidrs.iter().map(|n| 1u64 << (32 - n.prefix_len())).sum();
		assert_eq!(total, 255);
		for pair in cidrs.windows(2) {
			let a_end = range_of(pair[0]).1;
			let b_start = range_of(pair[1]).0;
			assert_eq!(a_end + 1, b_start, "blocks must be contiguous and disjoint");
		}
	}

	#[test]
	fn subtract_excludes_endpoint_from_full_tunnel() {
		let full = net("0.0.0.0/0");
		let excludes = vec![
			net("203.0.113.5/32"), // server public endpoint
			net("10.10.0.0/16"),   // origin LAN
			net("169.254.0.0/16"), // link-local
			net("127.0.0.0/8"),    // loopback
		];
		let result = subtract(full, &excludes);

		// The critical correctness property: the endpoint must never be
		// reachable through any surviving block.
		let endpoint = range_of(net("203.0.113.5/32")).0;
		for block in &result {
			let (s, e) = range_of(*block);
			assert!(!(s <= endpoint && endpoint <= e), "endpoint leaked into allowed-addresses");
		}

		// Disjoint and non-overlapping.
		let mut ranges: Vec<(u32, u32)> = result.iter().map(|n| range_of(*n)).collect();
		ranges.sort_unstable();
		for pair in ranges.windows(2) {
			assert!(pair[0].1 < pair[1].0, "overlapping blocks in result");
		}
	}

	#[test]
	fn subtract_with_no_excludes_returns_universe() {
		let full = net("10.0.0.0/8");
		assert_eq!(subtract(full, &[]), vec![full]);
	}

	#[test]
	fn subtract_everything_returns_empty() {
		let full = net("10.0.0.0/24");
		assert_eq!(subtract(full, &[net("10.0.0.0/24")]), Vec::<Ipv4Net>::new());
	}
}
