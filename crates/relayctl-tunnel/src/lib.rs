//! Lifecycle of the tunnel interface and its peers: keypair generation,
//! per-origin tunnel-address allocation, idempotent peer add/remove via
//! `wg`, and emission of peer-side configuration with a correctly
//! subtracted allowed-addresses set.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use relayctl_core::cidr;
use relayctl_exec::{ExecError, Executor};
use thiserror::Error;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);
const LINK_LOCAL: &str = "169.254.0.0/16";
const LOOPBACK: &str = "127.0.0.0/8";

#[derive(Debug, Error)]
pub enum TunnelError {
	#[error("executing wg: {0}")]
	Exec(#[from] ExecError),
	#[error("invalid base64 key {0:?}: {1}")]
	InvalidKey(String, base64::DecodeError),
	#[error("key must be exactly 32 bytes, got {0}")]
	WrongKeyLength(usize),
	#[error("malformed `wg show dump` output: {0}")]
	MalformedDump(String),
	#[error("tunnel subnet {0} is exhausted, no free address")]
	SubnetExhausted(Ipv4Net),
}

/// A 32-byte Curve25519 keypair, canonically base64-encoded as WireGuard expects.
#[derive(Clone)]
pub struct TunnelKeyPair {
	pub private: [u8; 32],
	pub public: [u8; 32],
}

impl TunnelKeyPair {
	pub fn generate() -> TunnelKeyPair {
		let secret = StaticSecret::random_from_rng(OsRng);
		let public = PublicKey::from(&secret);
		TunnelKeyPair {
			private: secret.to_bytes(),
			public: public.to_bytes(),
		}
	}

	pub fn private_b64(&self) -> String {
		encode_key(&self.private)
	}

	pub fn public_b64(&self) -> String {
		encode_key(&self.public)
	}
}

/// Canonical base64 encoding for a raw 32-byte key, shared with callers that
/// hold a stored key (e.g. a persisted `Peer`) rather than a freshly
/// generated `TunnelKeyPair`.
pub fn encode_key(bytes: &[u8; 32]) -> String {
	use base64::Engine;
	base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn decode_key(b64: &str) -> Result<[u8; 32], TunnelError> {
	use base64::Engine;
	let raw = base64::engine::general_purpose::STANDARD
		.decode(b64)
		.map_err(|e| TunnelError::InvalidKey(b64.to_string(), e))?;
	raw.try_into()
		.map_err(|v: Vec<u8>| TunnelError::WrongKeyLength(v.len()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
	pub public_key: String,
	pub endpoint: Option<SocketAddr>,
	pub allowed_addrs: Vec<Ipv4Net>,
	pub last_handshake_unix: Option<u64>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
}

/// Parameters describing an origin, sufficient to emit its peer config.
pub struct OriginTunnelParams {
	pub origin_private_key: [u8; 32],
	pub tunnel_address: Ipv4Addr,
	pub tunnel_subnet: Ipv4Net,
	pub server_public_key: [u8; 32],
	pub server_endpoint: SocketAddr,
	/// The origin's own local network, excluded from the allowed-addresses
	/// set so traffic to it is not pulled into the tunnel.
	pub origin_lan: Ipv4Net,
	pub keepalive: Duration,
}

pub struct TunnelManager {
	interface: String,
	executor: Arc<dyn Executor>,
}

impl TunnelManager {
	pub fn new(interface: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
		TunnelManager {
			interface: interface.into(),
			executor,
		}
	}

	pub fn generate_keypair(&self) -> TunnelKeyPair {
		TunnelKeyPair::generate()
	}

	/// Allocates the lowest unused address in `subnet`, starting from the
	/// host right after `server_addr` (e.g. subnet `.0/24`, server `.1`,
	/// first origin `.2`).
	pub fn allocate_address(
		subnet: Ipv4Net,
		server_addr: Ipv4Addr,
		used: &HashSet<Ipv4Addr>,
	) -> Result<Ipv4Addr, TunnelError> {
		let (start, end) = cidr::range_of(subnet);
		let server = u32::from(server_addr);
		let mut candidate = server.max(start) + 1;
		while candidate < end {
			let addr = Ipv4Addr::from(candidate);
			if addr != server_addr && !used.contains(&addr) {
				return Ok(addr);
			}
			candidate += 1;
		}
		Err(TunnelError::SubnetExhausted(subnet))
	}

	/// Idempotent: re-adding the same key with the same address is a no-op
	/// success, since `wg set` naturally converges to the given state.
	pub async fn add_peer(&self, public_key_b64: &str, tunnel_address: Ipv4Addr) -> Result<(), TunnelError> {
		decode_key(public_key_b64)?;
		let allowed = format!("{tunnel_address}/32");
		self
			.executor
			.execute_default(&[
				"wg",
				"set",
				&self.interface,
				"peer",
				public_key_b64,
				"allowed-ips",
				&allowed,
			])
			.await?;
		debug!(peer = public_key_b64, %tunnel_address, "peer added");
		Ok(())
	}

	/// Idempotent: removing an unknown peer succeeds.
	pub async fn remove_peer(&self, public_key_b64: &str) -> Result<(), TunnelError> {
		self
			.executor
			.execute_default(&["wg", "set", &self.interface, "peer", public_key_b64, "remove"])
			.await?;
		debug!(peer = public_key_b64, "peer removed");
		Ok(())
	}

	/// Read-through to the live interface state via `wg show <iface> dump`.
	pub async fn peers(&self) -> Result<Vec<PeerInfo>, TunnelError> {
		let out = self
			.executor
			.execute_default(&["wg", "show", &self.interface, "dump"])
			.await?;
		parse_dump(&out.stdout)
	}

	/// Produces the peer-side config for an origin, with an allowed-addresses
	/// set equal to `0.0.0.0/0` minus the server endpoint, the origin's LAN,
	/// link-local, and loopback. Never includes the server endpoint: doing
	/// so would loop tunnel traffic back through itself.
	pub fn emit_client_config(&self, origin: &OriginTunnelParams) -> String {
		let universe: Ipv4Net = "0.0.0.0/0".parse().expect("valid literal");
		let endpoint_ip = match origin.server_endpoint {
			SocketAddr::V4(v4) => *v4.ip(),
			SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
		};
		let endpoint_net = Ipv4Net::new(endpoint_ip, 32).expect("valid /32");
		let link_local: Ipv4Net = LINK_LOCAL.parse().expect("valid literal");
		let loopback: Ipv4Net = LOOPBACK.parse().expect("valid literal");

		let allowed = cidr::subtract(
			universe,
			&[endpoint_net, origin.origin_lan, link_local, loopback],
		);
		let allowed_str = allowed
			.iter()
			.map(|n| n.to_string())
			.collect::<Vec<_>>()
			.join(", ");

		let private_key = encode_key(&origin.origin_private_key);
		let server_pub = encode_key(&origin.server_public_key);

		format!(
			"[Interface]\n\
			 PrivateKey = {private_key}\n\
			 Address = {}/{}\n\
			 \n\
			 [Peer]\n\
			 PublicKey = {server_pub}\n\
			 Endpoint = {}\n\
			 AllowedIPs = {allowed_str}\n\
			 PersistentKeepalive = {}\n",
			origin.tunnel_address,
			origin.tunnel_subnet.prefix_len(),
			origin.server_endpoint,
			origin.keepalive.as_secs(),
		)
	}
}

/// Ensures the tunnel interface exists and has the server's private key and
/// listen port applied. Idempotent: reapplying the same config is a no-op.
/// The private key is written to a 0600 temp file and passed by path, as
/// `wg set` expects, rather than appearing in the argument vector.
pub async fn ensure_interface(
	executor: &Arc<dyn Executor>,
	interface: &str,
	server_private_key: &[u8; 32],
	server_addr: Ipv4Addr,
	subnet_prefix_len: u8,
	listen_port: u16,
) -> Result<(), TunnelError> {
	let existing = executor
		.execute_default(&["ip", "link", "show", interface])
		.await;
	if existing.is_err() {
		executor
			.execute_default(&["ip", "link", "add", interface, "type", "wireguard"])
			.await?;
		let addr = format!("{server_addr}/{subnet_prefix_len}");
		executor
			.execute_default(&["ip", "address", "add", &addr, "dev", interface])
			.await?;
		executor
			.execute_default(&["ip", "link", "set", interface, "up"])
			.await?;
		info!(interface, %server_addr, "tunnel interface created");
	}

	let key_file = write_private_key_file(server_private_key)?;
	let key_path = key_file
		.path()
		.to_str()
		.ok_or_else(|| TunnelError::MalformedDump("non-utf8 temp path".into()))?;
	executor
		.execute_default(&[
			"wg",
			"set",
			interface,
			"private-key",
			key_path,
			"listen-port",
			&listen_port.to_string(),
		])
		.await?;
	Ok(())
}

fn write_private_key_file(key: &[u8; 32]) -> Result<tempfile::NamedTempFile, TunnelError> {
	use std::io::Write;
	let mut file = tempfile::NamedTempFile::new().map_err(|e| TunnelError::MalformedDump(e.to_string()))?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		let mut perms = file.as_file().metadata().map(|m| m.permissions()).unwrap_or_else(|_| std::fs::Permissions::from_mode(0o600));
		perms.set_mode(0o600);
		let _ = file.as_file().set_permissions(perms);
	}
	file
		.write_all(encode_key(key).as_bytes())
		.map_err(|e| TunnelError::MalformedDump(e.to_string()))?;
	Ok(file)
}

fn parse_dump(dump: &str) -> Result<Vec<PeerInfo>, TunnelError> {
	let mut lines = dump.lines();
	// First line describes the interface itself; skip it.
	let _interface_line = lines.next();

	let mut peers = Vec::new();
	for line in lines {
		if line.trim().is_empty() {
			continue;
		}
		let fields: Vec<&str> = line.split('\t').collect();
		if fields.len() < 8 {
			return Err(TunnelError::MalformedDump(line.to_string()));
		}
		let public_key = fields[0].to_string();
		let endpoint = match fields[2] {
			"(none)" => None,
			ep => ep.parse().ok(),
		};
		let allowed_addrs = fields[3]
			.split(',')
			.filter(|s| !s.is_empty() && *s != "(none)")
			.filter_map(|s| s.trim().parse().ok())
			.collect();
		let last_handshake_unix = fields[4].parse::<u64>().ok().filter(|v| *v != 0);
		let rx_bytes = fields[5].parse().unwrap_or(0);
		let tx_bytes = fields[6].parse().unwrap_or(0);

		peers.push(PeerInfo {
			public_key,
			endpoint,
			allowed_addrs,
			last_handshake_unix,
			rx_bytes,
			tx_bytes,
		});
	}
	Ok(peers)
}
