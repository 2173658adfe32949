//! Runtime configuration: environment variables win, then the YAML file
//! pointed to by `CONFIG_FILE`, then a built-in default. Mirrors the
//! teacher's `parse::<T>(env)?.or(raw.field).unwrap_or(default)` convention.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use ipnet::Ipv4Net;

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
struct RawConfig {
	data_dir: Option<PathBuf>,
	log_dir: Option<PathBuf>,
	geo_license_key: Option<String>,
	public_interface: Option<String>,
	tunnel_interface: Option<String>,
	tunnel_subnet: Option<String>,
	tunnel_listen_port: Option<u16>,
	server_public_endpoint: Option<String>,
	management_tcp_ports: Option<Vec<u16>>,
	reconcile_min_interval: Option<String>,
	fastpath_sample_interval: Option<String>,
	policy_sweep_interval: Option<String>,
	metrics_bind_addr: Option<String>,
	readiness_bind_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
	pub data_dir: PathBuf,
	pub log_dir: PathBuf,
	pub geo_license_key: Option<String>,
	pub public_interface: String,
	pub tunnel_interface: String,
	pub tunnel_subnet: Ipv4Net,
	pub tunnel_listen_port: u16,
	pub server_public_endpoint: SocketAddr,
	pub management_tcp_ports: Vec<u16>,
	pub fastpath_sample_interval: Duration,
	pub policy_sweep_interval: Duration,
	pub metrics_bind_addr: SocketAddr,
	pub readiness_bind_addr: SocketAddr,
}

impl RuntimeConfig {
	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join("config.db")
	}

	pub fn geo_persist_path(&self) -> PathBuf {
		self.data_dir.join("geo").join("country-blocks.bin")
	}

	pub fn server_key_path(&self) -> PathBuf {
		self.data_dir.join("tunnel").join("server.key")
	}

	pub fn staging_rules_path(&self) -> PathBuf {
		self.data_dir.join("staging").join("rules.txt")
	}
}

/// Loads configuration the same way the binary will at startup: read
/// `CONFIG_FILE` if set (YAML), then let environment variables override any
/// field it sets, then fall back to defaults.
pub fn load() -> anyhow::Result<RuntimeConfig> {
	let raw: RawConfig = match parse::<PathBuf>("CONFIG_FILE")? {
		Some(path) => {
			let contents = std::fs::read_to_string(&path).with_context(|| format!("reading config file {}", path.display()))?;
			serde_yaml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))?
		},
		None => RawConfig::default(),
	};

	let data_dir = parse::<PathBuf>("DATA_DIR")?.or(raw.data_dir).unwrap_or_else(|| PathBuf::from("/var/lib/relayctl"));
	let log_dir = parse::<PathBuf>("LOG_DIR")?.or(raw.log_dir).unwrap_or_else(|| PathBuf::from("/var/log/relayctl"));
	let geo_license_key = parse::<String>("GEO_LICENSE_KEY")?.or(raw.geo_license_key);
	let public_interface = parse::<String>("PUBLIC_INTERFACE")?.or(raw.public_interface).unwrap_or_else(|| "eth0".to_string());
	let tunnel_interface = parse::<String>("TUNNEL_INTERFACE")?.or(raw.tunnel_interface).unwrap_or_else(|| "wg-relay0".to_string());
	let tunnel_subnet: Ipv4Net = parse::<String>("TUNNEL_SUBNET")?
		.or(raw.tunnel_subnet)
		.unwrap_or_else(|| "10.200.0.0/24".to_string())
		.parse()
		.context("invalid TUNNEL_SUBNET")?;
	let tunnel_listen_port = parse::<u16>("TUNNEL_LISTEN_PORT")?.or(raw.tunnel_listen_port).unwrap_or(51820);
	let server_public_endpoint: SocketAddr = parse::<String>("SERVER_PUBLIC_ENDPOINT")?
		.or(raw.server_public_endpoint)
		.context("SERVER_PUBLIC_ENDPOINT is required (the edge node's public host:port)")?
		.parse()
		.context("invalid SERVER_PUBLIC_ENDPOINT")?;
	let management_tcp_ports = parse_port_list("MANAGEMENT_TCP_PORTS")?.or(raw.management_tcp_ports).unwrap_or_else(|| vec![22, 8443]);
	let fastpath_sample_interval = parse_duration("FASTPATH_SAMPLE_INTERVAL")?
		.or(raw.fastpath_sample_interval.and_then(|s| duration_str::parse(&s).ok()))
		.unwrap_or(Duration::from_secs(5));
	let policy_sweep_interval = parse_duration("POLICY_SWEEP_INTERVAL")?
		.or(raw.policy_sweep_interval.and_then(|s| duration_str::parse(&s).ok()))
		.unwrap_or(Duration::from_secs(30));
	let metrics_bind_addr: SocketAddr = parse::<String>("METRICS_BIND_ADDR")?.or(raw.metrics_bind_addr).unwrap_or_else(|| "127.0.0.1:9090".to_string()).parse().context("invalid METRICS_BIND_ADDR")?;
	let readiness_bind_addr: SocketAddr = parse::<String>("READINESS_BIND_ADDR")?.or(raw.readiness_bind_addr).unwrap_or_else(|| "127.0.0.1:9091".to_string()).parse().context("invalid READINESS_BIND_ADDR")?;

	Ok(RuntimeConfig {
		data_dir,
		log_dir,
		geo_license_key,
		public_interface,
		tunnel_interface,
		tunnel_subnet,
		tunnel_listen_port,
		server_public_endpoint,
		management_tcp_ports,
		fastpath_sample_interval,
		policy_sweep_interval,
		metrics_bind_addr,
		readiness_bind_addr,
	})
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::fmt::Display,
{
	match env::var(env) {
		Ok(val) => val.parse().map(Some).map_err(|e| anyhow::anyhow!("invalid env var {env}={val} ({e})")),
		Err(_) => Ok(None),
	}
}

fn parse_duration(env: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(env)?.map(|s| duration_str::parse(&s).map_err(|e| anyhow::anyhow!("invalid env var {env}={s} ({e})"))).transpose()
}

fn parse_port_list(env: &str) -> anyhow::Result<Option<Vec<u16>>> {
	match env::var(env) {
		Ok(val) => val
			.split(',')
			.map(|p| p.trim().parse::<u16>().map_err(|e| anyhow::anyhow!("invalid port {p:?} in {env}: {e}")))
			.collect::<anyhow::Result<Vec<_>>>()
			.map(Some),
		Err(_) => Ok(None),
	}
}

/// Host-facing address derivable from `tunnel_subnet`: the lowest host
/// address, conventionally the server's own tunnel-side address.
pub fn server_tunnel_address(subnet: Ipv4Net) -> Ipv4Addr {
	let (start, _) = relayctl_core::cidr::range_of(subnet);
	Ipv4Addr::from(start + 1)
}
