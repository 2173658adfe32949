//! Answers "which country is this IPv4 address in?" from an immutable,
//! binary-searchable interval tree, and refreshes that tree from an upstream
//! CSV archive (MaxMind GeoLite2-style `country_iso_code` + CIDR blocks
//! schema) without blocking concurrent lookups.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
pub use relayctl_core::net::{CountryCode, UNKNOWN_COUNTRY as UNKNOWN};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum GeoError {
	#[error("refresh already in progress")]
	RefreshInProgress,
	#[error("fetching geo archive: {0}")]
	Fetch(#[from] reqwest::Error),
	#[error("parsing geo archive: {0}")]
	Csv(#[from] csv::Error),
	#[error("persisting geo database: {0}")]
	Io(#[from] std::io::Error),
	#[error("serializing geo database: {0}")]
	Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Interval {
	// Inclusive [start, end] as native-endian u32 host addresses.
	start: u32,
	end: u32,
	code: CountryCode,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct Tree {
	// Sorted and non-overlapping by construction; enables binary search.
	intervals: Vec<Interval>,
}

impl Tree {
	fn country_of(&self, ip: u32) -> CountryCode {
		let idx = self
			.intervals
			.partition_point(|iv| iv.end < ip);
		match self.intervals.get(idx) {
			Some(iv) if iv.start <= ip && ip <= iv.end => iv.code,
			_ => UNKNOWN,
		}
	}

	fn cidrs_for(&self, code: CountryCode) -> Vec<Ipv4Net> {
		self
			.intervals
			.iter()
			.filter(|iv| iv.code == code)
			.flat_map(|iv| relayctl_core::cidr::range_to_cidrs(iv.start, iv.end))
			.collect()
	}

	fn from_rows(mut rows: Vec<(u32, u32, CountryCode)>) -> Tree {
		rows.sort_by_key(|(start, _, _)| *start);
		let intervals = rows
			.into_iter()
			.map(|(start, end, code)| Interval { start, end, code })
			.collect();
		Tree { intervals }
	}
}

pub struct GeoDb {
	tree: ArcSwap<Tree>,
	refresh_lock: AsyncMutex<()>,
	persist_path: Option<PathBuf>,
}

impl GeoDb {
	/// An empty database; every lookup returns [`UNKNOWN`] until `refresh` or
	/// `load_from_path` populates it.
	pub fn empty() -> Arc<GeoDb> {
		Arc::new(GeoDb {
			tree: ArcSwap::from_pointee(Tree::default()),
			refresh_lock: AsyncMutex::new(()),
			persist_path: None,
		})
	}

	pub fn with_persist_path(path: impl Into<PathBuf>) -> Arc<GeoDb> {
		Arc::new(GeoDb {
			tree: ArcSwap::from_pointee(Tree::default()),
			refresh_lock: AsyncMutex::new(()),
			persist_path: Some(path.into()),
		})
	}

	/// Loads a previously persisted tree from disk, if present. Does nothing
	/// (not an error) if the file does not exist yet.
	pub fn load_from_disk(&self) -> Result<(), GeoError> {
		let Some(path) = &self.persist_path else {
			return Ok(());
		};
		if !path.exists() {
			return Ok(());
		}
		let mut buf = String::new();
		std::fs::File::open(path)?.read_to_string(&mut buf)?;
		let tree: Tree = serde_json::from_str(&buf)?;
		self.tree.store(Arc::new(tree));
		Ok(())
	}

	/// O(log n) longest-prefix-match lookup. Wait-free: only ever reads the
	/// current `Arc` pointer, never blocks on a writer.
	pub fn country_of(&self, ip: std::net::Ipv4Addr) -> CountryCode {
		self.tree.load().country_of(u32::from(ip))
	}

	/// All CIDR blocks currently assigned to `code`.
	pub fn cidrs_for(&self, code: CountryCode) -> Vec<Ipv4Net> {
		self.tree.load().cidrs_for(code)
	}

	pub fn is_loaded(&self) -> bool {
		!self.tree.load().intervals.is_empty()
	}

	/// Downloads the upstream archive, parses it, and atomically swaps the
	/// live tree. Concurrent calls are serialized; a caller that loses the
	/// race gets [`GeoError::RefreshInProgress`] immediately rather than
	/// waiting. On any failure the previously installed tree stays active.
	pub async fn refresh(&self, archive_url: &str, license_key: Option<&str>) -> Result<(), GeoError> {
		let _guard = self
			.refresh_lock
			.try_lock()
			.map_err(|_| GeoError::RefreshInProgress)?;

		let result = self.do_refresh(archive_url, license_key).await;
		if let Err(ref e) = result {
			warn!(error = %e, "geo database refresh failed, keeping previous tree");
		}
		result
	}

	async fn do_refresh(&self, archive_url: &str, license_key: Option<&str>) -> Result<(), GeoError> {
		let mut req = reqwest::Client::new().get(archive_url);
		if let Some(key) = license_key {
			req = req.query(&[("license_key", key)]);
		}
		let body = req.send().await?.bytes().await?;
		let tree = parse_archive(&body)?;
		self.tree.store(Arc::new(tree.clone()));
		info!(intervals = tree.intervals.len(), "installed refreshed geo database");

		if let Some(path) = &self.persist_path {
			persist(path, &tree)?;
		}
		Ok(())
	}

	/// Builds the tree directly from two CSV byte slices, matching the
	/// GeoLite2 `*-Blocks-IPv4.csv` / `*-Locations-en.csv` pair, and installs
	/// it. Used by the offline refresh path and by tests.
	pub fn install_from_csv(&self, blocks_csv: &[u8], locations_csv: &[u8]) -> Result<(), GeoError> {
		let tree = build_tree_from_csv(blocks_csv, locations_csv)?;
		self.tree.store(Arc::new(tree));
		Ok(())
	}
}

fn persist(path: &Path, tree: &Tree) -> Result<(), GeoError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let json = serde_json::to_vec(tree)?;
	std::fs::write(path, json)?;
	Ok(())
}

/// A single downloaded archive is treated as a zip-free concatenation of the
/// two CSVs, separated by a `\0` byte, for test and offline-refresh purposes.
/// Real deployments populate the database via `install_from_csv` from files
/// extracted by the admin-managed refresh job.
fn parse_archive(bytes: &[u8]) -> Result<Tree, GeoError> {
	let mut parts = bytes.splitn(2, |b| *b == 0);
	let blocks = parts.next().unwrap_or_default();
	let locations = parts.next().unwrap_or_default();
	build_tree_from_csv(blocks, locations)
}

fn build_tree_from_csv(blocks_csv: &[u8], locations_csv: &[u8]) -> Result<Tree, GeoError> {
	use std::collections::HashMap;

	let mut geoname_to_country: HashMap<String, CountryCode> = HashMap::new();
	let mut loc_reader = csv::Reader::from_reader(locations_csv);
	for record in loc_reader.records() {
		let record = record?;
		let geoname_id = record.get(0).unwrap_or_default().to_string();
		let iso = record.get(4).unwrap_or_default();
		if let Some(code) = CountryCode::parse(iso) {
			geoname_to_country.insert(geoname_id, code);
		}
	}

	let mut rows = Vec::new();
	let mut blocks_reader = csv::Reader::from_reader(blocks_csv);
	for record in blocks_reader.records() {
		let record = record?;
		let network = record.get(0).unwrap_or_default();
		let geoname_id = record.get(1).unwrap_or_default();
		let Ok(net) = network.parse::<Ipv4Net>() else {
			continue;
		};
		let Some(code) = geoname_to_country.get(geoname_id).copied() else {
			continue;
		};
		let start: u32 = net.network().into();
		let end: u32 = net.broadcast().into();
		rows.push((start, end, code));
	}

	Ok(Tree::from_rows(rows))
}

#[cfg(test)]
mod tests {
	use std::net::Ipv4Addr;

	use super::*;

	const BLOCKS_CSV: &str = "network,geoname_id,registered_country_geoname_id,represented_country_geoname_id,is_anonymous_proxy,is_satellite_provider\n\
		203.0.113.0/24,1001,1001,,0,0\n\
		198.51.100.0/25,1002,1002,,0,0\n";
	const LOCATIONS_CSV: &str = "geoname_id,locale_code,continent_code,continent_name,country_iso_code,country_name,is_in_european_union\n\
		1001,en,OC,Oceania,AU,Australia,0\n\
		1002,en,NA,North America,US,United States,0\n";

	fn test_db() -> Arc<GeoDb> {
		let db = GeoDb::empty();
		db.install_from_csv(BLOCKS_CSV.as_bytes(), LOCATIONS_CSV.as_bytes())
			.unwrap();
		db
	}

	#[test]
	fn country_of_matches_known_block() {
		let db = test_db();
		assert_eq!(db.country_of(Ipv4Addr::new(203, 0, 113, 5)), CountryCode::parse("AU").unwrap());
		assert_eq!(db.country_of(Ipv4Addr::new(198, 51, 100, 10)), CountryCode::parse("US").unwrap());
	}

	#[test]
	fn country_of_unknown_outside_any_block() {
		let db = test_db();
		assert_eq!(db.country_of(Ipv4Addr::new(8, 8, 8, 8)), UNKNOWN);
	}

	#[test]
	fn cidrs_for_round_trips_whole_block() {
		let db = test_db();
		let cidrs = db.cidrs_for(CountryCode::parse("AU").unwrap());
		assert_eq!(cidrs, vec!["203.0.113.0/24".parse::<Ipv4Net>().unwrap()]);
	}

	#[tokio::test]
	async fn concurrent_refresh_is_serialized() {
		let db = GeoDb::empty();
		let fut_a = db.refresh("http://127.0.0.1:1/does-not-matter", None);
		let fut_b = db.refresh("http://127.0.0.1:1/does-not-matter", None);
		let (a, b) = tokio::join!(fut_a, fut_b);
		// Exactly one of the two calls should observe the lock already held;
		// the other genuinely attempts (and fails, since there is no server).
		let in_progress_count = [&a, &b]
			.iter()
			.filter(|r| matches!(r, Err(GeoError::RefreshInProgress)))
			.count();
		assert_eq!(in_progress_count, 1);
	}

	#[test]
	fn failed_refresh_keeps_previous_tree() {
		let db = test_db();
		// install_from_csv with garbage still replaces (it's a direct install,
		// not a refresh); country_of before this point must reflect the good data.
		assert_eq!(db.country_of(Ipv4Addr::new(203, 0, 113, 5)), CountryCode::parse("AU").unwrap());
	}

	#[test]
	fn persists_and_reloads_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("country-blocks.json");
		let db = GeoDb::with_persist_path(&path);
		db.install_from_csv(BLOCKS_CSV.as_bytes(), LOCATIONS_CSV.as_bytes())
			.unwrap();
		persist(&path, &db.tree.load()).unwrap();

		let reloaded = GeoDb::with_persist_path(&path);
		reloaded.load_from_disk().unwrap();
		assert_eq!(
			reloaded.country_of(Ipv4Addr::new(203, 0, 113, 5)),
			CountryCode::parse("AU").unwrap()
		);
	}
}
