//! Config/State Store (§4.I): persists all declarative data behind a local
//! SQLite file. Forward-only migrations run at startup; a missing expected
//! column/table is a fatal §7 "data-store integrity failure". No ORM layer —
//! reads and writes are plain parameterized queries.

use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::error::DatabaseError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use relayctl_core::model::{AdminCredentials, DefenseSettings, DefenseTier, Origin, Peer, PolicyEntry, PolicyTables, PortRule, Service};
use relayctl_core::net::{CountryCode, Protocol};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTableKind {
	AllowIp,
	BanIp,
}

impl PolicyTableKind {
	fn column(&self) -> &'static str {
		match self {
			PolicyTableKind::AllowIp => "allow_ip",
			PolicyTableKind::BanIp => "ban_ip",
		}
	}
}

/// Everything the Reconciler needs in one read, taken inside a single
/// transaction so the view is internally consistent.
#[derive(Debug, Clone)]
pub struct Snapshot {
	pub origins: Vec<Origin>,
	pub peers: Vec<Peer>,
	pub services: Vec<Service>,
	pub policy: PolicyTables,
	pub settings: DefenseSettings,
}

pub struct Store {
	pool: SqlitePool,
}

impl Store {
	pub async fn connect(database_path: &Path) -> Result<Self, StoreError> {
		let options = SqliteConnectOptions::new().filename(database_path).create_if_missing(true).foreign_keys(true);
		let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
		sqlx::migrate!("./migrations").run(&pool).await?;
		ensure_default_settings(&pool).await?;
		Ok(Store { pool })
	}

	#[cfg(any(test, feature = "test-util"))]
	pub async fn connect_in_memory() -> Result<Self, StoreError> {
		let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap().foreign_keys(true);
		let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
		sqlx::migrate!("./migrations").run(&pool).await?;
		ensure_default_settings(&pool).await?;
		Ok(Store { pool })
	}

	pub async fn insert_origin(&self, origin: &Origin, peer: &Peer) -> Result<(), StoreError> {
		let mut tx = self.pool.begin().await?;
		sqlx::query("INSERT INTO origins (id, name, tunnel_address) VALUES (?, ?, ?)")
			.bind(origin.id.to_string())
			.bind(&origin.name)
			.bind(origin.tunnel_address.to_string())
			.execute(&mut *tx)
			.await
			.map_err(|e| match &e {
				sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation => StoreError::DuplicateTunnelAddress(origin.tunnel_address),
				_ => StoreError::Database(e),
			})?;
		sqlx::query("INSERT INTO peers (origin_id, public_key, private_key, last_handshake, rx_bytes, tx_bytes) VALUES (?, ?, ?, ?, ?, ?)")
			.bind(origin.id.to_string())
			.bind(hex::encode(peer.public_key))
			.bind(hex::encode(peer.private_key))
			.bind(peer.last_handshake.map(|t| t.to_rfc3339()))
			.bind(peer.rx_bytes as i64)
			.bind(peer.tx_bytes as i64)
			.execute(&mut *tx)
			.await?;
		tx.commit().await?;
		Ok(())
	}

	/// Cascading delete: the `ON DELETE CASCADE` foreign keys on `peers` and
	/// `services` remove the dependent rows.
	pub async fn delete_origin(&self, id: Uuid) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM origins WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
		Ok(())
	}

	pub async fn list_origins(&self) -> Result<Vec<Origin>, StoreError> {
		let rows = sqlx::query("SELECT id, name, tunnel_address FROM origins ORDER BY id").fetch_all(&self.pool).await?;
		rows.into_iter().map(row_to_origin).collect()
	}

	pub async fn list_peers(&self) -> Result<Vec<Peer>, StoreError> {
		let rows = sqlx::query("SELECT origin_id, public_key, private_key, last_handshake, rx_bytes, tx_bytes FROM peers ORDER BY origin_id")
			.fetch_all(&self.pool)
			.await?;
		rows.into_iter().map(row_to_peer).collect()
	}

	pub async fn update_peer_counters(&self, origin_id: Uuid, last_handshake: Option<DateTime<Utc>>, rx_bytes: u64, tx_bytes: u64) -> Result<(), StoreError> {
		sqlx::query("UPDATE peers SET last_handshake = ?, rx_bytes = ?, tx_bytes = ? WHERE origin_id = ?")
			.bind(last_handshake.map(|t| t.to_rfc3339()))
			.bind(rx_bytes as i64)
			.bind(tx_bytes as i64)
			.bind(origin_id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn upsert_service(&self, service: &Service) -> Result<(), StoreError> {
		let rules_json = serde_json::to_string(&service.rules).expect("PortRule serialization is infallible");
		sqlx::query(
			"INSERT INTO services (id, name, origin_id, rules_json) VALUES (?, ?, ?, ?)
			 ON CONFLICT(id) DO UPDATE SET name = excluded.name, origin_id = excluded.origin_id, rules_json = excluded.rules_json",
		)
		.bind(service.id.to_string())
		.bind(&service.name)
		.bind(service.origin_id.to_string())
		.bind(rules_json)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn delete_service(&self, id: Uuid) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM services WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
		Ok(())
	}

	pub async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
		let rows = sqlx::query("SELECT id, name, origin_id, rules_json FROM services ORDER BY id").fetch_all(&self.pool).await?;
		rows.into_iter().map(row_to_service).collect()
	}

	pub async fn add_policy_entry(&self, table: PolicyTableKind, entry: &PolicyEntry) -> Result<(), StoreError> {
		sqlx::query("INSERT INTO policy_entries (id, table_name, address, reason, expires_at) VALUES (?, ?, ?, ?, ?)")
			.bind(Uuid::new_v4().to_string())
			.bind(table.column())
			.bind(entry.address.to_string())
			.bind(&entry.reason)
			.bind(entry.expires_at.map(|t| t.to_rfc3339()))
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	pub async fn remove_policy_entry(&self, table: PolicyTableKind, address: Ipv4Addr) -> Result<(), StoreError> {
		sqlx::query("DELETE FROM policy_entries WHERE table_name = ? AND address = ?")
			.bind(table.column())
			.bind(address.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Reaps expired entries, matching "expired entries are treated as absent
	/// and reaped on next reconciliation" (§3).
	pub async fn prune_expired_policy(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
		let result = sqlx::query("DELETE FROM policy_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
			.bind(now.to_rfc3339())
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}

	pub async fn set_allow_foreign(&self, countries: &[CountryCode]) -> Result<(), StoreError> {
		let mut tx = self.pool.begin().await?;
		sqlx::query("DELETE FROM allow_foreign_countries").execute(&mut *tx).await?;
		for code in countries {
			sqlx::query("INSERT INTO allow_foreign_countries (country_code) VALUES (?)").bind(code.as_str()).execute(&mut *tx).await?;
		}
		tx.commit().await?;
		Ok(())
	}

	pub async fn policy_tables(&self) -> Result<PolicyTables, StoreError> {
		let mut tables = PolicyTables::default();
		let rows = sqlx::query("SELECT table_name, address, reason, expires_at FROM policy_entries").fetch_all(&self.pool).await?;
		for row in rows {
			let table_name: String = row.try_get("table_name")?;
			let entry = row_to_policy_entry(&row)?;
			match table_name.as_str() {
				"allow_ip" => tables.allow_ip.push(entry),
				"ban_ip" => tables.ban_ip.push(entry),
				other => tracing::warn!(table = other, "ignoring policy entry with unknown table_name"),
			}
		}
		let country_rows = sqlx::query("SELECT country_code FROM allow_foreign_countries").fetch_all(&self.pool).await?;
		for row in country_rows {
			let code: String = row.try_get("country_code")?;
			if let Some(code) = CountryCode::parse(&code) {
				tables.allow_foreign.push(code);
			}
		}
		Ok(tables)
	}

	pub async fn defense_settings(&self) -> Result<DefenseSettings, StoreError> {
		let row = sqlx::query("SELECT enabled, syn_cookie, block_vpn, block_tor, tier, fastpath_enabled FROM defense_settings WHERE id = 1")
			.fetch_one(&self.pool)
			.await?;
		Ok(DefenseSettings {
			enabled: row.try_get::<i64, _>("enabled")? != 0,
			syn_cookie: row.try_get::<i64, _>("syn_cookie")? != 0,
			block_vpn: row.try_get::<i64, _>("block_vpn")? != 0,
			block_tor: row.try_get::<i64, _>("block_tor")? != 0,
			geo_allow_countries: Vec::new(),
			tier: parse_tier(&row.try_get::<String, _>("tier")?),
			fastpath_enabled: row.try_get::<i64, _>("fastpath_enabled")? != 0,
		})
	}

	pub async fn set_defense_settings(&self, settings: &DefenseSettings) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO defense_settings (id, enabled, syn_cookie, block_vpn, block_tor, tier, fastpath_enabled) VALUES (1, ?, ?, ?, ?, ?, ?)
			 ON CONFLICT(id) DO UPDATE SET enabled = excluded.enabled, syn_cookie = excluded.syn_cookie, block_vpn = excluded.block_vpn,
			 block_tor = excluded.block_tor, tier = excluded.tier, fastpath_enabled = excluded.fastpath_enabled",
		)
		.bind(settings.enabled)
		.bind(settings.syn_cookie)
		.bind(settings.block_vpn)
		.bind(settings.block_tor)
		.bind(tier_str(settings.tier))
		.bind(settings.fastpath_enabled)
		.execute(&self.pool)
		.await?;
		self.set_allow_foreign(&settings.geo_allow_countries).await?;
		Ok(())
	}

	pub async fn admin_credentials(&self, username: &str) -> Result<Option<AdminCredentials>, StoreError> {
		let row = sqlx::query("SELECT username, password_hash, failed_attempts, lockout_until FROM admin_credentials WHERE username = ?")
			.bind(username)
			.fetch_optional(&self.pool)
			.await?;
		row.map(|row| {
			Ok(AdminCredentials {
				username: row.try_get("username")?,
				password_hash: row.try_get("password_hash")?,
				failed_attempts: row.try_get::<i64, _>("failed_attempts")? as u32,
				lockout_until: parse_opt_datetime(row.try_get::<Option<String>, _>("lockout_until")?)?,
			})
		})
		.transpose()
	}

	pub async fn upsert_admin_credentials(&self, creds: &AdminCredentials) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO admin_credentials (username, password_hash, failed_attempts, lockout_until) VALUES (?, ?, ?, ?)
			 ON CONFLICT(username) DO UPDATE SET password_hash = excluded.password_hash, failed_attempts = excluded.failed_attempts,
			 lockout_until = excluded.lockout_until",
		)
		.bind(&creds.username)
		.bind(&creds.password_hash)
		.bind(creds.failed_attempts as i64)
		.bind(creds.lockout_until.map(|t| t.to_rfc3339()))
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Snapshot I (§4.F step 1): one transaction, so the Reconciler never
	/// observes origins/services/policy rows from different points in time.
	pub async fn snapshot(&self) -> Result<Snapshot, StoreError> {
		let mut tx = self.pool.begin().await?;

		let origin_rows = sqlx::query("SELECT id, name, tunnel_address FROM origins ORDER BY id").fetch_all(&mut *tx).await?;
		let origins = origin_rows.into_iter().map(row_to_origin).collect::<Result<Vec<_>, _>>()?;

		let peer_rows = sqlx::query("SELECT origin_id, public_key, private_key, last_handshake, rx_bytes, tx_bytes FROM peers ORDER BY origin_id")
			.fetch_all(&mut *tx)
			.await?;
		let peers = peer_rows.into_iter().map(row_to_peer).collect::<Result<Vec<_>, _>>()?;

		let service_rows = sqlx::query("SELECT id, name, origin_id, rules_json FROM services ORDER BY id").fetch_all(&mut *tx).await?;
		let services = service_rows.into_iter().map(row_to_service).collect::<Result<Vec<_>, _>>()?;

		let policy_rows = sqlx::query("SELECT table_name, address, reason, expires_at FROM policy_entries").fetch_all(&mut *tx).await?;
		let mut policy = PolicyTables::default();
		for row in policy_rows {
			let table_name: String = row.try_get("table_name")?;
			let entry = row_to_policy_entry(&row)?;
			match table_name.as_str() {
				"allow_ip" => policy.allow_ip.push(entry),
				"ban_ip" => policy.ban_ip.push(entry),
				_ => {},
			}
		}
		let country_rows = sqlx::query("SELECT country_code FROM allow_foreign_countries").fetch_all(&mut *tx).await?;
		for row in country_rows {
			let code: String = row.try_get("country_code")?;
			if let Some(code) = CountryCode::parse(&code) {
				policy.allow_foreign.push(code);
			}
		}

		let settings_row = sqlx::query("SELECT enabled, syn_cookie, block_vpn, block_tor, tier, fastpath_enabled FROM defense_settings WHERE id = 1")
			.fetch_one(&mut *tx)
			.await?;
		let settings = DefenseSettings {
			enabled: settings_row.try_get::<i64, _>("enabled")? != 0,
			syn_cookie: settings_row.try_get::<i64, _>("syn_cookie")? != 0,
			block_vpn: settings_row.try_get::<i64, _>("block_vpn")? != 0,
			block_tor: settings_row.try_get::<i64, _>("block_tor")? != 0,
			geo_allow_countries: policy.allow_foreign.clone(),
			tier: parse_tier(&settings_row.try_get::<String, _>("tier")?),
			fastpath_enabled: settings_row.try_get::<i64, _>("fastpath_enabled")? != 0,
		};

		tx.commit().await?;
		Ok(Snapshot { origins, peers, services, policy, settings })
	}
}

async fn ensure_default_settings(pool: &SqlitePool) -> Result<(), StoreError> {
	let default = DefenseSettings::default();
	sqlx::query(
		"INSERT OR IGNORE INTO defense_settings (id, enabled, syn_cookie, block_vpn, block_tor, tier, fastpath_enabled) VALUES (1, ?, ?, ?, ?, ?, ?)",
	)
	.bind(default.enabled)
	.bind(default.syn_cookie)
	.bind(default.block_vpn)
	.bind(default.block_tor)
	.bind(tier_str(default.tier))
	.bind(default.fastpath_enabled)
	.execute(pool)
	.await?;
	Ok(())
}

fn tier_str(tier: DefenseTier) -> &'static str {
	match tier {
		DefenseTier::Tier1 => "tier1",
		DefenseTier::Tier2 => "tier2",
		DefenseTier::Tier3 => "tier3",
	}
}

fn parse_tier(s: &str) -> DefenseTier {
	match s {
		"tier1" => DefenseTier::Tier1,
		"tier3" => DefenseTier::Tier3,
		_ => DefenseTier::Tier2,
	}
}

fn parse_opt_datetime(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
	raw.map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)).map_err(|_| StoreError::InvalidAddress { field: "timestamp", value: s }))
		.transpose()
}

fn row_to_origin(row: sqlx::sqlite::SqliteRow) -> Result<Origin, StoreError> {
	let id_str: String = row.try_get("id")?;
	let addr_str: String = row.try_get("tunnel_address")?;
	Ok(Origin {
		id: Uuid::parse_str(&id_str).map_err(|_| StoreError::InvalidAddress { field: "origin.id", value: id_str })?,
		name: row.try_get("name")?,
		tunnel_address: addr_str.parse().map_err(|_| StoreError::InvalidAddress { field: "origin.tunnel_address", value: addr_str })?,
	})
}

fn row_to_peer(row: sqlx::sqlite::SqliteRow) -> Result<Peer, StoreError> {
	let origin_id: String = row.try_get("origin_id")?;
	let public_key: String = row.try_get("public_key")?;
	let private_key: String = row.try_get("private_key")?;
	let last_handshake: Option<String> = row.try_get("last_handshake")?;
	Ok(Peer {
		origin_id: Uuid::parse_str(&origin_id).map_err(|_| StoreError::InvalidAddress { field: "peer.origin_id", value: origin_id })?,
		public_key: decode_key(&public_key)?,
		private_key: decode_key(&private_key)?,
		last_handshake: parse_opt_datetime(last_handshake)?,
		rx_bytes: row.try_get::<i64, _>("rx_bytes")? as u64,
		tx_bytes: row.try_get::<i64, _>("tx_bytes")? as u64,
	})
}

fn decode_key(hex_str: &str) -> Result<[u8; 32], StoreError> {
	let bytes = hex::decode(hex_str).map_err(|_| StoreError::InvalidAddress { field: "key", value: hex_str.to_string() })?;
	bytes.try_into().map_err(|_| StoreError::InvalidAddress { field: "key length", value: hex_str.to_string() })
}

fn row_to_service(row: sqlx::sqlite::SqliteRow) -> Result<Service, StoreError> {
	let id_str: String = row.try_get("id")?;
	let origin_id_str: String = row.try_get("origin_id")?;
	let id = Uuid::parse_str(&id_str).map_err(|_| StoreError::InvalidAddress { field: "service.id", value: id_str })?;
	let rules_json: String = row.try_get("rules_json")?;
	let rules = parse_rules(&rules_json, id)?;
	Ok(Service {
		id,
		name: row.try_get("name")?,
		origin_id: Uuid::parse_str(&origin_id_str).map_err(|_| StoreError::InvalidAddress { field: "service.origin_id", value: origin_id_str })?,
		rules,
	})
}

/// Accepts the current `Vec<PortRule>` shape. Falls back to migrating the
/// legacy `{public_game_port, browser_port, a2s_port}` triple (the Open
/// Question on the Service port model) into an equivalent rule list: one UDP
/// rule for the game port and one TCP rule each for the populated browser
/// and A2S ports. The migration is applied on read, not persisted back
/// destructively until the next write.
fn parse_rules(rules_json: &str, service_id: Uuid) -> Result<Vec<PortRule>, StoreError> {
	if let Ok(rules) = serde_json::from_str::<Vec<PortRule>>(rules_json) {
		return Ok(rules);
	}
	#[derive(serde::Deserialize)]
	struct LegacyPorts {
		public_game_port: Option<u16>,
		browser_port: Option<u16>,
		a2s_port: Option<u16>,
	}
	let legacy: LegacyPorts = serde_json::from_str(rules_json).map_err(|source| StoreError::MalformedRules { service: service_id, source })?;
	let mut rules = Vec::new();
	if let Some(p) = legacy.public_game_port {
		rules.push(PortRule { protocol: Protocol::Udp, public_start: p, public_end: p, private_start: p, private_end: p });
	}
	if let Some(p) = legacy.browser_port {
		rules.push(PortRule { protocol: Protocol::Tcp, public_start: p, public_end: p, private_start: p, private_end: p });
	}
	if let Some(p) = legacy.a2s_port {
		rules.push(PortRule { protocol: Protocol::Udp, public_start: p, public_end: p, private_start: p, private_end: p });
	}
	Ok(rules)
}

fn row_to_policy_entry(row: &sqlx::sqlite::SqliteRow) -> Result<PolicyEntry, StoreError> {
	let addr_str: String = row.try_get("address")?;
	let expires_at: Option<String> = row.try_get("expires_at")?;
	Ok(PolicyEntry {
		address: addr_str.parse().map_err(|_| StoreError::InvalidAddress { field: "policy.address", value: addr_str })?,
		reason: row.try_get("reason")?,
		expires_at: parse_opt_datetime(expires_at)?,
	})
}
