use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database migration failed: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),
	#[error("stored row references unknown origin {0}")]
	DanglingOrigin(uuid::Uuid),
	#[error("malformed port-rule JSON for service {service}: {source}")]
	MalformedRules { service: uuid::Uuid, source: serde_json::Error },
	#[error("{field} is not a valid IPv4 address/CIDR: {value}")]
	InvalidAddress { field: &'static str, value: String },
	#[error("origin tunnel address {0} already in use")]
	DuplicateTunnelAddress(std::net::Ipv4Addr),
}
