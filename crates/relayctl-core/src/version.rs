use std::fmt::{self, Display, Formatter};

/// Version and build metadata surfaced over the readiness/metrics endpoints
/// and included in audit events on startup.
#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub git_revision: String,
	pub rust_version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: env!("CARGO_PKG_VERSION").to_string(),
			git_revision: option_env!("RELAYCTL_GIT_REVISION")
				.unwrap_or("unknown")
				.to_string(),
			rust_version: option_env!("RELAYCTL_RUSTC_VERSION")
				.unwrap_or("unknown")
				.to_string(),
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"relayctl {} ({}, rustc {})",
			self.version, self.git_revision, self.rust_version
		)
	}
}
