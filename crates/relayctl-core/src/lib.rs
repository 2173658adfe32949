pub mod cidr;
pub mod drain;
pub mod model;
pub mod net;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod version;
