pub mod audit;
pub mod error;
pub mod policy;
pub mod smart_ban;
pub mod store;

pub use audit::{AuditEvent, AuditRing, Severity};
pub use error::StoreError;
pub use policy::{evaluate, Evaluation, FastPathBlock, PolicyStatus};
pub use store::{PolicyTableKind, Snapshot, Store};
