pub mod app;
pub mod config;
pub mod error;
pub mod reconciler;

pub use config::RuntimeConfig;
pub use error::ReconcileError;
pub use reconciler::Reconciler;
