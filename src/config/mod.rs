pub mod loader;
pub mod types;
pub mod units;

pub use types::{IsolationMode, ManagerConfig, PolysandboxConfig};
