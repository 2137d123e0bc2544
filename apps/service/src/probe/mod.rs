/// Probe module - performs individual HTTP and TCP reachability checks.
pub mod checker;
pub mod executor;
pub mod types;

pub use executor::ProbeExecutor;
pub use types::{ProbeErrorKind, ProbeResult};
