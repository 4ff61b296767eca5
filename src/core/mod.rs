// Public modules
pub mod ci_gate;
pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod lock;
pub mod notify;
pub mod paths;
pub mod pipeline;
pub mod queue;
pub mod release;
pub mod request;
pub mod runner;
pub mod worker;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use pipeline::{CleanRequest, InstallOutcome, Services};
pub use request::{DeployTarget, DeploymentRequest};
