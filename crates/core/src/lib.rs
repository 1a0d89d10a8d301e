// Core types and functionality for dagrun workflow graphs

pub mod config;
pub mod error;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::ExecutorConfig;
pub use error::{DagError, DagResult};
pub use types::*;
