//! Worker execution lifecycle: launch, supervision, termination.

pub mod manager;
pub mod process_manager;
pub mod process_tree;
pub mod worker_command;

use crate::models::execution::Execution;
use dashmap::DashMap;
use std::sync::Arc;

pub use manager::ExecutionManager;

/// Executions keyed by id, shared with the per-worker monitor tasks.
pub type ExecutionTable = Arc<DashMap<String, Execution>>;
