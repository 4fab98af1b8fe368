//! fwrebuild: iptables rule compiler and rebuild task orchestrator
//!
//! Rule records are compiled into iptables commands, assembled into a
//! per-server script, and applied asynchronously by an `Executor` under a
//! tracked `RebuildTask`. The `api` module exposes the whole thing over HTTP.

pub mod api;
pub mod assembler;
pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod rule;
pub mod rule_store;
pub mod stats;
pub mod task;

pub use assembler::{assemble, AssembledScript, ScriptFormat};
pub use compiler::compile;
pub use error::{OrchestratorError, Result};
pub use executor::{ExecutionFailure, ExecutionPlan, Executor, ProgressReporter};
pub use orchestrator::RebuildOrchestrator;
pub use registry::{TaskFilter, TaskRegistry};
pub use rule::{RuleId, RuleRecord};
pub use rule_store::{InMemoryRuleStore, RuleStore};
pub use task::{RebuildTask, TaskStatus};
