// kiln-core/src/pipeline/mod.rs
//! Installing many formulae at once.
//!
//! The planner turns targets into a dependency-ordered job list, the runner hands
//! ready jobs to the worker pool and fails the dependents of failed jobs.
pub mod engine;
pub mod planner;
pub mod runner;
mod worker;

pub use planner::OperationPlanner;
pub use runner::{run_pipeline, PipelineSummary};
