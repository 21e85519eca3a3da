//! kex Workflow - Durable extraction workflows
//!
//! Runs the extraction pipeline as a sequence of checkpointed activities:
//! - `chunk → mentions → entities → relations → ground → assemble → persist → index`
//! - Resume from the last completed activity after a crash or failure
//! - Cooperative cancellation of in-flight activities
//! - Per-execution progress signals
//! - Batch runs with bounded concurrency and retry of failed documents

pub mod batch;
pub mod orchestrator;
pub mod pipeline;
pub mod signals;

pub use batch::{BatchOrchestrator, RetryReport};
pub use orchestrator::{Orchestrator, RunOptions, RunOutcome};
pub use pipeline::{
    ExtractionSummary, Pipeline, PipelineState, SkippedChunk, WorkflowInput, WORKFLOW_TYPE,
};
pub use signals::{SignalHub, Subscription};
