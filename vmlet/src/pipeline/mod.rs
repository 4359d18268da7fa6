//! Table-driven pipeline execution.
//!
//! ```text
//! ExecutionPlan → Stages → Tasks
//! ```
//!
//! Stages run in order. Within a stage, tasks run either one after another
//! or concurrently. The first task error stops the pipeline; later stages
//! never start. Tasks share a context value that is cloned per task, so it
//! is normally an `Arc<Mutex<_>>`.

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, PipelineExecutor};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
