use crate::pipeline::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub name: &'static str,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.tasks()
            .find(|task| task.name == name)
            .map(|task| task.duration_ms)
    }

    /// Task names in completion order within each stage.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }

    pub fn log_summary(&self, run_id: &str) {
        for stage in &self.stages {
            for task in &stage.tasks {
                tracing::info!(
                    run_id,
                    stage = stage.name,
                    task = %task.name,
                    duration_ms = task.duration_ms as u64,
                    "Task timing"
                );
            }
        }
        tracing::info!(
            run_id,
            total_ms = self.total_duration_ms as u64,
            stages = self.stages.len(),
            "Pipeline completed"
        );
    }
}
