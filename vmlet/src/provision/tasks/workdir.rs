//! Task: create the VM working directory.

use super::{ProvisionCtx, log_task_error, task_start};
use crate::disk::prepare_working_dir;
use crate::errors::{VmletError, VmletResult};
use crate::pipeline::PipelineTask;
use async_trait::async_trait;

pub struct WorkdirTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for WorkdirTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> VmletResult<()> {
        let task_name = self.name();
        let (vm, cancel) = task_start(&ctx, task_name).await?;

        let working_dir = ctx.lock().await.spec.working_directory().to_path_buf();

        let dir = working_dir.clone();
        tokio::task::spawn_blocking(move || prepare_working_dir(&dir))
            .await
            .map_err(|e| VmletError::Internal(format!("working directory task failed: {}", e)))
            .and_then(|result| result)
            .and_then(|()| {
                if cancel.is_cancelled() {
                    Err(VmletError::Cancelled(task_name.to_string()))
                } else {
                    Ok(())
                }
            })
            .inspect_err(|e| log_task_error(&vm, task_name, e))?;

        tracing::info!(vm = %vm, dir = %working_dir.display(), "Working directory ready");
        Ok(())
    }

    fn name(&self) -> &str {
        "workdir_prepare"
    }
}
