//! Task: ask the init system to start the unit.

use super::{ProvisionCtx, advance, cancellable, log_task_error, task_start};
use crate::errors::VmletResult;
use crate::pipeline::PipelineTask;
use crate::vmm::VmPhase;
use async_trait::async_trait;

pub struct UnitStartTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for UnitStartTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> VmletResult<()> {
        let task_name = self.name();
        let (vm, cancel) = task_start(&ctx, task_name).await?;

        let (supervisor, unit_name, job_mode) = {
            let ctx = ctx.lock().await;
            (ctx.supervisor.clone(), ctx.spec.unit_name(), ctx.job_mode)
        };

        cancellable(&cancel, task_name, supervisor.start_unit(&unit_name, job_mode))
            .await
            .inspect_err(|e| log_task_error(&vm, task_name, e))?;

        tracing::info!(vm = %vm, unit = %unit_name, job_mode = %job_mode, "Start job accepted");
        advance(&ctx, VmPhase::Started).await
    }

    fn name(&self) -> &str {
        "unit_start"
    }
}
