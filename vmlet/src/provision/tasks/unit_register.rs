//! Task: make the init system pick up the unit.

use super::{ProvisionCtx, advance, cancellable, log_task_error, task_start};
use crate::errors::VmletResult;
use crate::pipeline::PipelineTask;
use crate::vmm::VmPhase;
use async_trait::async_trait;

pub struct UnitRegisterTask;

#[async_trait]
impl PipelineTask<ProvisionCtx> for UnitRegisterTask {
    async fn run(self: Box<Self>, ctx: ProvisionCtx) -> VmletResult<()> {
        let task_name = self.name();
        let (vm, cancel) = task_start(&ctx, task_name).await?;
        let supervisor = ctx.lock().await.supervisor.clone();

        cancellable(&cancel, task_name, supervisor.reload())
            .await
            .inspect_err(|e| log_task_error(&vm, task_name, e))?;

        tracing::debug!(vm = %vm, "Init system reloaded");
        advance(&ctx, VmPhase::Registered).await
    }

    fn name(&self) -> &str {
        "unit_register"
    }
}
